//! Request/reply+noack framed-message RPC (C1).
//!
//! A [`Connection`] owns one stream socket (to the master, or to a direct
//! viewer) and three send modes: [`Connection::request`] blocks until the
//! matching reply frame arrives, [`Connection::request_noack`] is
//! fire-and-forget, and [`Connection::reply`] answers an inbound request
//! preserving its sequence number. All handler dispatch happens on the
//! connection's owning task; an optional pump task only drains the socket
//! into a software queue, it never runs handlers itself, matching the
//! single-dispatch-thread contract in spec.md §5.

pub mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Result, WidgetError};
use wire::{Frame, PacketType};

/// A handler returns either a reply frame (for request-with-ack commands)
/// or `None` (the command was informational / no-ack).
pub type Handler = Arc<dyn Fn(Frame) -> Option<Frame> + Send + Sync>;

#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<u32, Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command_id: u32, handler: Handler) {
        self.handlers.insert(command_id, handler);
    }

    fn dispatch(&self, frame: Frame) -> Option<Frame> {
        match self.handlers.get(&frame.command_id) {
            Some(handler) => handler(frame),
            None => {
                tracing::warn!(command_id = frame.command_id, "no handler registered");
                None
            }
        }
    }
}

/// Hooks invoked on the connection's owning task.
pub trait ConnectionEvents: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
}

struct PendingAcks {
    next_sequence: AtomicU32,
    waiters: Mutex<HashMap<u32, oneshot::Sender<Frame>>>,
}

/// A live connection to the master or to a direct-addr viewer.
pub struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<PendingAcks>,
}

impl Connection {
    /// Splits `stream` into a read loop (spawned onto the current runtime)
    /// and a writer half retained by the returned handle. `dispatch` answers
    /// inbound requests; `events` fires on connect/disconnect.
    pub fn spawn(
        stream: UnixStream,
        dispatch: Arc<DispatchTable>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(PendingAcks {
            next_sequence: AtomicU32::new(1),
            waiters: Mutex::new(HashMap::new()),
        });
        let conn = Arc::new(Self { writer: Mutex::new(write_half), pending: pending.clone() });

        events.connected();
        let conn_for_loop = conn.clone();
        tokio::spawn(async move {
            if let Err(err) = read_loop(read_half, dispatch, pending, conn_for_loop).await {
                tracing::warn!(%err, "connection read loop ended");
            }
            events.disconnected();
        });

        conn
    }

    fn allocate_sequence(&self) -> u32 {
        self.pending.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(wire::io_err)?;
        writer.flush().await.map_err(wire::io_err)
    }

    /// Request-with-ack: blocks until the correlated reply frame arrives.
    pub async fn request(&self, command_id: u32, build: impl FnOnce(&mut Frame)) -> Result<Frame> {
        let sequence = self.allocate_sequence();
        let mut frame = Frame::new(command_id, PacketType::Req, sequence);
        build(&mut frame);

        let (tx, rx) = oneshot::channel();
        self.pending.waiters.lock().await.insert(sequence, tx);

        self.send_frame(&frame).await?;

        rx.await.map_err(|_| WidgetError::Fault("connection closed awaiting reply".into()))
    }

    /// Request-no-ack: fire and forget.
    pub async fn request_noack(&self, command_id: u32, build: impl FnOnce(&mut Frame)) -> Result<()> {
        let sequence = self.allocate_sequence();
        let mut frame = Frame::new(command_id, PacketType::ReqNoAck, sequence);
        build(&mut frame);
        self.send_frame(&frame).await
    }

    /// Reply to an inbound request, preserving its sequence number.
    pub async fn reply(&self, request: &Frame, build: impl FnOnce(&mut Frame)) -> Result<()> {
        let mut frame = Frame::reply_to(request);
        build(&mut frame);
        self.send_frame(&frame).await
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    dispatch: Arc<DispatchTable>,
    pending: Arc<PendingAcks>,
    conn: Arc<Connection>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = wire::decode_length_prefix(len_buf);
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(wire::io_err)?;

        let frame = Frame::decode(&body)?;

        if frame.packet_type == PacketType::Ack {
            if let Some(tx) = pending.waiters.lock().await.remove(&frame.sequence) {
                let _ = tx.send(frame);
            }
            continue;
        }

        if let Some(reply) = dispatch.dispatch(frame) {
            conn.send_frame(&reply).await?;
        }
    }
}

/// A pump channel: when `PROVIDER_COM_CORE_THREAD` is enabled the socket is
/// drained into this queue by a dedicated task, but draining never runs
/// handlers — the owning task still pulls from the queue and dispatches
/// single-threaded, preserving spec.md §5's ordering guarantees.
pub struct PumpQueue {
    receiver: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl PumpQueue {
    pub fn new() -> (mpsc::UnboundedSender<Frame>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { receiver: Mutex::new(rx) })
    }

    pub async fn recv(&self) -> Option<Frame> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_missing_handler_returns_none() {
        let table = DispatchTable::new();
        let frame = Frame::new(1, PacketType::Req, 1);
        assert!(table.dispatch(frame).is_none());
    }

    #[test]
    fn dispatch_table_invokes_registered_handler() {
        let mut table = DispatchTable::new();
        table.register(
            7,
            Arc::new(|frame| Some(Frame::reply_to(&frame).push_int(0))),
        );
        let frame = Frame::new(7, PacketType::Req, 5);
        let reply = table.dispatch(frame).unwrap();
        assert_eq!(reply.sequence, 5);
        assert_eq!(reply.values[0].as_int().unwrap(), 0);
    }
}
