//! Buffer Provider (C2): per-instance pixel-buffer objects.
//!
//! Owns buffer objects keyed by `(kind, package_id, instance_id)`. See
//! spec.md §4.2 for the full operation catalogue this module implements.

pub mod hw;
pub mod shm;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::config::Config;
use crate::error::{wire_code, Result, WidgetError};
use crate::transport::wire::Value;
use crate::transport::Connection;
use hw::GemState;
use shm::Backing;

/// Wire id for the slave-to-master buffer-brokering round trip used by
/// [`Broker::Remote`]. Not part of the Provider Protocol's documented
/// command catalogue (`protocol::commands`) — it is a private implementation
/// detail of how a `Remote` broker gets its backing resource, the way the
/// master/slave handshake itself is private to `Connection`.
const BROKER_ACQUIRE_BUFFER: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    File,
    SharedMemory,
    Pixmap,
    GemPixmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Initialized,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: i32,
    pub height: i32,
    pub bpp: i32,
}

impl Geometry {
    pub fn byte_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * (self.bpp.max(0) as usize)
    }
}

/// A rectangular damage region, as carried by `updated`/`desc_updated`
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DamageRegion {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl DamageRegion {
    /// spec.md §8: a damage rect equal to the full buffer is semantically
    /// equivalent to one whose rect is `(0, 0, width, height)`.
    pub fn full(geometry: Geometry) -> Self {
        Self { x: 0, y: 0, w: geometry.width, h: geometry.height }
    }
}

struct ExtraSlot {
    geometry: Geometry,
    backing: Option<Backing>,
}

/// One Buffer Provider object. `info` (package_id/instance_id) is carried
/// by value rather than as a back-reference into the engine, per DESIGN
/// NOTES §9 — buffers never look instances up through a raw pointer.
pub struct Buffer {
    pub kind: BufferKind,
    pub package_id: String,
    pub instance_id: String,
    pub uri: Option<String>,
    pub geometry: Geometry,
    pub state: BufferState,
    pub auto_align: bool,
    refcount: i32,
    backing: Option<Backing>,
    extra: Vec<ExtraSlot>,
    gem: Option<GemState>,
    frame_skip: u32,
}

impl Buffer {
    fn new(kind: BufferKind, package_id: String, instance_id: String, auto_align: bool, extra_slots: usize) -> Self {
        Self {
            kind,
            package_id,
            instance_id,
            uri: None,
            geometry: Geometry { width: 0, height: 0, bpp: 0 },
            state: BufferState::Initialized,
            auto_align,
            refcount: 0,
            backing: None,
            extra: (0..extra_slots).map(|_| ExtraSlot { geometry: Geometry { width: 0, height: 0, bpp: 0 }, backing: None }).collect(),
            gem: None,
            frame_skip: 0,
        }
    }

    pub fn refcount(&self) -> i32 {
        self.refcount
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    pub fn set_frame_skip(&mut self, n: u32) {
        self.frame_skip = n;
    }
}

/// Where the backing resource for a buffer comes from. `Local` self-brokers
/// file/shm kinds (the image directory is local to this process anyway);
/// `Remote` asks the master over a [`Connection`] for a secured slave that
/// isn't trusted to manage the image directory itself. The connection
/// itself doesn't exist yet when `BufferProvider` is constructed (it's
/// accepted later, on the master socket), so `Remote` holds a cell that
/// `main` fills in once the master connection is up.
pub enum Broker {
    Local,
    Remote(Arc<OnceCell<Arc<Connection>>>),
}

impl Broker {
    async fn acquire(&self, kind: BufferKind, package_id: &str, instance_id: &str, geometry: Geometry) -> Result<(String, Backing)> {
        match kind {
            BufferKind::Pixmap | BufferKind::GemPixmap => {
                return Err(WidgetError::NotSupported("pixmap kinds require a DRM/tbm-capable host".into()));
            }
            _ => {}
        }

        match self {
            Broker::Remote(cell) => {
                let conn = cell.get().ok_or_else(|| {
                    WidgetError::NotSupported("remote buffer brokering requires a live master connection".into())
                })?;
                let reply = conn
                    .request(BROKER_ACQUIRE_BUFFER, |frame| {
                        frame.values.push(Value::Str(package_id.to_string()));
                        frame.values.push(Value::Str(instance_id.to_string()));
                        frame.values.push(Value::Int(geometry.width));
                        frame.values.push(Value::Int(geometry.height));
                        frame.values.push(Value::Int(geometry.bpp));
                    })
                    .await?;
                let status = reply
                    .values
                    .first()
                    .ok_or_else(|| WidgetError::Fault("empty broker reply".into()))?
                    .as_int()?;
                if status != wire_code::OK {
                    return Err(WidgetError::Fault(format!("master declined buffer brokering (status {status})")));
                }
                let uri = reply
                    .values
                    .get(1)
                    .ok_or_else(|| WidgetError::Fault("missing uri in broker reply".into()))?
                    .as_str()?
                    .to_string();
                let path = uri.strip_prefix("file://").unwrap_or(&uri);
                let backing = Backing::new_file(PathBuf::from(path), geometry.byte_len());
                Ok((uri, backing))
            }
            Broker::Local if kind == BufferKind::File => {
                let path = Config::with(|c| c.image_path.join(format!("{package_id}-{instance_id}.png")));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(WidgetError::Io)?;
                }
                let backing = Backing::new_file(path.clone(), geometry.byte_len());
                Ok((format!("file://{}", path.display()), backing))
            }
            Broker::Local => {
                let name = format!("widgetd-{package_id}-{instance_id}");
                let backing = Backing::new_shm(&name, geometry.byte_len())?;
                Ok((format!("shm://{name}"), backing))
            }
        }
    }
}

fn key_of(kind: BufferKind, package_id: &str, instance_id: &str) -> (BufferKind, String, String) {
    (kind, package_id.to_string(), instance_id.to_string())
}

/// Which of an instance's two surfaces an input/accessibility event landed
/// on. Both route through the same per-instance handler; this is how the
/// handler tells a glance-bar tap from a main-widget one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Widget,
    Gbar,
}

/// Events synthesized from inbound master commands and forwarded to the
/// widget via its buffer, per spec.md §4.2 "Event dispatch through
/// buffers".
#[derive(Debug, Clone)]
pub enum BufferEvent {
    Mouse { x: f64, y: f64, device: i32, kind: MouseEventKind },
    Key { code: i32, down: bool },
    Access { x: f64, y: f64, device: i32, kind: AccessEventKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEventKind {
    Down,
    Up,
    Move,
    Enter,
    Leave,
    Set,
    Unset,
    OnScroll,
    OffScroll,
    OnHold,
    OffHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessEventKind {
    HitTest,
    ActionUp,
    ActionDown,
    Scroll,
    Unhighlight,
    ValueChange,
    MouseOver,
}

pub type BufferEventHandler = Arc<dyn Fn(&str, &str, EventTarget, BufferEvent) -> Result<()> + Send + Sync>;

/// The Buffer Provider itself.
pub struct BufferProvider {
    broker: Broker,
    extra_slots: usize,
    buffers: Mutex<HashMap<(BufferKind, String, String), Arc<Mutex<Buffer>>>>,
    handler: Mutex<Option<BufferEventHandler>>,
}

impl BufferProvider {
    pub fn new(broker: Broker, extra_slots: usize) -> Self {
        Self { broker, extra_slots, buffers: Mutex::new(HashMap::new()), handler: Mutex::new(None) }
    }

    pub async fn set_event_handler(&self, handler: BufferEventHandler) {
        *self.handler.lock().await = Some(handler);
    }

    /// Allocates the handle in state `Initialized`; no OS resource yet.
    pub async fn create(&self, kind: BufferKind, package_id: &str, instance_id: &str, auto_align: bool) -> Arc<Mutex<Buffer>> {
        let buffer = Arc::new(Mutex::new(Buffer::new(kind, package_id.to_string(), instance_id.to_string(), auto_align, self.extra_slots)));
        self.buffers.lock().await.insert(key_of(kind, package_id, instance_id), buffer.clone());
        buffer
    }

    pub async fn find_buffer(&self, kind: BufferKind, package_id: &str, instance_id: &str) -> Option<Arc<Mutex<Buffer>>> {
        self.buffers.lock().await.get(&key_of(kind, package_id, instance_id)).cloned()
    }

    /// Requests the backing resource, transitioning `Initialized -> Created`.
    pub async fn acquire(&self, buf: &Arc<Mutex<Buffer>>, width: i32, height: i32, bpp: i32) -> Result<()> {
        let geometry = Geometry { width, height, bpp };
        let (kind, package_id, instance_id) = {
            let b = buf.lock().await;
            (b.kind, b.package_id.clone(), b.instance_id.clone())
        };
        let (uri, backing) = self.broker.acquire(kind, &package_id, &instance_id, geometry).await?;

        let mut b = buf.lock().await;
        b.uri = Some(uri);
        b.geometry = geometry;
        b.backing = Some(backing);
        b.state = BufferState::Created;
        Ok(())
    }

    /// Same as `acquire` for an extra-buffer slot.
    pub async fn acquire_extra(&self, buf: &Arc<Mutex<Buffer>>, slot: usize, width: i32, height: i32, bpp: i32) -> Result<()> {
        let geometry = Geometry { width, height, bpp };
        let (kind, package_id, instance_id, bound) = {
            let b = buf.lock().await;
            (b.kind, b.package_id.clone(), b.instance_id.clone(), b.extra.len())
        };
        if slot >= bound {
            return Err(WidgetError::OutOfRange { index: slot, bound });
        }

        let (_uri, backing) = self.broker.acquire(kind, &package_id, &instance_id, geometry).await?;

        let mut b = buf.lock().await;
        let slot_entry = &mut b.extra[slot];
        slot_entry.geometry = geometry;
        slot_entry.backing = Some(backing);
        Ok(())
    }

    /// Drops an extra-buffer slot's backing without touching the others.
    pub async fn release_extra(&self, buf: &Arc<Mutex<Buffer>>, slot: usize) -> Result<()> {
        let mut b = buf.lock().await;
        let bound = b.extra.len();
        let slot_entry = b.extra.get_mut(slot).ok_or(WidgetError::OutOfRange { index: slot, bound })?;
        slot_entry.backing = None;
        Ok(())
    }

    /// Swaps in a new backing without destroying the handle; the caller is
    /// responsible for not holding stale `ref`s across a resize.
    pub async fn resize(&self, buf: &Arc<Mutex<Buffer>>, width: i32, height: i32) -> Result<()> {
        let bpp = buf.lock().await.geometry.bpp;
        self.acquire(buf, width, height, bpp).await
    }

    /// Drops master-allocated backing but keeps the handle: `Created ->
    /// Initialized`.
    pub async fn release(&self, buf: &Arc<Mutex<Buffer>>) -> Result<()> {
        let mut b = buf.lock().await;
        if b.refcount > 0 {
            return Err(WidgetError::ResourceBusy(format!(
                "buffer {}/{} still referenced ({} refs)",
                b.package_id, b.instance_id, b.refcount
            )));
        }
        b.backing = None;
        b.uri = None;
        b.state = BufferState::Initialized;
        Ok(())
    }

    /// Requires `Initialized`; frees the handle.
    pub async fn destroy(&self, buf: &Arc<Mutex<Buffer>>) -> Result<()> {
        {
            let b = buf.lock().await;
            if b.state != BufferState::Initialized {
                return Err(WidgetError::InvalidArgument(
                    "destroy requires the buffer to be released first".into(),
                ));
            }
        }
        let (kind, package_id, instance_id) = {
            let b = buf.lock().await;
            (b.kind, b.package_id.clone(), b.instance_id.clone())
        };
        self.buffers.lock().await.remove(&key_of(kind, &package_id, &instance_id));
        Ok(())
    }

    /// Increments refcount and returns the mapped pixel data. SHM kinds are
    /// idempotent since the OS itself tracks the attach count.
    pub async fn get_ref(&self, buf: &Arc<Mutex<Buffer>>) -> Result<()> {
        let mut b = buf.lock().await;
        if b.backing.is_none() {
            return Err(WidgetError::InvalidArgument("ref on a buffer with no backing".into()));
        }
        b.refcount += 1;
        Ok(())
    }

    pub async fn unref(&self, buf: &Arc<Mutex<Buffer>>) -> Result<()> {
        let mut b = buf.lock().await;
        if b.refcount == 0 {
            return Err(WidgetError::InvalidArgument("unref without a matching ref".into()));
        }
        b.refcount -= 1;
        Ok(())
    }

    /// File kind: grabs the lock, writes the buffer, releases. Pixmap/SHM:
    /// no-op at this abstraction level (real display-server sync lives
    /// behind the `hw-buffers` feature).
    pub async fn sync(&self, buf: &Arc<Mutex<Buffer>>) -> Result<()> {
        let b = buf.lock().await;
        if let Some(backing) = &b.backing {
            backing.sync_to_disk()?;
        }
        Ok(())
    }

    pub async fn is_support_hw(&self, buf: &Arc<Mutex<Buffer>>) -> bool {
        buf.lock().await.kind == BufferKind::GemPixmap && cfg!(feature = "hw-buffers")
    }

    /// Heap copy of the current surface.
    pub async fn dump_frame(&self, buf: &Arc<Mutex<Buffer>>) -> Result<Vec<u8>> {
        let b = buf.lock().await;
        match &b.backing {
            Some(backing) => Ok(backing.as_slice().to_vec()),
            None => Err(WidgetError::InvalidArgument("dump_frame on an unacquired buffer".into())),
        }
    }

    pub async fn frame_skip(&self, buf: &Arc<Mutex<Buffer>>) -> u32 {
        buf.lock().await.frame_skip()
    }

    pub async fn clear_frame_skip(&self, buf: &Arc<Mutex<Buffer>>) {
        buf.lock().await.set_frame_skip(0);
    }

    /// Dispatches an input/accessibility/key event to the buffer's
    /// registered handler, scaling mouse/access coordinates by the supplied
    /// source-rect ratio when it differs from `(1.0, 1.0)`. If no handler is
    /// registered the caller must answer the master with an error status so
    /// the viewer doesn't wait forever (spec.md §4.2).
    pub async fn dispatch_event(&self, package_id: &str, instance_id: &str, target: EventTarget, mut event: BufferEvent, ratio: (f64, f64)) -> Result<()> {
        if ratio != (1.0, 1.0) {
            match &mut event {
                BufferEvent::Mouse { x, y, .. } => {
                    *x *= ratio.0;
                    *y *= ratio.1;
                }
                BufferEvent::Access { x, y, .. } => {
                    *x *= ratio.0;
                    *y *= ratio.1;
                }
                BufferEvent::Key { .. } => {}
            }
        }

        let handler = self.handler.lock().await.clone();
        match handler {
            Some(handler) => handler(package_id, instance_id, target, event),
            None => Err(WidgetError::NotSupported("no buffer event handler registered".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> BufferProvider {
        BufferProvider::new(Broker::Local, 4)
    }

    #[tokio::test]
    async fn acquire_then_release_then_acquire_yields_fresh_zero_refcount_buffer() {
        let provider = provider();
        let buf = provider.create(BufferKind::SharedMemory, "org.example.clock", "file:///tmp/w1.png", false).await;

        provider.acquire(&buf, 348, 348, 4).await.unwrap();
        let geom1 = buf.lock().await.geometry;
        provider.release(&buf).await.unwrap();
        provider.acquire(&buf, 348, 348, 4).await.unwrap();
        let geom2 = buf.lock().await.geometry;

        assert_eq!(geom1, geom2);
        assert_eq!(buf.lock().await.refcount(), 0);
    }

    #[tokio::test]
    async fn destroy_while_referenced_is_rejected_by_release() {
        let provider = provider();
        let buf = provider.create(BufferKind::SharedMemory, "pkg", "id", false).await;
        provider.acquire(&buf, 16, 16, 4).await.unwrap();
        provider.get_ref(&buf).await.unwrap();

        assert!(provider.release(&buf).await.is_err());
        provider.unref(&buf).await.unwrap();
        assert!(provider.release(&buf).await.is_ok());
        assert!(provider.destroy(&buf).await.is_ok());
    }

    #[tokio::test]
    async fn ref_without_backing_errors() {
        let provider = provider();
        let buf = provider.create(BufferKind::File, "pkg", "id", false).await;
        assert!(provider.get_ref(&buf).await.is_err());
    }

    #[tokio::test]
    async fn unref_without_ref_errors() {
        let provider = provider();
        let buf = provider.create(BufferKind::File, "pkg", "id", false).await;
        provider.acquire(&buf, 4, 4, 4).await.unwrap();
        assert!(provider.unref(&buf).await.is_err());
    }

    #[tokio::test]
    async fn extra_slot_out_of_range_is_rejected() {
        let provider = provider();
        let buf = provider.create(BufferKind::File, "pkg", "id", false).await;
        let result = provider.acquire_extra(&buf, 99, 4, 4, 4).await;
        assert!(matches!(result, Err(WidgetError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn release_extra_clears_only_that_slot() {
        let provider = provider();
        let buf = provider.create(BufferKind::File, "pkg", "id", false).await;
        provider.acquire_extra(&buf, 0, 4, 4, 4).await.unwrap();
        provider.acquire_extra(&buf, 1, 4, 4, 4).await.unwrap();
        provider.release_extra(&buf, 0).await.unwrap();
        let b = buf.lock().await;
        assert!(b.extra[0].backing.is_none());
        assert!(b.extra[1].backing.is_some());
    }

    #[tokio::test]
    async fn remote_broker_without_a_live_connection_is_not_supported() {
        let cell = Arc::new(OnceCell::new());
        let provider = BufferProvider::new(Broker::Remote(cell), 0);
        let buf = provider.create(BufferKind::File, "pkg", "id", false).await;
        let result = provider.acquire(&buf, 4, 4, 4).await;
        assert!(matches!(result, Err(WidgetError::NotSupported(_))));
    }

    #[tokio::test]
    async fn full_damage_region_equals_explicit_rect() {
        let geometry = Geometry { width: 348, height: 348, bpp: 4 };
        let full = DamageRegion::full(geometry);
        let explicit = DamageRegion { x: 0, y: 0, w: 348, h: 348 };
        assert_eq!(full, explicit);
    }

    #[tokio::test]
    async fn dispatch_without_handler_errors_instead_of_hanging() {
        let provider = provider();
        let event = BufferEvent::Mouse { x: 1.0, y: 2.0, device: 0, kind: MouseEventKind::Down };
        let result = provider.dispatch_event("pkg", "id", EventTarget::Widget, event, (1.0, 1.0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mouse_event_scaled_by_source_rect_ratio() {
        let provider = provider();
        let seen = Arc::new(Mutex::new((0.0f64, 0.0f64)));
        let seen_clone = seen.clone();
        provider
            .set_event_handler(Arc::new(move |_pkg, _id, _target, event| {
                if let BufferEvent::Mouse { x, y, .. } = event {
                    let seen_clone = seen_clone.clone();
                    tokio::spawn(async move {
                        *seen_clone.lock().await = (x, y);
                    });
                }
                Ok(())
            }))
            .await;

        provider
            .dispatch_event(
                "pkg",
                "id",
                EventTarget::Widget,
                BufferEvent::Mouse { x: 10.0, y: 20.0, device: 0, kind: MouseEventKind::Move },
                (0.5, 0.5),
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        let (x, y) = *seen.lock().await;
        assert_eq!((x, y), (5.0, 10.0));
    }
}
