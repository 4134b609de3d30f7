//! End-to-end: a real `UnixStream` pair standing in for the master/slave
//! socket, driving a `new` request through the dispatch table into the
//! engine and back out as an ack frame.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UnixStream;

use widgetd_core::buffer::{Broker, BufferEvent, BufferProvider, EventTarget, MouseEventKind};
use widgetd_core::direct::DirectRegistry;
use widgetd_core::engine::Engine;
use widgetd_core::error::Result;
use widgetd_core::protocol::{self, commands};
use widgetd_core::so_handler::{DestroyReason, SoHandler, UpdateResult, WidgetCapabilities};
use widgetd_core::transport::wire::Value;
use widgetd_core::transport::{Connection, ConnectionEvents, DispatchTable};
use widgetd_core::update_monitor::UpdateMonitor;

struct NoopEvents;
impl ConnectionEvents for NoopEvents {}

struct AlwaysCreated {
    update_calls: AtomicUsize,
}

impl WidgetCapabilities for AlwaysCreated {
    fn create(&self, _filename: &str, _content: &str, _cluster: &str, _category: &str) -> Result<()> {
        Ok(())
    }
    fn destroy(&self, _filename: &str, _reason: DestroyReason) -> Result<()> {
        Ok(())
    }
    fn is_updated(&self, _filename: &str) -> Result<bool> {
        Ok(true)
    }
    fn update_content(&self, _filename: &str) -> Result<UpdateResult> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateResult::empty())
    }
}

#[tokio::test]
async fn new_request_over_the_wire_creates_an_instance() {
    let so_handler = Arc::new(SoHandler::new(true));
    so_handler
        .register_for_test("org.example.clock", 5, false, Arc::new(AlwaysCreated { update_calls: AtomicUsize::new(0) }))
        .await
        .unwrap();

    let buffers = Arc::new(BufferProvider::new(Broker::Local, 0));
    let monitor = Arc::new(UpdateMonitor::new());
    let direct = Arc::new(DirectRegistry::new());
    let (engine, _outbound_rx) = Engine::new(so_handler, buffers, monitor, direct);

    let dispatch = Arc::new(protocol::build_dispatch_table(engine.clone()));
    let (slave_stream, master_stream) = UnixStream::pair().unwrap();
    Connection::spawn(slave_stream, dispatch, Arc::new(NoopEvents));
    let master = Connection::spawn(master_stream, Arc::new(DispatchTable::new()), Arc::new(NoopEvents));

    let reply = master
        .request(commands::NEW, |frame| {
            frame.values.push(Value::Str("org.example.clock".into()));
            frame.values.push(Value::Str("file:///tmp/w1.png".into()));
            frame.values.push(Value::Str(String::new()));
            frame.values.push(Value::Int(0));
            frame.values.push(Value::Int(0));
            frame.values.push(Value::Double(0.0));
            frame.values.push(Value::Str("user,created".into()));
            frame.values.push(Value::Str("default".into()));
            frame.values.push(Value::Int(1));
            frame.values.push(Value::Int(348));
            frame.values.push(Value::Int(200));
            frame.values.push(Value::Str(String::new()));
            frame.values.push(Value::Int(0));
        })
        .await
        .unwrap();

    assert_eq!(reply.values[0].as_int().unwrap(), 0);
    assert_eq!(reply.values[1].as_int().unwrap(), 348);
    assert_eq!(reply.values[2].as_int().unwrap(), 200);
    assert_eq!(engine.instance_count().await, 1);

    let second = master
        .request(commands::NEW, |frame| {
            frame.values.push(Value::Str("org.example.clock".into()));
            frame.values.push(Value::Str("file:///tmp/w1.png".into()));
            frame.values.push(Value::Str(String::new()));
            frame.values.push(Value::Int(0));
            frame.values.push(Value::Int(0));
            frame.values.push(Value::Double(0.0));
            frame.values.push(Value::Str("user,created".into()));
            frame.values.push(Value::Str("default".into()));
            frame.values.push(Value::Int(1));
            frame.values.push(Value::Int(348));
            frame.values.push(Value::Int(200));
            frame.values.push(Value::Str(String::new()));
            frame.values.push(Value::Int(0));
        })
        .await
        .unwrap();
    // already exists -> negative status, not a second instance
    assert!(second.values[0].as_int().unwrap() < 0);
    assert_eq!(engine.instance_count().await, 1);
}

#[tokio::test]
async fn pause_all_is_a_fire_and_forget_noack() {
    let so_handler = Arc::new(SoHandler::new(true));
    let buffers = Arc::new(BufferProvider::new(Broker::Local, 0));
    let monitor = Arc::new(UpdateMonitor::new());
    let direct = Arc::new(DirectRegistry::new());
    let (engine, _outbound_rx) = Engine::new(so_handler, buffers, monitor, direct);

    let dispatch = Arc::new(protocol::build_dispatch_table(engine));
    let (slave_stream, master_stream) = UnixStream::pair().unwrap();
    Connection::spawn(slave_stream, dispatch, Arc::new(NoopEvents));
    let master = Connection::spawn(master_stream, Arc::new(DispatchTable::new()), Arc::new(NoopEvents));

    master.request_noack(commands::PAUSE_ALL, |_frame| {}).await.unwrap();
    // give the slave's read loop a turn; nothing should arrive back since
    // the handler intentionally returns no reply for this command.
    tokio::task::yield_now().await;
}

#[tokio::test]
async fn widget_mouse_down_over_the_wire_reaches_the_buffer_handler() {
    let so_handler = Arc::new(SoHandler::new(true));
    let buffers = Arc::new(BufferProvider::new(Broker::Local, 0));
    let seen: Arc<std::sync::Mutex<Vec<(String, String, EventTarget, BufferEvent)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_for_handler = seen.clone();
    buffers
        .set_event_handler(Arc::new(move |package_id, instance_id, target, event| {
            seen_for_handler.lock().unwrap().push((package_id.to_string(), instance_id.to_string(), target, event));
            Ok(())
        }))
        .await;
    let monitor = Arc::new(UpdateMonitor::new());
    let direct = Arc::new(DirectRegistry::new());
    let (engine, _outbound_rx) = Engine::new(so_handler, buffers, monitor, direct);

    let dispatch = Arc::new(protocol::build_dispatch_table(engine));
    let (slave_stream, master_stream) = UnixStream::pair().unwrap();
    Connection::spawn(slave_stream, dispatch, Arc::new(NoopEvents));
    let master = Connection::spawn(master_stream, Arc::new(DispatchTable::new()), Arc::new(NoopEvents));

    let reply = master
        .request(commands::WIDGET_MOUSE_DOWN, |frame| {
            frame.values.push(Value::Str("org.example.clock".into()));
            frame.values.push(Value::Str("w1".into()));
            frame.values.push(Value::Double(12.0));
            frame.values.push(Value::Double(34.0));
            frame.values.push(Value::Int(0));
        })
        .await
        .unwrap();

    assert_eq!(reply.values[0].as_int().unwrap(), 0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (package_id, instance_id, target, event) = &seen[0];
    assert_eq!(package_id, "org.example.clock");
    assert_eq!(instance_id, "w1");
    assert_eq!(*target, EventTarget::Widget);
    assert!(matches!(event, BufferEvent::Mouse { x, y, device: 0, kind: MouseEventKind::Down } if *x == 12.0 && *y == 34.0));
}
