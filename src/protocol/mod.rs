//! Provider Protocol (C6): turns the Instance Engine into something that
//! speaks the wire format of spec.md §6.
//!
//! Inbound commands are dispatched through [`crate::transport::DispatchTable`],
//! whose handler type is deliberately synchronous (spec.md §5's single-
//! dispatch-thread contract, carried over from the teacher's C1 module).
//! Engine operations are `async`, so each handler here bridges with
//! `tokio::task::block_in_place` + `Handle::block_on` — a documented pattern
//! for calling async code from a sync callback on a multi-thread runtime,
//! rather than threading `async fn` through a trait object the teacher's
//! transport layer was never designed to hold.
//!
//! Outbound events (the engine's [`EngineEvent`] stream) are drained by
//! [`run_outbound`], which performs the direct-addr-then-master fallback of
//! spec.md §4.5 rule 9: an instance with a live direct-viewer connection is
//! told directly; everyone else hears it through the master socket.

pub mod commands;
pub mod outbound;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::buffer::{AccessEventKind, BufferEvent, EventTarget, MouseEventKind};
use crate::config::Config;
use crate::direct::DirectRegistry;
use crate::engine::{Engine, EngineEvent, NewArgs, RenewArgs};
use crate::error::{wire_code, Result, WidgetError};
use crate::so_handler::DestroyReason;
use crate::transport::wire::Frame;
use crate::transport::{Connection, DispatchTable, Handler};

fn str_at(frame: &Frame, i: usize) -> Result<String> {
    frame
        .values
        .get(i)
        .ok_or_else(|| WidgetError::InvalidArgument(format!("missing atom {i}")))?
        .as_str()
        .map(str::to_string)
}

fn int_at(frame: &Frame, i: usize) -> Result<i32> {
    frame
        .values
        .get(i)
        .ok_or_else(|| WidgetError::InvalidArgument(format!("missing atom {i}")))?
        .as_int()
}

fn double_at(frame: &Frame, i: usize) -> Result<f64> {
    frame
        .values
        .get(i)
        .ok_or_else(|| WidgetError::InvalidArgument(format!("missing atom {i}")))?
        .as_double()
}

fn bool_at(frame: &Frame, i: usize) -> Result<bool> {
    Ok(int_at(frame, i)? != 0)
}

fn destroy_reason_from(code: i32) -> DestroyReason {
    match code {
        1 => DestroyReason::Uninstall,
        2 => DestroyReason::Upgrade,
        3 => DestroyReason::Terminate,
        4 => DestroyReason::Fault,
        5 => DestroyReason::Temporary,
        0 => DestroyReason::Default,
        _ => DestroyReason::Unknown,
    }
}

fn status_frame(request: &Frame, status: i32) -> Frame {
    Frame::reply_to(request).push_int(status)
}

fn err_status(err: &WidgetError) -> i32 {
    err.wire_code()
}

/// Blocks the current worker thread on an async closure. Only valid from a
/// handler invoked off the multi-thread runtime's read loop, never from
/// inside another `block_in_place`.
fn run_blocking<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

/// Atom layout for `new` (13 atoms, indices 0-12); `renew` appends
/// `hold_scroll` (13) and `active_update` (14).
fn new_args_from(frame: &Frame) -> Result<NewArgs> {
    let direct_addr_raw = str_at(frame, 11)?;
    Ok(NewArgs {
        package_id: str_at(frame, 0)?,
        instance_id: str_at(frame, 1)?,
        content: str_at(frame, 2)?,
        timeout: match int_at(frame, 3)? {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs.max(0) as u64)),
        },
        has_widget_script: bool_at(frame, 4)?,
        period: double_at(frame, 5)?,
        cluster: str_at(frame, 6)?,
        category: str_at(frame, 7)?,
        skip_need_to_create: bool_at(frame, 8)?,
        width: int_at(frame, 9)?,
        height: int_at(frame, 10)?,
        direct_addr: if direct_addr_raw.is_empty() { None } else { Some(direct_addr_raw) },
        degree: int_at(frame, 12)?,
    })
}

/// Atom layout shared by every `*_mouse_*` command: package_id(0),
/// instance_id(1), x(2), y(3), device(4).
fn mouse_event_args(frame: &Frame, kind: MouseEventKind) -> Result<(String, String, BufferEvent)> {
    let package_id = str_at(frame, 0)?;
    let instance_id = str_at(frame, 1)?;
    let x = double_at(frame, 2)?;
    let y = double_at(frame, 3)?;
    let device = int_at(frame, 4)?;
    Ok((package_id, instance_id, BufferEvent::Mouse { x, y, device, kind }))
}

/// Atom layout shared by every `*_access_*` command, same shape as mouse.
fn access_event_args(frame: &Frame, kind: AccessEventKind) -> Result<(String, String, BufferEvent)> {
    let package_id = str_at(frame, 0)?;
    let instance_id = str_at(frame, 1)?;
    let x = double_at(frame, 2)?;
    let y = double_at(frame, 3)?;
    let device = int_at(frame, 4)?;
    Ok((package_id, instance_id, BufferEvent::Access { x, y, device, kind }))
}

/// Atom layout shared by `*_key_down`/`*_key_up`: package_id(0),
/// instance_id(1), code(2).
fn key_event_args(frame: &Frame, down: bool) -> Result<(String, String, BufferEvent)> {
    let package_id = str_at(frame, 0)?;
    let instance_id = str_at(frame, 1)?;
    let code = int_at(frame, 2)?;
    Ok((package_id, instance_id, BufferEvent::Key { code, down }))
}

/// Registers a mouse-input command: parses its atoms, forwards to the
/// instance's buffer handler, and acks with a bare status.
fn register_mouse(table: &mut DispatchTable, engine: &Arc<Engine>, cmd: u32, target: EventTarget, kind: MouseEventKind) {
    table.register(cmd, handler(engine.clone(), move |engine, frame| {
        let (package_id, instance_id, event) = mouse_event_args(&frame, kind)?;
        run_blocking(engine.dispatch_buffer_event(&package_id, &instance_id, target, event, (1.0, 1.0)))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));
}

fn register_access(table: &mut DispatchTable, engine: &Arc<Engine>, cmd: u32, target: EventTarget, kind: AccessEventKind) {
    table.register(cmd, handler(engine.clone(), move |engine, frame| {
        let (package_id, instance_id, event) = access_event_args(&frame, kind)?;
        run_blocking(engine.dispatch_buffer_event(&package_id, &instance_id, target, event, (1.0, 1.0)))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));
}

fn register_key(table: &mut DispatchTable, engine: &Arc<Engine>, cmd: u32, target: EventTarget, down: bool) {
    table.register(cmd, handler(engine.clone(), move |engine, frame| {
        let (package_id, instance_id, event) = key_event_args(&frame, down)?;
        run_blocking(engine.dispatch_buffer_event(&package_id, &instance_id, target, event, (1.0, 1.0)))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));
}

fn new_reply_frame(request: &Frame, reply: &crate::engine::NewReply) -> Frame {
    Frame::reply_to(request)
        .push_int(reply.status)
        .push_int(reply.width)
        .push_int(reply.height)
        .push_double(reply.priority)
        .push_str(reply.content.clone())
        .push_str(reply.title.clone())
        .push_int(reply.pinned as i32)
}

/// Builds the inbound dispatch table for one slave process. `engine` is
/// shared with [`run_outbound`]; `direct` lets `new`/`renew`/viewer-connect
/// commands register a direct-addr connection once it is dialed.
pub fn build_dispatch_table(engine: Arc<Engine>) -> DispatchTable {
    let mut table = DispatchTable::new();

    table.register(commands::NEW, handler(engine.clone(), |engine, frame| {
        let args = new_args_from(&frame)?;
        let reply = run_blocking(engine.new_instance(args))?;
        Ok(new_reply_frame(&frame, &reply))
    }));

    table.register(commands::RENEW, handler(engine.clone(), |engine, frame| {
        let base = new_args_from(&frame)?;
        let hold_scroll = bool_at(&frame, 13)?;
        let active_update = bool_at(&frame, 14)?;
        let reply = run_blocking(engine.renew_instance(RenewArgs { base, hold_scroll, active_update }))?;
        Ok(new_reply_frame(&frame, &reply))
    }));

    table.register(commands::DELETE, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let reason = destroy_reason_from(int_at(&frame, 2)?);
        run_blocking(engine.delete_instance(&package_id, &instance_id, reason))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::RESIZE, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let width = int_at(&frame, 2)?;
        let height = int_at(&frame, 3)?;
        run_blocking(engine.resize_instance(&package_id, &instance_id, width, height))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::SET_PERIOD, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let period = double_at(&frame, 2)?;
        run_blocking(engine.set_period(&package_id, &instance_id, period))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::CHANGE_GROUP, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let cluster = str_at(&frame, 2)?;
        let category = str_at(&frame, 3)?;
        run_blocking(engine.change_group(&package_id, &instance_id, &cluster, &category))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::UPDATE_CONTENT, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id_raw = str_at(&frame, 1)?;
        let cluster = str_at(&frame, 2)?;
        let category = str_at(&frame, 3)?;
        let content = str_at(&frame, 4)?;
        let force = bool_at(&frame, 5)?;
        let instance_id = if instance_id_raw.is_empty() { None } else { Some(instance_id_raw.as_str()) };
        let existed = run_blocking(engine.update_content(&package_id, instance_id, &cluster, &category, &content, force))?;
        Ok(Frame::reply_to(&frame).push_int(wire_code::OK).push_int(existed as i32))
    }));

    table.register(commands::PINUP, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let pin = bool_at(&frame, 2)?;
        let uri = run_blocking(engine.pinup(&package_id, &instance_id, pin))?;
        Ok(Frame::reply_to(&frame).push_int(wire_code::OK).push_str(uri))
    }));

    table.register(commands::CLICKED, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let event = str_at(&frame, 2)?;
        let timestamp = double_at(&frame, 3)?;
        let x = double_at(&frame, 4)?;
        let y = double_at(&frame, 5)?;
        if let Err(err) = run_blocking(engine.clicked(&package_id, &instance_id, &event, timestamp, x, y)) {
            tracing::debug!(%err, "clicked handler failed");
        }
        Err(WidgetError::NotSupported("no-ack".into()))
    }));

    table.register(commands::TEXT_SIGNAL, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let signal = str_at(&frame, 2)?;
        let source = str_at(&frame, 3)?;
        if let Err(err) = run_blocking(engine.text_signal(&package_id, &instance_id, &signal, &source)) {
            tracing::debug!(%err, "text_signal handler failed");
        }
        Err(WidgetError::NotSupported("no-ack".into()))
    }));

    table.register(commands::PAUSE_ALL, handler(engine.clone(), |engine, _frame| {
        run_blocking(engine.pause_all());
        Err(WidgetError::NotSupported("no-ack".into()))
    }));

    table.register(commands::RESUME_ALL, handler(engine.clone(), |engine, _frame| {
        run_blocking(engine.resume_all());
        Err(WidgetError::NotSupported("no-ack".into()))
    }));

    table.register(commands::WIDGET_PAUSE, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        if let Err(err) = run_blocking(engine.widget_pause(&package_id, &instance_id)) {
            tracing::debug!(%err, "widget_pause handler failed");
        }
        Err(WidgetError::NotSupported("no-ack".into()))
    }));

    table.register(commands::WIDGET_RESUME, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        if let Err(err) = run_blocking(engine.widget_resume(&package_id, &instance_id)) {
            tracing::debug!(%err, "widget_resume handler failed");
        }
        Err(WidgetError::NotSupported("no-ack".into()))
    }));

    table.register(commands::UPDATE_MODE, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let active_update = bool_at(&frame, 2)?;
        run_blocking(engine.update_mode(&package_id, &instance_id, active_update))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::ORIENTATION, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let degree = int_at(&frame, 2)?;
        run_blocking(engine.orientation(&package_id, &instance_id, degree))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::SET_WIDGET_SHOW, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let shown = bool_at(&frame, 2)?;
        run_blocking(engine.set_widget_show(&package_id, &instance_id, shown))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::GBAR_OPEN, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        run_blocking(engine.gbar_open(&package_id, &instance_id))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::GBAR_CLOSE, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        run_blocking(engine.gbar_close(&package_id, &instance_id))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::HELLO, handler(engine.clone(), |_engine, frame| {
        let (slave_name, secured, abi) = Config::with(|c| (c.slave_name.clone(), c.secured, c.abi.clone()));
        Ok(Frame::reply_to(&frame).push_int(wire_code::OK).push_str(slave_name).push_int(secured as i32).push_str(abi))
    }));

    table.register(commands::HELLO_SYNC_PREPARE, handler(engine.clone(), |_engine, frame| {
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::HELLO_SYNC, handler(engine.clone(), |_engine, frame| {
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::ACQUIRE_BUFFER, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let width = int_at(&frame, 2)?;
        let height = int_at(&frame, 3)?;
        let bpp = int_at(&frame, 4)?;
        let auto_align = bool_at(&frame, 5)?;
        let uri = run_blocking(engine.acquire_buffer(&package_id, &instance_id, width, height, bpp, auto_align))?;
        Ok(Frame::reply_to(&frame).push_int(wire_code::OK).push_str(uri))
    }));

    table.register(commands::ACQUIRE_XBUFFER, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let slot = int_at(&frame, 2)?.max(0) as usize;
        let width = int_at(&frame, 3)?;
        let height = int_at(&frame, 4)?;
        let bpp = int_at(&frame, 5)?;
        run_blocking(engine.acquire_xbuffer(&package_id, &instance_id, slot, width, height, bpp))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::RELEASE_BUFFER, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        run_blocking(engine.release_buffer(&package_id, &instance_id))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::RELEASE_XBUFFER, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let slot = int_at(&frame, 2)?.max(0) as usize;
        run_blocking(engine.release_xbuffer(&package_id, &instance_id, slot))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    table.register(commands::RESIZE_BUFFER, handler(engine.clone(), |engine, frame| {
        let package_id = str_at(&frame, 0)?;
        let instance_id = str_at(&frame, 1)?;
        let width = int_at(&frame, 2)?;
        let height = int_at(&frame, 3)?;
        run_blocking(engine.resize_buffer(&package_id, &instance_id, width, height))?;
        Ok(status_frame(&frame, wire_code::OK))
    }));

    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_DOWN, EventTarget::Widget, MouseEventKind::Down);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_UP, EventTarget::Widget, MouseEventKind::Up);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_MOVE, EventTarget::Widget, MouseEventKind::Move);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_ENTER, EventTarget::Widget, MouseEventKind::Enter);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_LEAVE, EventTarget::Widget, MouseEventKind::Leave);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_SET, EventTarget::Widget, MouseEventKind::Set);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_UNSET, EventTarget::Widget, MouseEventKind::Unset);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_ON_SCROLL, EventTarget::Widget, MouseEventKind::OnScroll);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_OFF_SCROLL, EventTarget::Widget, MouseEventKind::OffScroll);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_ON_HOLD, EventTarget::Widget, MouseEventKind::OnHold);
    register_mouse(&mut table, &engine, commands::WIDGET_MOUSE_OFF_HOLD, EventTarget::Widget, MouseEventKind::OffHold);

    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_DOWN, EventTarget::Gbar, MouseEventKind::Down);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_UP, EventTarget::Gbar, MouseEventKind::Up);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_MOVE, EventTarget::Gbar, MouseEventKind::Move);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_ENTER, EventTarget::Gbar, MouseEventKind::Enter);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_LEAVE, EventTarget::Gbar, MouseEventKind::Leave);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_SET, EventTarget::Gbar, MouseEventKind::Set);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_UNSET, EventTarget::Gbar, MouseEventKind::Unset);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_ON_SCROLL, EventTarget::Gbar, MouseEventKind::OnScroll);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_OFF_SCROLL, EventTarget::Gbar, MouseEventKind::OffScroll);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_ON_HOLD, EventTarget::Gbar, MouseEventKind::OnHold);
    register_mouse(&mut table, &engine, commands::GBAR_MOUSE_OFF_HOLD, EventTarget::Gbar, MouseEventKind::OffHold);

    register_key(&mut table, &engine, commands::WIDGET_KEY_DOWN, EventTarget::Widget, true);
    register_key(&mut table, &engine, commands::WIDGET_KEY_UP, EventTarget::Widget, false);
    register_key(&mut table, &engine, commands::GBAR_KEY_DOWN, EventTarget::Gbar, true);
    register_key(&mut table, &engine, commands::GBAR_KEY_UP, EventTarget::Gbar, false);

    register_access(&mut table, &engine, commands::WIDGET_ACCESS_HIT_TEST, EventTarget::Widget, AccessEventKind::HitTest);
    register_access(&mut table, &engine, commands::WIDGET_ACCESS_ACTION_UP, EventTarget::Widget, AccessEventKind::ActionUp);
    register_access(&mut table, &engine, commands::WIDGET_ACCESS_ACTION_DOWN, EventTarget::Widget, AccessEventKind::ActionDown);
    register_access(&mut table, &engine, commands::WIDGET_ACCESS_SCROLL, EventTarget::Widget, AccessEventKind::Scroll);
    register_access(&mut table, &engine, commands::WIDGET_ACCESS_UNHIGHLIGHT, EventTarget::Widget, AccessEventKind::Unhighlight);
    register_access(&mut table, &engine, commands::WIDGET_ACCESS_VALUE_CHANGE, EventTarget::Widget, AccessEventKind::ValueChange);
    register_access(&mut table, &engine, commands::WIDGET_ACCESS_MOUSE_OVER, EventTarget::Widget, AccessEventKind::MouseOver);

    register_access(&mut table, &engine, commands::GBAR_ACCESS_HIT_TEST, EventTarget::Gbar, AccessEventKind::HitTest);
    register_access(&mut table, &engine, commands::GBAR_ACCESS_ACTION_UP, EventTarget::Gbar, AccessEventKind::ActionUp);
    register_access(&mut table, &engine, commands::GBAR_ACCESS_ACTION_DOWN, EventTarget::Gbar, AccessEventKind::ActionDown);
    register_access(&mut table, &engine, commands::GBAR_ACCESS_SCROLL, EventTarget::Gbar, AccessEventKind::Scroll);
    register_access(&mut table, &engine, commands::GBAR_ACCESS_UNHIGHLIGHT, EventTarget::Gbar, AccessEventKind::Unhighlight);
    register_access(&mut table, &engine, commands::GBAR_ACCESS_VALUE_CHANGE, EventTarget::Gbar, AccessEventKind::ValueChange);
    register_access(&mut table, &engine, commands::GBAR_ACCESS_MOUSE_OVER, EventTarget::Gbar, AccessEventKind::MouseOver);

    table
}

/// Wraps a fallible handler body: `Ok` replies normally (or, for no-ack
/// commands that signal "handled, no reply" via `Err(NotSupported("no-ack"))`,
/// nothing is sent); any other `Err` still replies, with the error's
/// `wire_code()` so the master always gets an answer to a request-with-ack
/// command instead of hanging.
fn handler(engine: Arc<Engine>, f: impl Fn(Arc<Engine>, Frame) -> Result<Frame> + Send + Sync + 'static) -> Handler {
    Arc::new(move |frame: Frame| match f(engine.clone(), frame.clone()) {
        Ok(reply) => Some(reply),
        Err(WidgetError::NotSupported(reason)) if reason == "no-ack" => None,
        Err(err) => Some(status_frame(&frame, err_status(&err))),
    })
}

/// Drains the engine's outbound event stream for the lifetime of the
/// process. `master` is the fallback connection; a direct-addr viewer is
/// tried first per instance when one is attached.
pub async fn run_outbound(mut events: mpsc::UnboundedReceiver<EngineEvent>, direct: Arc<DirectRegistry>, master: Arc<Connection>) {
    while let Some(event) = events.recv().await {
        if let Err(err) = dispatch_event(event, &direct, &master).await {
            tracing::warn!(%err, "failed to deliver outbound protocol event");
        }
    }
}

async fn pick_connection(direct: &DirectRegistry, addrs: &[String], master: &Arc<Connection>) -> Arc<Connection> {
    for addr in addrs {
        if let Some(conn) = direct.connection_for(addr).await {
            return conn;
        }
    }
    master.clone()
}

async fn dispatch_event(event: EngineEvent, direct: &DirectRegistry, master: &Arc<Connection>) -> Result<()> {
    match event {
        EngineEvent::Updated { package_id, instance_id, region, direct_addrs, .. } => {
            let conn = pick_connection(direct, &direct_addrs, master).await;
            outbound::updated(&conn, &package_id, &instance_id, region).await
        }
        EngineEvent::ExtraInfo { package_id, instance_id, content, title, icon, name, priority } => {
            outbound::extra_info(master, &package_id, &instance_id, &content, &title, &icon, &name, priority).await
        }
        EngineEvent::WidgetUpdateBegin { package_id, instance_id } => {
            outbound::widget_update_begin(master, &package_id, &instance_id).await
        }
        EngineEvent::WidgetUpdateEnd { package_id, instance_id } => {
            outbound::widget_update_end(master, &package_id, &instance_id).await
        }
        EngineEvent::Deleted { package_id, instance_id } => outbound::deleted(master, &package_id, &instance_id).await,
        EngineEvent::Faulted { package_id, instance_id, reason } => {
            outbound::faulted(master, &package_id, &instance_id, &reason).await
        }
        EngineEvent::CloseGbar { package_id, instance_id } => outbound::close_gbar(master, &package_id, &instance_id).await,
    }
}

/// Pings the master at half of `Config::ping_time`, per spec.md §6. Stops
/// when the connection's send fails (socket gone).
pub async fn run_ping_timer(master: Arc<Connection>) {
    let interval = crate::config::Config::with(|c| c.ping_time) / 2;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if master.request_noack(commands::PING, |_frame| {}).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::PacketType;

    #[test]
    fn new_args_from_parses_expected_atom_layout() {
        let frame = Frame::new(commands::NEW, PacketType::Req, 1)
            .push_str("org.example.clock")
            .push_str("file:///tmp/w1.png")
            .push_str("")
            .push_int(0)
            .push_int(0)
            .push_double(0.0)
            .push_str("user,created")
            .push_str("default")
            .push_int(1)
            .push_int(348)
            .push_int(200)
            .push_str("")
            .push_int(0);
        let args = new_args_from(&frame).unwrap();
        assert_eq!(args.package_id, "org.example.clock");
        assert_eq!(args.width, 348);
        assert_eq!(args.height, 200);
        assert!(args.direct_addr.is_none());
    }

    #[test]
    fn missing_atom_is_invalid_argument() {
        let frame = Frame::new(commands::DELETE, PacketType::Req, 1).push_str("pkg");
        assert!(matches!(int_at(&frame, 5), Err(WidgetError::InvalidArgument(_))));
    }
}
