//! Wire command-id table (spec.md §6).
//!
//! One constant per command; the id is all a frame carries to say which
//! shape its payload has, so these numbers are the contract between master
//! and slave and must never be renumbered once assigned.

// Inbound (master -> slave), request-with-ack unless noted.
pub const HELLO: u32 = 1;
pub const NEW: u32 = 2;
pub const RENEW: u32 = 3;
pub const DELETE: u32 = 4;
pub const RESIZE: u32 = 5;
pub const SET_PERIOD: u32 = 6;
pub const CHANGE_GROUP: u32 = 7;
pub const UPDATE_CONTENT: u32 = 8;
pub const PINUP: u32 = 9;
pub const CLICKED: u32 = 10; // request-no-ack
pub const TEXT_SIGNAL: u32 = 11; // request-no-ack
pub const PAUSE_ALL: u32 = 12; // request-no-ack
pub const RESUME_ALL: u32 = 13; // request-no-ack
pub const WIDGET_PAUSE: u32 = 14; // request-no-ack
pub const WIDGET_RESUME: u32 = 15; // request-no-ack
pub const UPDATE_MODE: u32 = 16;
pub const ORIENTATION: u32 = 17;
pub const SET_WIDGET_SHOW: u32 = 18;
pub const GBAR_OPEN: u32 = 19;
pub const GBAR_CLOSE: u32 = 20;

/// Slave -> master keep-alive, sent every half of `Config::ping_time`.
/// Numbered alongside the inbound table rather than the outbound one since
/// it shares their request-no-ack framing, not their direction.
pub const PING: u32 = 21;

/// Three-step identity handshake: `hello` answers with the slave's identity,
/// `hello_sync_prepare`/`hello_sync` bracket the master handing over any
/// synchronized startup state. All three are plain status acks here — this
/// slave has nothing to hand back except its own identity.
pub const HELLO_SYNC_PREPARE: u32 = 22;
pub const HELLO_SYNC: u32 = 23;

// Buffer lifecycle driven directly over the wire rather than through `new`'s
// implicit buffer creation (spec.md §4.2).
pub const ACQUIRE_BUFFER: u32 = 24;
pub const ACQUIRE_XBUFFER: u32 = 25;
pub const RELEASE_BUFFER: u32 = 26;
pub const RELEASE_XBUFFER: u32 = 27;
pub const RESIZE_BUFFER: u32 = 28;

// Widget-surface mouse input (request-with-ack: reply carries only a
// status, so the viewer never waits on a dispatch it can't know completed).
pub const WIDGET_MOUSE_DOWN: u32 = 29;
pub const WIDGET_MOUSE_UP: u32 = 30;
pub const WIDGET_MOUSE_MOVE: u32 = 31;
pub const WIDGET_MOUSE_ENTER: u32 = 32;
pub const WIDGET_MOUSE_LEAVE: u32 = 33;
pub const WIDGET_MOUSE_SET: u32 = 34;
pub const WIDGET_MOUSE_UNSET: u32 = 35;
pub const WIDGET_MOUSE_ON_SCROLL: u32 = 36;
pub const WIDGET_MOUSE_OFF_SCROLL: u32 = 37;
pub const WIDGET_MOUSE_ON_HOLD: u32 = 38;
pub const WIDGET_MOUSE_OFF_HOLD: u32 = 39;

// Glance-bar-surface mouse input, same payload shape as the widget set.
pub const GBAR_MOUSE_DOWN: u32 = 40;
pub const GBAR_MOUSE_UP: u32 = 41;
pub const GBAR_MOUSE_MOVE: u32 = 42;
pub const GBAR_MOUSE_ENTER: u32 = 43;
pub const GBAR_MOUSE_LEAVE: u32 = 44;
pub const GBAR_MOUSE_SET: u32 = 45;
pub const GBAR_MOUSE_UNSET: u32 = 46;
pub const GBAR_MOUSE_ON_SCROLL: u32 = 47;
pub const GBAR_MOUSE_OFF_SCROLL: u32 = 48;
pub const GBAR_MOUSE_ON_HOLD: u32 = 49;
pub const GBAR_MOUSE_OFF_HOLD: u32 = 50;

pub const WIDGET_KEY_DOWN: u32 = 51;
pub const WIDGET_KEY_UP: u32 = 52;
pub const GBAR_KEY_DOWN: u32 = 53;
pub const GBAR_KEY_UP: u32 = 54;

pub const WIDGET_ACCESS_HIT_TEST: u32 = 55;
pub const WIDGET_ACCESS_ACTION_UP: u32 = 56;
pub const WIDGET_ACCESS_ACTION_DOWN: u32 = 57;
pub const WIDGET_ACCESS_SCROLL: u32 = 58;
pub const WIDGET_ACCESS_UNHIGHLIGHT: u32 = 59;
pub const WIDGET_ACCESS_VALUE_CHANGE: u32 = 60;
pub const WIDGET_ACCESS_MOUSE_OVER: u32 = 61;

pub const GBAR_ACCESS_HIT_TEST: u32 = 62;
pub const GBAR_ACCESS_ACTION_UP: u32 = 63;
pub const GBAR_ACCESS_ACTION_DOWN: u32 = 64;
pub const GBAR_ACCESS_SCROLL: u32 = 65;
pub const GBAR_ACCESS_UNHIGHLIGHT: u32 = 66;
pub const GBAR_ACCESS_VALUE_CHANGE: u32 = 67;
pub const GBAR_ACCESS_MOUSE_OVER: u32 = 68;

// Outbound (slave -> master or slave -> direct viewer).
pub const UPDATED: u32 = 101;
pub const EXTRA_INFO: u32 = 102;
pub const WIDGET_UPDATE_BEGIN: u32 = 103;
pub const WIDGET_UPDATE_END: u32 = 104;
pub const DELETED: u32 = 105;
pub const FAULTED: u32 = 106;
pub const CLOSE_GBAR: u32 = 107;
pub const HELLO_ACK: u32 = 108;
