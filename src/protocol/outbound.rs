//! One function per outbound command, each building and sending its frame
//! over a given [`Connection`]. Mirrors the teacher's one-function-per-
//! request style rather than a single generic "send event" dispatcher, so
//! each wire shape is pinned down at its own call site.

use std::sync::Arc;

use crate::buffer::DamageRegion;
use crate::error::Result;
use crate::transport::wire::Value;
use crate::transport::Connection;

use super::commands;

pub async fn updated(conn: &Arc<Connection>, package_id: &str, instance_id: &str, region: DamageRegion) -> Result<()> {
    conn.request_noack(commands::UPDATED, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
        frame.values.push(Value::Int(region.x));
        frame.values.push(Value::Int(region.y));
        frame.values.push(Value::Int(region.w));
        frame.values.push(Value::Int(region.h));
    })
    .await
}

pub async fn extra_info(
    conn: &Arc<Connection>,
    package_id: &str,
    instance_id: &str,
    content: &str,
    title: &str,
    icon: &str,
    name: &str,
    priority: f64,
) -> Result<()> {
    conn.request_noack(commands::EXTRA_INFO, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
        frame.values.push(Value::Str(content.to_string()));
        frame.values.push(Value::Str(title.to_string()));
        frame.values.push(Value::Str(icon.to_string()));
        frame.values.push(Value::Str(name.to_string()));
        frame.values.push(Value::Double(priority));
    })
    .await
}

pub async fn widget_update_begin(conn: &Arc<Connection>, package_id: &str, instance_id: &str) -> Result<()> {
    conn.request_noack(commands::WIDGET_UPDATE_BEGIN, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
    })
    .await
}

pub async fn widget_update_end(conn: &Arc<Connection>, package_id: &str, instance_id: &str) -> Result<()> {
    conn.request_noack(commands::WIDGET_UPDATE_END, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
    })
    .await
}

pub async fn deleted(conn: &Arc<Connection>, package_id: &str, instance_id: &str) -> Result<()> {
    conn.request_noack(commands::DELETED, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
    })
    .await
}

pub async fn faulted(conn: &Arc<Connection>, package_id: &str, instance_id: &str, reason: &str) -> Result<()> {
    conn.request_noack(commands::FAULTED, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
        frame.values.push(Value::Str(reason.to_string()));
    })
    .await
}

pub async fn close_gbar(conn: &Arc<Connection>, package_id: &str, instance_id: &str) -> Result<()> {
    conn.request_noack(commands::CLOSE_GBAR, |frame| {
        frame.values.push(Value::Str(package_id.to_string()));
        frame.values.push(Value::Str(instance_id.to_string()));
    })
    .await
}

pub async fn hello_ack(conn: &Arc<Connection>, slave_name: &str) -> Result<()> {
    conn.request_noack(commands::HELLO_ACK, |frame| {
        frame.values.push(Value::Str(slave_name.to_string()));
    })
    .await
}
