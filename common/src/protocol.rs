//! Socket event framing used to reach the aggregation server.
//!
//! The server speaks Socket.IO v4 over an Engine.IO websocket. Only the
//! handful of frames a publishing client needs are modelled here; the
//! websocket itself belongs to the transport implementation.

use serde::Serialize;

use crate::config::Endpoint;

/// Event name the aggregation server listens on for readings.
pub const TELEMETRY_EVENT: &str = "distanceInch";

pub const SOCKET_IO_PATH: &str = "/socket.io/";

/// Socket.IO connect request for the default namespace.
pub const CONNECT_FRAME: &str = "40";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFrame<'a> {
    Open(&'a str),
    Close,
    Ping(&'a str),
    Pong(&'a str),
    Connected,
    ConnectError(&'a str),
    Disconnected,
    Event(&'a str),
    Noop,
    Unknown,
}

pub fn socket_url(endpoint: &Endpoint) -> String {
    format!(
        "ws://{}:{}{}?EIO=4&transport=websocket",
        endpoint.host, endpoint.port, SOCKET_IO_PATH
    )
}

/// Encodes `42["<event>",<payload>]`.
pub fn encode_event<T: Serialize>(event: &str, payload: &T) -> serde_json::Result<String> {
    let body = serde_json::to_string(&(event, payload))?;
    Ok(format!("42{body}"))
}

pub fn pong_for(ping_payload: &str) -> String {
    format!("3{ping_payload}")
}

pub fn decode_frame(text: &str) -> EngineFrame<'_> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return EngineFrame::Unknown;
    };
    let rest = chars.as_str();

    match kind {
        '0' => EngineFrame::Open(rest),
        '1' => EngineFrame::Close,
        '2' => EngineFrame::Ping(rest),
        '3' => EngineFrame::Pong(rest),
        '4' => decode_socket_packet(rest),
        '6' => EngineFrame::Noop,
        _ => EngineFrame::Unknown,
    }
}

fn decode_socket_packet(packet: &str) -> EngineFrame<'_> {
    let mut chars = packet.chars();
    let Some(kind) = chars.next() else {
        return EngineFrame::Unknown;
    };
    let rest = chars.as_str();

    match kind {
        '0' => EngineFrame::Connected,
        '1' => EngineFrame::Disconnected,
        '2' => EngineFrame::Event(rest),
        '4' => EngineFrame::ConnectError(rest),
        _ => EngineFrame::Unknown,
    }
}
