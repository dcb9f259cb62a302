//! Wire protocol definitions for GATE.PUNCH
//!
//! TCP requests are newline-terminated text lines. Some commands are followed
//! by a fixed number of argument lines:
//!
//!   reg2          version, data1..data8
//!   connect       target ip
//!   lobby2        filter1..filter8, sort field, sort direction, limit
//!   istesting     -
//!   testinginfos  -
//!   version       -
//!
//! TCP responses start with a marker byte followed by a command-specific
//! payload. Text fields in punch packets are NUL-terminated.
//!
//! UDP datagrams carry a 12-byte preamble, then text lines. Only the first
//! line is used, as the command.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Length of the preamble prepended to every UDP datagram
pub const UDP_PREAMBLE_LEN: usize = 12;

/// Separator after each text field of a punch packet
pub const FIELD_SEPARATOR: u8 = 0;

/// Sentinel `data1` value for servers only known through UDP
pub const INVALID_SERVER_MARKER: &str = "<INV>";

/// Minimum client library version accepted by `reg2`
pub const MIN_CLIENT_VERSION: &str = "1.2.0";

/// Version reported by this mediator
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// First byte of every TCP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Marker {
    /// Peer endpoint for a hole punch
    Punch = 255,
    /// Requested server not found or unreachable
    ConnectFailed = 254,
    /// Lobby listing
    Lobby = 249,
    /// Testing mode flag
    IsTesting = 248,
    /// Testing information
    TestingInfos = 247,
    /// Mediator version
    Version = 246,
}

/// TCP commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    Connect,
    Lobby,
    IsTesting,
    TestingInfos,
    Version,
}

impl Command {
    /// Match a sanitized line against the known command tokens.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "reg2" => Some(Command::Register),
            "connect" => Some(Command::Connect),
            "lobby2" => Some(Command::Lobby),
            "istesting" => Some(Command::IsTesting),
            "testinginfos" => Some(Command::TestingInfos),
            "version" => Some(Command::Version),
            _ => None,
        }
    }

    /// Number of argument lines that follow the command line
    pub fn argument_count(self) -> usize {
        match self {
            Command::Register => 9,
            Command::Connect => 1,
            Command::Lobby => 11,
            Command::IsTesting | Command::TestingInfos | Command::Version => 0,
        }
    }
}

/// Unicode "other" characters: control, format, private use, unassigned
static OTHER_CHARS: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"\p{C}+"));

/// Strip control and invisible formatting characters from a received line.
///
/// Game clients pad strings with NULs and carriage returns; none of those
/// may survive into command matching or stored metadata.
pub fn sanitize_line(raw: &str) -> String {
    match &*OTHER_CHARS {
        Ok(pattern) => pattern.replace_all(raw, "").into_owned(),
        Err(_) => raw.chars().filter(|c| !c.is_control()).collect(),
    }
}

/// Punch packet: marker, peer ip, peer port, each text field NUL-terminated.
pub fn punch_packet(ip: &str, port: u16) -> Vec<u8> {
    let port = port.to_string();
    let mut buf = Vec::with_capacity(1 + ip.len() + port.len() + 2);
    buf.push(Marker::Punch as u8);
    buf.extend_from_slice(ip.as_bytes());
    buf.push(FIELD_SEPARATOR);
    buf.extend_from_slice(port.as_bytes());
    buf.push(FIELD_SEPARATOR);
    buf
}

/// Single-byte reply to a `connect` that cannot be served
pub fn connect_failed_packet() -> [u8; 1] {
    [Marker::ConnectFailed as u8]
}

/// Lobby listing: marker, JSON array, newline.
pub fn lobby_packet<T: Serialize>(entries: &[T]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = vec![Marker::Lobby as u8];
    serde_json::to_writer(&mut buf, entries)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn is_testing_packet(testing: bool) -> [u8; 2] {
    [Marker::IsTesting as u8, u8::from(testing)]
}

/// Name, version and minimum client version, one per line, or a single
/// zero byte when testing mode is off.
pub fn testing_infos_packet(info: Option<(&str, &str, &str)>) -> Vec<u8> {
    let mut buf = vec![Marker::TestingInfos as u8];
    match info {
        Some((name, version, min_version)) => {
            for field in [name, version, min_version] {
                buf.extend_from_slice(field.as_bytes());
                buf.push(b'\n');
            }
        }
        None => buf.push(0),
    }
    buf
}

pub fn version_packet(version: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(version.len() + 2);
    buf.push(Marker::Version as u8);
    buf.extend_from_slice(version.as_bytes());
    buf.push(b'\n');
    buf
}

/// UDP registration commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpCommand {
    /// A game server announces its public UDP endpoint
    Register,
    /// A client announces its public UDP endpoint before a TCP `connect`
    Connect,
    /// Anything else; carries the received token for logging
    Unknown(String),
}

impl UdpCommand {
    /// Parse a datagram payload: drop the preamble, trim NUL padding and
    /// take the first text line. Later lines are never decoded.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < UDP_PREAMBLE_LEN {
            return Err(ProtocolError::TooShort {
                expected: UDP_PREAMBLE_LEN,
                got: payload.len(),
            });
        }

        let body = trim_trailing_zeros(&payload[UDP_PREAMBLE_LEN..]);
        if body.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let first = body.split(|&b| b == b'\n').next().unwrap_or_default();
        let first = first.strip_suffix(b"\r").unwrap_or(first);

        Ok(match &*String::from_utf8_lossy(first) {
            "reg" => UdpCommand::Register,
            "connect" => UdpCommand::Connect,
            other => UdpCommand::Unknown(other.to_string()),
        })
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Datagram too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("Datagram carries no command")]
    Empty,
}

fn trim_trailing_zeros(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &data[..end]
}
