//! GATE.PUNCH mediator library
//!
//! A rendezvous server for UDP hole punching. Game servers and clients
//! register their public endpoints over UDP and TCP; on request the mediator
//! hands each side the other's endpoint so they can punch through their NATs.

pub mod health;
pub mod lobby;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod udp;
pub mod version;

pub use protocol::*;
pub use registry::*;
pub use server::*;
