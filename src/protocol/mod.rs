//! PostgreSQL wire protocol
//!
//! This module contains:
//! - Protocol constants and message type bytes
//! - Message structures (raw framed messages plus typed views)
//! - Message codec (async read/write functions)
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol.html>

pub mod codec;
pub mod constants;
pub mod messages;

pub use codec::*;
pub use constants::*;
pub use messages::*;
