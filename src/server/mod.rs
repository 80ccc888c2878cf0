//! Server module for pggateway
//!
//! This module contains:
//! - Network stream abstraction (TCP/TLS)
//! - Client session state machine and proxy loop
//! - TCP listener with SSL negotiation
//! - Process-level server owning all listeners

pub mod gateway;
pub mod listener;
pub mod session;
pub mod stream;

pub use gateway::{local_addrs, Server};
pub use listener::{Listener, ListenerStats};
pub use session::{PasswordMethod, Session, MAX_BATCHED_MESSAGES};
pub use stream::NetworkStream;
