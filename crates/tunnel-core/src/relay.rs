//! Reverse-forward relaying.
//!
//! This module provides:
//! - The collaborator seams of the secure transport ([`SecureChannel`], [`ForwardListener`])
//! - The local endpoint connector
//! - The relay engine that pumps one accepted channel against one local socket
//! - The sequential accept loop
//!
//! The main entry point is [`AcceptLoop`], which drives one relay at a time
//! until the forward listener stops producing connections.

mod accept;
mod engine;
mod local;
mod traits;

// Re-export public API
pub use accept::{AcceptLoop, AcceptSummary, StopReason};
pub use engine::{RelayEngine, RelayReport, RelayStatus, StatusKind};
pub use local::LocalConnector;
pub use traits::{Accepted, ChannelRead, ForwardListener, LocalIo, Origin, SecureChannel};
