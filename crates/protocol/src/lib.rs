//! Casework Protocol
//!
//! Shared types for communication between the casework client and the
//! generation backend. These types are serialized as JSON, tagged by `type`.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::{ClientMessage, GenerationRequest};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
