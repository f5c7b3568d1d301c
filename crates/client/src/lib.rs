//! Casework Client
//!
//! The streaming dialogue session controller. A [`SessionActorHandle`]
//! drives one conversation: it keeps the channel to the generation backend
//! open, allows one generation in flight at a time, renders partial output,
//! and recovers from dropped connections by resuming the stored request.

pub mod config;
pub mod error;
pub mod session;
pub mod session_actor;
pub mod session_command;
pub mod side_channel;
pub mod subject_guard;
pub mod transcript;
pub mod transition;
pub mod visibility;

pub use config::{ClientConfig, TransportKind};
pub use error::{ConfigError, SessionError};
pub use session_actor::SessionActorHandle;
pub use subject_guard::SwitchDecision;
pub use transcript::Message;
pub use transition::{GenerationState, SessionSnapshot, SessionUpdate};
