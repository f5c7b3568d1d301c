//! Commands sent to a session actor by the hosting shell.

use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::subject_guard::SwitchDecision;

/// A command that can be sent to a session actor.
#[derive(Debug)]
pub enum SessionCommand {
    // -- Turns --
    /// Submit one user utterance; replies with the turn number
    Submit {
        text: String,
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    /// Give up on a failed turn, keeping its partial text
    Abandon {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    // -- Session lifecycle --
    /// Start over with the same subject
    NewSession,
    RequestSwitch {
        subject_id: Option<String>,
        reply: oneshot::Sender<SwitchDecision>,
    },
    ConfirmSwitch {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    CancelSwitch,

    // -- Visibility signals from the host --
    Foreground,
    Background,

    /// Release the channel and stop the actor
    Shutdown { reply: oneshot::Sender<()> },
}
