//! `casework chat`: interactive shell over a session actor.
//!
//! Plain lines are sent as utterances; lines starting with `/` are shell
//! commands. Streaming assistant text is printed as it grows.

use std::io::Write;

use casework_client::{
    GenerationState, SessionActorHandle, SessionError, SessionUpdate, SwitchDecision,
};
use casework_protocol::{subject_label, SideChannelSnapshot};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const HELP: &str = "\
  /subject <id|general>  switch the service user (asks to confirm if the chat has content)
  /confirm               confirm a pending subject switch
  /cancel                keep the current subject
  /new                   start a new session with the same subject
  /abandon               give up on a failed reply and keep its partial text
  /background            pause automatic retries
  /foreground            resume; retries a failed reply once
  /goals                 show current goals and resources
  /status                show session state as JSON
  /quit                  leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Say(String),
    Subject(Option<String>),
    Confirm,
    Cancel,
    New,
    Abandon,
    Background,
    Foreground,
    Goals,
    Status,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Say(line.to_string());
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "subject" => Self::Subject(
                Some(arg.to_string()).filter(|a| !a.is_empty() && a != "general"),
            ),
            "confirm" => Self::Confirm,
            "cancel" => Self::Cancel,
            "new" => Self::New,
            "abandon" => Self::Abandon,
            "background" | "bg" => Self::Background,
            "foreground" | "fg" => Self::Foreground,
            "goals" => Self::Goals,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Turns successive full-text updates into what still needs printing.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    printed: String,
}

impl StreamPrinter {
    pub fn reset(&mut self) {
        self.printed.clear();
    }

    /// Text to print for the latest full text. When the new text does not
    /// extend what is on screen (a resumed stream rewrote it), the whole text
    /// is returned on a fresh line.
    pub fn advance(&mut self, text: &str) -> String {
        let out = match text.strip_prefix(self.printed.as_str()) {
            Some(delta) => delta.to_string(),
            None => format!("\n{text}"),
        };
        self.printed.clear();
        self.printed.push_str(text);
        out
    }
}

pub async fn run(handle: SessionActorHandle) -> anyhow::Result<()> {
    let mut updates = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = StreamPrinter::default();

    let snap = handle.snapshot();
    println!(
        "{} subject: {}  (type /help for commands)",
        style("casework").bold().cyan(),
        style(subject_label(snap.subject_id.as_deref())).bold()
    );

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&handle, &line).await? {
                    break;
                }
            }
            update = updates.recv() => match update {
                Ok(update) => render(&mut printer, update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(component = "shell", skipped, "Update stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = handle.shutdown().await;
    Ok(())
}

/// Returns false when the shell should exit.
async fn handle_line(handle: &SessionActorHandle, line: &str) -> anyhow::Result<bool> {
    match ShellCommand::parse(line) {
        ShellCommand::Empty => {}
        ShellCommand::Say(text) => {
            if let Err(e) = handle.submit(text).await {
                report(&e);
            }
        }
        ShellCommand::Subject(subject_id) => {
            match handle.request_switch(subject_id).await? {
                SwitchDecision::NoChange => notice("already on that subject"),
                SwitchDecision::Immediate { subject_id } => notice(&format!(
                    "subject set to {}",
                    subject_label(subject_id.as_deref())
                )),
                SwitchDecision::AwaitingConfirmation { subject_id } => notice(&format!(
                    "switching to {} clears this conversation; /confirm or /cancel",
                    subject_label(subject_id.as_deref())
                )),
                SwitchDecision::Blocked => {
                    notice("a subject switch is already waiting; /confirm or /cancel it first")
                }
            }
        }
        ShellCommand::Confirm => {
            if let Err(e) = handle.confirm_switch().await {
                report(&e);
            }
        }
        ShellCommand::Cancel => {
            handle.cancel_switch().await?;
            notice("kept the current subject");
        }
        ShellCommand::New => handle.new_session().await?,
        ShellCommand::Abandon => {
            if let Err(e) = handle.abandon().await {
                report(&e);
            }
        }
        ShellCommand::Background => handle.background().await?,
        ShellCommand::Foreground => handle.foreground().await?,
        ShellCommand::Goals => print_side_channel(&handle.snapshot().side_channel),
        ShellCommand::Status => {
            println!("{}", serde_json::to_string_pretty(handle.snapshot().as_ref())?);
        }
        ShellCommand::Help => println!("{HELP}"),
        ShellCommand::Quit => return Ok(false),
        ShellCommand::Unknown(name) => notice(&format!("unknown command /{name}; try /help")),
    }
    Ok(true)
}

fn render(printer: &mut StreamPrinter, update: SessionUpdate) {
    match update {
        SessionUpdate::PhaseChanged(GenerationState::Awaiting) => {
            printer.reset();
            print!("{} ", style("assistant>").green().bold());
            flush();
        }
        SessionUpdate::AssistantText { text } => {
            print!("{}", printer.advance(&text));
            flush();
        }
        SessionUpdate::TurnCompleted { .. } => println!(),
        SessionUpdate::TurnFailed {
            reason,
            attempt,
            exhausted,
        } => {
            println!();
            if exhausted {
                println!(
                    "{} {} (after {} attempts). /foreground to try again or /abandon",
                    style("reply failed:").red().bold(),
                    reason,
                    attempt
                );
            } else {
                println!(
                    "{} {} (attempt {}), resuming",
                    style("connection problem:").yellow(),
                    reason,
                    attempt
                );
            }
        }
        SessionUpdate::TurnAbandoned => notice("reply abandoned"),
        SessionUpdate::ChannelStatus { ready } => {
            if ready {
                println!("{}", style("connected").dim());
            } else {
                println!("{}", style("disconnected").dim());
            }
        }
        SessionUpdate::SideChannel(snapshot) => print_side_channel(&snapshot),
        SessionUpdate::SessionReset { subject_id, .. } => notice(&format!(
            "new session, subject: {}",
            subject_label(subject_id.as_deref())
        )),
        SessionUpdate::SwitchCancelled
        | SessionUpdate::SwitchPending { .. }
        | SessionUpdate::SubjectChanged { .. }
        | SessionUpdate::UserMessage { .. }
        | SessionUpdate::ConversationAssigned { .. }
        | SessionUpdate::PhaseChanged(_) => {}
    }
}

fn print_side_channel(snapshot: &SideChannelSnapshot) {
    if snapshot.is_empty() {
        notice("no goals or resources yet");
        return;
    }
    println!("{}", style("Goals").bold());
    for goal in &snapshot.goals {
        println!("  - {goal}");
    }
    println!("{}", style("Resources").bold());
    for resource in &snapshot.resources {
        println!("  - {resource}");
    }
}

fn notice(text: &str) {
    println!("{}", style(text).dim());
}

fn report(err: &SessionError) {
    let hint = match err {
        SessionError::AlreadyInProgress => " (wait for the reply, or /abandon a failed one)",
        SessionError::ChannelNotReady => " (still connecting; try again in a moment)",
        _ => "",
    };
    println!("{} {}{}", style("error:").red().bold(), err, hint);
}

fn flush() {
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_utterances() {
        assert_eq!(
            ShellCommand::parse("  I need housing help "),
            ShellCommand::Say("I need housing help".to_string())
        );
        assert_eq!(
            ShellCommand::parse("/subject su-42"),
            ShellCommand::Subject(Some("su-42".to_string()))
        );
        assert_eq!(ShellCommand::parse("/subject general"), ShellCommand::Subject(None));
        assert_eq!(ShellCommand::parse("/subject"), ShellCommand::Subject(None));
        assert_eq!(ShellCommand::parse("/fg"), ShellCommand::Foreground);
        assert_eq!(ShellCommand::parse(""), ShellCommand::Empty);
        assert_eq!(
            ShellCommand::parse("/frobnicate now"),
            ShellCommand::Unknown("frobnicate".to_string())
        );
    }

    #[test]
    fn printer_emits_only_new_text() {
        let mut printer = StreamPrinter::default();
        assert_eq!(printer.advance("Here"), "Here");
        assert_eq!(printer.advance("Here are"), " are");
        assert_eq!(printer.advance("Here are"), "");
    }

    #[test]
    fn printer_restarts_when_text_is_rewritten() {
        let mut printer = StreamPrinter::default();
        printer.advance("Here are");
        assert_eq!(printer.advance("Hello"), "\nHello");

        printer.reset();
        assert_eq!(printer.advance("Next"), "Next");
    }
}
