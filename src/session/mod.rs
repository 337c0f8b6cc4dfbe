//! Session Module
//!
//! The [`SessionController`] and what it owns:
//! - state machine for the session lifecycle
//! - the event stream read by the UI
//! - the shell task running the login scripts

mod controller;
mod events;
mod shell;
mod state;

pub use controller::{SessionController, SessionDeps};
pub use events::{EventSink, SessionEvent, SessionEvents};
pub use shell::{signal_from_name, ShellCommand};
pub use state::{SessionState, SessionStateMachine};
