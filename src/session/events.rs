//! Session event stream
//!
//! The UI subscribes to one [`SessionEvents`] receiver per session. Every
//! component that reports to the user holds a clone of the [`EventSink`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::ssh::ErrorClass;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Raw shell output, verbatim
    Output(Vec<u8>),
    /// Status/diagnostic line, distinct from shell output
    ServiceMessage(String),
    Ready,
    Ended,
    Error { class: ErrorClass, message: String },
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Cloneable sender side. Closing it ends the stream for the receiver
/// once every clone has observed the close.
#[derive(Clone)]
pub struct EventSink {
    label: Arc<str>,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl EventSink {
    pub fn channel(label: impl Into<Arc<str>>) -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                label: label.into(),
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn output(&self, data: &[u8]) {
        self.emit(SessionEvent::Output(data.to_vec()));
    }

    /// Emit a service message and mirror it to the log
    pub fn service_message(&self, message: impl Into<String>) {
        let message = message.into();
        let plain = strip_ansi_escapes::strip_str(&message);
        info!("[{}] {}", self.label, plain);
        self.emit(SessionEvent::ServiceMessage(message));
    }

    pub fn error(&self, class: ErrorClass, message: impl Into<String>) {
        self.emit(SessionEvent::Error {
            class,
            message: message.into(),
        });
    }

    /// Drop the sender so the receiver sees end-of-stream
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}
