//! Client notification channel.
//!
//! The front end (GUI or server transport) drains a queue of tagged events.
//! Enqueueing is fire-and-forget: no acknowledgment, no backpressure, and a
//! session with no attached front end simply accumulates events until one
//! drains them.

use std::collections::VecDeque;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Phases of session serialization reported to the client so it can show
/// progress UI. Each phase is bracketed: once with `completed = false` when
/// the phase starts, once with `completed = true` when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationAction {
    SaveDefaultWorkspace,
    LoadDefaultWorkspace,
    SuspendSession,
    ResumeSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    SerializationStatus {
        action: SerializationAction,
        completed: bool,
    },
    Suspended,
    Quit {
        saved_environment: bool,
    },
    /// Error messages accumulated during a restore; shown to the user
    /// because console output was suppressed while they occurred.
    RestoreErrors {
        messages: Vec<String>,
    },
    WorkingDirChanged {
        path: String,
    },
    PlotsChanged {
        active_id: Option<String>,
    },
    PlotImage {
        id: String,
        mime_type: String,
        data: String,
        is_new: bool,
    },
    ConsoleWritePrompt {
        prompt: String,
    },
}

impl ClientEvent {
    /// Wrap rendered plot bytes for transport.
    pub fn plot_image(id: &str, mime_type: &str, bytes: &[u8], is_new: bool) -> ClientEvent {
        let mime_type = if mime_type.trim().is_empty() {
            "image/png".to_string()
        } else {
            mime_type.to_string()
        };
        ClientEvent::PlotImage {
            id: id.to_string(),
            mime_type,
            data: STANDARD.encode(bytes),
            is_new,
        }
    }
}

#[derive(Default)]
pub struct ClientEventQueue {
    events: VecDeque<ClientEvent>,
}

impl ClientEventQueue {
    pub fn new() -> ClientEventQueue {
        ClientEventQueue::default()
    }

    pub fn enqueue(&mut self, event: ClientEvent) {
        crate::event_log::log(
            "client_event",
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        );
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// RAII guard bracketing a serialization phase with status events. The
/// completion event is sent on drop so every early return still closes the
/// bracket.
pub struct SerializationStatusScope<'a> {
    queue: &'a mut ClientEventQueue,
    action: SerializationAction,
}

impl<'a> SerializationStatusScope<'a> {
    pub fn new(
        queue: &'a mut ClientEventQueue,
        action: SerializationAction,
    ) -> SerializationStatusScope<'a> {
        queue.enqueue(ClientEvent::SerializationStatus {
            action,
            completed: false,
        });
        SerializationStatusScope { queue, action }
    }

    pub fn queue(&mut self) -> &mut ClientEventQueue {
        self.queue
    }
}

impl Drop for SerializationStatusScope<'_> {
    fn drop(&mut self) {
        self.queue.enqueue(ClientEvent::SerializationStatus {
            action: self.action,
            completed: true,
        });
    }
}
