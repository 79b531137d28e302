//! Short-term conversation memory and its relay encoding.

use molt_ecdysis::{PriorState, StateSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Version tag written into every snapshot this build produces.
pub const MODEL_VERSION: &str = concat!("molt-agent/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub session_id: Uuid,
    pub conversation: Vec<String>,
    pub model_version: String,
}

/// How `restore` arrived at the memory it returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    /// No predecessor: cold start.
    Fresh,
    /// The predecessor handed over nothing.
    Empty,
    /// Memory carried over from the predecessor.
    Resumed { from_version: String },
    /// The payload could not be decoded; started fresh.
    Discarded { reason: String },
}

impl MemoryContext {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            conversation: Vec::new(),
            model_version: MODEL_VERSION.to_string(),
        }
    }

    pub fn append(&mut self, message: impl Into<String>) {
        self.conversation.push(message.into());
    }

    pub fn len(&self) -> usize {
        self.conversation.len()
    }

    pub fn to_snapshot(&self) -> Result<StateSnapshot, serde_json::Error> {
        Ok(StateSnapshot::new(serde_json::to_vec(self)?))
    }

    pub fn from_snapshot(snapshot: &StateSnapshot) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(snapshot.payload())
    }

    /// Rebuild memory from whatever the predecessor left.
    ///
    /// Undecodable payloads are dropped rather than failing startup: a
    /// generation that cannot read its predecessor still serves. Memory
    /// written by another build keeps its session and conversation and is
    /// re-tagged with this build's version.
    pub fn restore(prior: PriorState) -> (Self, Restored) {
        let snapshot = match prior {
            PriorState::Absent => {
                info!("Starting fresh (cold start)");
                return (Self::new(), Restored::Fresh);
            }
            PriorState::Received(snapshot) if snapshot.is_empty() => {
                info!("Predecessor handed over empty state, starting fresh");
                return (Self::new(), Restored::Empty);
            }
            PriorState::Received(snapshot) => snapshot,
        };

        match Self::from_snapshot(&snapshot) {
            Ok(mut memory) => {
                let from_version = std::mem::replace(&mut memory.model_version, MODEL_VERSION.to_string());
                (memory, Restored::Resumed { from_version })
            }
            Err(err) => {
                warn!(error = %err, bytes = snapshot.len(), "Discarding undecodable prior state");
                (
                    Self::new(),
                    Restored::Discarded {
                        reason: err.to_string(),
                    },
                )
            }
        }
    }
}

impl Default for MemoryContext {
    fn default() -> Self {
        Self::new()
    }
}
