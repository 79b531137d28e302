//! Generation records and their lifecycle state machine.
//!
//! ```text
//! spawning ──► starting ──► active ──► draining ──► terminated
//!     │            │           │                        ▲
//!     └────────────┴─► failed  └────────────────────────┘
//! ```
//!
//! Records change only on events the supervisor observes. Finished records
//! are kept in a bounded history for status reports.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_HISTORY_LIMIT: usize = 16;

/// Monotonic generation identifier. The first generation is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(u64);

impl GenerationId {
    pub const FIRST: Self = Self(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    /// Process is being created.
    Spawning,
    /// Process is running but has not reported ready.
    Starting,
    /// Serving traffic.
    Active,
    /// Successor is active; finishing in-flight work.
    Draining,
    /// Exited after serving.
    Terminated,
    /// Never became ready.
    Failed,
}

impl GenerationState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Spawning, Starting)
                | (Spawning, Failed)
                | (Starting, Active)
                | (Starting, Failed)
                | (Active, Draining)
                | (Active, Terminated)
                | (Draining, Terminated)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a generation obtained its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartKind {
    /// First generation: no predecessor.
    Cold,
    /// Started by a handoff with a relay channel.
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
    pub pid: Option<u32>,
    pub state: GenerationState,
    pub kind: StartKind,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    /// Exit status or failure reason.
    pub exit: Option<String>,
    /// Had to be killed after the exit grace period.
    pub forced_termination: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown generation {0}")]
    Unknown(GenerationId),

    #[error("generation {id} cannot move from {from} to {to}")]
    Illegal {
        id: GenerationId,
        from: GenerationState,
        to: GenerationState,
    },
}

/// All generations the supervisor knows about.
#[derive(Debug)]
pub struct GenerationTable {
    generations: BTreeMap<GenerationId, Generation>,
    next_id: GenerationId,
    active: Option<GenerationId>,
    history_limit: usize,
}

impl Default for GenerationTable {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl GenerationTable {
    pub fn new(history_limit: usize) -> Self {
        Self {
            generations: BTreeMap::new(),
            next_id: GenerationId::FIRST,
            active: None,
            history_limit,
        }
    }

    /// Allocate the next id and record it as `spawning`.
    pub fn register(&mut self, kind: StartKind) -> GenerationId {
        let id = self.next_id;
        self.next_id = id.next();
        self.generations.insert(
            id,
            Generation {
                id,
                pid: None,
                state: GenerationState::Spawning,
                kind,
                started_at: Utc::now(),
                exited_at: None,
                exit: None,
                forced_termination: false,
            },
        );
        debug!(generation = %id, ?kind, "Registered generation");
        id
    }

    pub fn get(&self, id: GenerationId) -> Option<&Generation> {
        self.generations.get(&id)
    }

    pub fn active(&self) -> Option<&Generation> {
        self.active.and_then(|id| self.generations.get(&id))
    }

    pub fn active_id(&self) -> Option<GenerationId> {
        self.active
    }

    pub fn transition(&mut self, id: GenerationId, to: GenerationState) -> Result<(), TransitionError> {
        let generation = self
            .generations
            .get_mut(&id)
            .ok_or(TransitionError::Unknown(id))?;
        let from = generation.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Illegal { id, from, to });
        }
        generation.state = to;
        if to.is_finished() && generation.exited_at.is_none() {
            generation.exited_at = Some(Utc::now());
        }
        if to.is_finished() && self.active == Some(id) {
            self.active = None;
        }
        info!(generation = %id, %from, %to, "Generation state changed");
        Ok(())
    }

    pub fn mark_started(&mut self, id: GenerationId, pid: u32) -> Result<(), TransitionError> {
        self.transition(id, GenerationState::Starting)?;
        if let Some(generation) = self.generations.get_mut(&id) {
            generation.pid = Some(pid);
        }
        Ok(())
    }

    /// Make `id` the active generation. The previous active one, if any,
    /// moves to `draining`.
    pub fn promote(&mut self, id: GenerationId) -> Result<Option<GenerationId>, TransitionError> {
        self.transition(id, GenerationState::Active)?;
        let previous = self.active.replace(id);
        if let Some(old) = previous {
            self.transition(old, GenerationState::Draining)?;
        }
        Ok(previous)
    }

    /// Record that `id` never became ready.
    pub fn mark_failed(&mut self, id: GenerationId, reason: &str) -> Result<(), TransitionError> {
        self.transition(id, GenerationState::Failed)?;
        if let Some(generation) = self.generations.get_mut(&id) {
            generation.exit = Some(reason.to_string());
        }
        Ok(())
    }

    /// Record a reaped process. Returns `true` if it was the active generation.
    pub fn record_exit(&mut self, id: GenerationId, status: &str) -> bool {
        let was_active = self.active == Some(id);
        let Some(generation) = self.generations.get_mut(&id) else {
            return false;
        };

        let next = match generation.state {
            GenerationState::Spawning | GenerationState::Starting => Some(GenerationState::Failed),
            GenerationState::Active | GenerationState::Draining => Some(GenerationState::Terminated),
            GenerationState::Terminated | GenerationState::Failed => None,
        };
        generation.exited_at = Some(Utc::now());
        match &mut generation.exit {
            Some(reason) => reason.push_str(&format!("; {status}")),
            None => generation.exit = Some(status.to_string()),
        }
        if let Some(next) = next {
            // Every non-finished state may finish this way.
            let _ = self.transition(id, next);
        }

        self.prune();
        was_active
    }

    pub fn mark_forced(&mut self, id: GenerationId) {
        if let Some(generation) = self.generations.get_mut(&id) {
            generation.forced_termination = true;
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<Generation> {
        self.generations.values().cloned().collect()
    }

    /// Drop the oldest finished records beyond the history limit.
    fn prune(&mut self) {
        let finished: Vec<GenerationId> = self
            .generations
            .values()
            .filter(|g| g.state.is_finished())
            .map(|g| g.id)
            .collect();
        let excess = finished.len().saturating_sub(self.history_limit);
        for id in finished.into_iter().take(excess) {
            self.generations.remove(&id);
        }
    }
}
