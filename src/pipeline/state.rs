//! Pipeline state management

use std::time::Instant;

/// Pipeline state machine
///
/// `Created → Flowing → {Paused ⇄ Flowing} → {Finished | Errored | Cancelled}`.
/// The three terminal states are absorbing: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Pipeline is wired but has not pulled anything yet
    Created,

    /// Chunks are moving from source to sink
    Flowing {
        /// When the pipeline started (or last resumed) flowing
        since: Instant,
    },

    /// Source is paused waiting for the sink to drain
    Paused {
        /// When the pipeline was paused
        paused_at: Instant,
    },

    /// Source ended and the sink flushed everything
    Finished,

    /// A fatal error ended the pipeline
    Errored,

    /// The pipeline was cancelled by its owner
    Cancelled,
}

impl PipelineState {
    pub fn flowing() -> Self {
        PipelineState::Flowing {
            since: Instant::now(),
        }
    }

    pub fn paused() -> Self {
        PipelineState::Paused {
            paused_at: Instant::now(),
        }
    }

    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // Terminal states are absorbing
            (Finished | Errored | Cancelled, _) => false,

            // From Created
            (Created, Flowing { .. }) => true,
            (Created, Errored | Cancelled) => true,

            // From Flowing
            (Flowing { .. }, Paused { .. }) => true,
            (Flowing { .. }, Finished | Errored | Cancelled) => true,

            // From Paused
            (Paused { .. }, Flowing { .. }) => true,
            (Paused { .. }, Errored | Cancelled) => true,

            // Self-transitions
            (Flowing { .. }, Flowing { .. }) => true,
            (Paused { .. }, Paused { .. }) => true,
            (Created, Created) => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Created => "Created",
            PipelineState::Flowing { .. } => "Flowing",
            PipelineState::Paused { .. } => "Paused",
            PipelineState::Finished => "Finished",
            PipelineState::Errored => "Errored",
            PipelineState::Cancelled => "Cancelled",
        }
    }

    /// Check if the pipeline is currently active (flowing or paused)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Flowing { .. } | PipelineState::Paused { .. }
        )
    }

    pub fn is_flowing(&self) -> bool {
        matches!(self, PipelineState::Flowing { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PipelineState::Paused { .. })
    }

    /// Finished, Errored or Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Finished | PipelineState::Errored | PipelineState::Cancelled
        )
    }

    /// Get the duration the pipeline has been paused (if paused)
    pub fn paused_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Paused { paused_at } = self {
            Some(paused_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
