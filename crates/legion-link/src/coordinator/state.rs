//! Session lifecycle.

/// Where a [`Coordinator`](super::Coordinator) is in its lifecycle.
///
/// `Uninitialized → Initializing → Active → Terminated`. A failed
/// initialization falls back to `Uninitialized`; a terminated coordinator may
/// be initialized again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No session has been started.
    #[default]
    Uninitialized,
    /// Listening or connecting.
    Initializing,
    /// Running and accepting triggers.
    Active,
    /// Torn down; nothing further is processed.
    Terminated,
}

impl SessionState {
    /// Whether `initialize` may be called in this state.
    #[must_use]
    pub fn can_initialize(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Terminated)
    }

    /// Whether the session accepts triggers and dispatches.
    #[must_use]
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}
