use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// ```text
///            ┌──────────── recover ────────────┐
///            ▼                                  │
///        Created ──activate──▶ Active ◀──▶ Suspended
///            │                  │   device loss  │
///            │                  └──▶ Invalidated ◀┘
///            └──────── any ──────────▶ Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    Active,
    Suspended,
    Invalidated,
    Destroyed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Active, Created, Destroyed, Invalidated, Suspended};
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Created | Suspended, Active) => true,
            (Active, Suspended) => true,
            (Active | Suspended, Invalidated) => true,
            (Invalidated, Created) => true,
            _ => false,
        }
    }
}
