//! Finite state machine for an instance's membership in a cluster.
//!
//! The state of an instance is derived from two orthogonal facts: whether
//! the metadata records it and what the live group view reports for it.
//! Every topology operation asks the machine whether its event is legal from
//! the derived state before touching any server.

use std::fmt;

use crate::client::MemberState;

/// Lifecycle state of an instance relative to a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Not recorded in the cluster metadata.
    Unmanaged,
    /// Recorded and recovering from the group.
    Joining,
    Online,
    /// Recorded but the member reports `ERROR`.
    RecoveryFailed,
    /// Recorded and in the view, but unreachable from the anchor.
    Unreachable,
    /// Recorded but absent from the live view.
    Missing,
}

impl LifecycleState {
    /// Derive the state from metadata presence and the live view.
    pub fn derive(recorded: bool, live: Option<MemberState>) -> Self {
        if !recorded {
            return LifecycleState::Unmanaged;
        }
        match live {
            None | Some(MemberState::Offline) => LifecycleState::Missing,
            Some(MemberState::Online) => LifecycleState::Online,
            Some(MemberState::Recovering) => LifecycleState::Joining,
            Some(MemberState::Error) => LifecycleState::RecoveryFailed,
            Some(MemberState::Unreachable) => LifecycleState::Unreachable,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Unmanaged => write!(f, "Unmanaged"),
            LifecycleState::Joining => write!(f, "Joining"),
            LifecycleState::Online => write!(f, "Online"),
            LifecycleState::RecoveryFailed => write!(f, "RecoveryFailed"),
            LifecycleState::Unreachable => write!(f, "Unreachable"),
            LifecycleState::Missing => write!(f, "Missing"),
        }
    }
}

/// Events that move an instance through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// addInstance started the join protocol
    AddRequested,
    /// The member reached ONLINE, or RECOVERING with a clone underway
    JoinCompleted,
    /// The member went to ERROR or left while joining
    JoinFailed,
    /// removeInstance asked the member to leave the group
    GracefulRemove,
    /// The group still lists the member but cannot reach it
    BecameUnreachable,
    /// The group expelled the member
    Expelled,
    /// rejoinInstance restarted the join protocol
    RejoinRequested,
    /// removeInstance with force dropped only the metadata record
    ForceRemoved,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::AddRequested => write!(f, "AddRequested"),
            LifecycleEvent::JoinCompleted => write!(f, "JoinCompleted"),
            LifecycleEvent::JoinFailed => write!(f, "JoinFailed"),
            LifecycleEvent::GracefulRemove => write!(f, "GracefulRemove"),
            LifecycleEvent::BecameUnreachable => write!(f, "BecameUnreachable"),
            LifecycleEvent::Expelled => write!(f, "Expelled"),
            LifecycleEvent::RejoinRequested => write!(f, "RejoinRequested"),
            LifecycleEvent::ForceRemoved => write!(f, "ForceRemoved"),
        }
    }
}

/// Facts the guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Members recorded in the cluster metadata
    pub recorded_members: usize,
    /// Live state reported for the instance
    pub live_state: Option<MemberState>,
    /// A full state transfer (clone) is feeding the joining member
    pub clone_in_progress: bool,
}

impl TransitionContext {
    pub fn new(recorded_members: usize, live_state: Option<MemberState>) -> Self {
        Self {
            recorded_members,
            live_state,
            clone_in_progress: false,
        }
    }

    pub fn with_clone(mut self, clone_in_progress: bool) -> Self {
        self.clone_in_progress = clone_in_progress;
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub event: LifecycleEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        description: &'static str,
    },
    /// No transition for this event from the current state
    InvalidTransition {
        current: LifecycleState,
        event: LifecycleEvent,
    },
    GuardFailed {
        from: LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        reason: String,
    },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success { .. })
    }
}

/// Transition table for instance membership
pub struct InstanceStateMachine {
    transitions: Vec<Transition>,
}

impl Default for InstanceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceStateMachine {
    pub fn new() -> Self {
        use LifecycleEvent as E;
        use LifecycleState as S;

        Self {
            transitions: vec![
                // === Unmanaged ===
                Transition::new(S::Unmanaged, S::Joining, E::AddRequested, "Joining the group"),
                // === Joining ===
                Transition::new(S::Joining, S::Online, E::JoinCompleted, "Member joined the group"),
                Transition::new(
                    S::Joining,
                    S::RecoveryFailed,
                    E::JoinFailed,
                    "Distributed recovery failed",
                ),
                // === Online ===
                Transition::new(
                    S::Online,
                    S::Unmanaged,
                    E::GracefulRemove,
                    "Member left the group and was removed from the metadata",
                ),
                Transition::new(
                    S::Online,
                    S::Unreachable,
                    E::BecameUnreachable,
                    "Member became unreachable",
                ),
                Transition::new(S::Online, S::Missing, E::Expelled, "Member was expelled"),
                Transition::new(
                    S::Online,
                    S::Unmanaged,
                    E::ForceRemoved,
                    "Metadata record dropped, live state untouched",
                ),
                // === Unreachable ===
                Transition::new(S::Unreachable, S::Missing, E::Expelled, "Member was expelled"),
                Transition::new(
                    S::Unreachable,
                    S::Joining,
                    E::RejoinRequested,
                    "Rejoining the group",
                ),
                Transition::new(
                    S::Unreachable,
                    S::Unmanaged,
                    E::ForceRemoved,
                    "Metadata record dropped, live state untouched",
                ),
                // === Missing ===
                Transition::new(S::Missing, S::Joining, E::RejoinRequested, "Rejoining the group"),
                Transition::new(
                    S::Missing,
                    S::Unmanaged,
                    E::ForceRemoved,
                    "Metadata record dropped, live state untouched",
                ),
                // === RecoveryFailed ===
                Transition::new(
                    S::RecoveryFailed,
                    S::Joining,
                    E::RejoinRequested,
                    "Rejoining the group after a failed recovery",
                ),
                Transition::new(
                    S::RecoveryFailed,
                    S::Unmanaged,
                    E::GracefulRemove,
                    "Failed member stopped and removed from the metadata",
                ),
                Transition::new(
                    S::RecoveryFailed,
                    S::Unmanaged,
                    E::ForceRemoved,
                    "Metadata record dropped, live state untouched",
                ),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: LifecycleState,
        event: LifecycleEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: LifecycleState, event: LifecycleEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: LifecycleState) -> Vec<LifecycleEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (transition.from, transition.event) {
            (_, LifecycleEvent::GracefulRemove | LifecycleEvent::ForceRemoved) => {
                (ctx.recorded_members <= 1)
                    .then(|| "it is the only member of the Cluster".to_string())
            }
            (LifecycleState::Joining, LifecycleEvent::JoinCompleted) => match ctx.live_state {
                Some(MemberState::Online) => None,
                Some(MemberState::Recovering) if ctx.clone_in_progress => None,
                other => Some(format!(
                    "member state is {}",
                    other.map_or_else(|| "(MISSING)".to_string(), |s| s.to_string())
                )),
            },
            _ => None,
        }
    }
}

/// Event implied by a fresh observation of a joining member.
///
/// `None` while the member is still recovering.
pub fn join_progress(live: Option<MemberState>, clone_in_progress: bool) -> Option<LifecycleEvent> {
    match live {
        Some(MemberState::Online) => Some(LifecycleEvent::JoinCompleted),
        Some(MemberState::Recovering) if clone_in_progress => Some(LifecycleEvent::JoinCompleted),
        Some(MemberState::Recovering) => None,
        Some(MemberState::Error | MemberState::Offline | MemberState::Unreachable) | None => {
            Some(LifecycleEvent::JoinFailed)
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    #[test]
    fn test_derive() {
        assert_eq!(S::derive(false, Some(MemberState::Online)), S::Unmanaged);
        assert_eq!(S::derive(true, None), S::Missing);
        assert_eq!(S::derive(true, Some(MemberState::Offline)), S::Missing);
        assert_eq!(S::derive(true, Some(MemberState::Recovering)), S::Joining);
        assert_eq!(S::derive(true, Some(MemberState::Unreachable)), S::Unreachable);
    }

    #[test]
    fn test_add_then_join() {
        let sm = InstanceStateMachine::new();
        let ctx = TransitionContext::new(1, None);
        let result = sm.transition(S::Unmanaged, E::AddRequested, &ctx);
        match result {
            TransitionResult::Success { to, .. } => assert_eq!(to, S::Joining),
            _ => panic!("Expected successful transition"),
        }

        let ctx = TransitionContext::new(1, Some(MemberState::Online));
        assert!(sm.transition(S::Joining, E::JoinCompleted, &ctx).is_success());
    }

    #[test]
    fn test_join_completed_guard() {
        let sm = InstanceStateMachine::new();
        let ctx = TransitionContext::new(2, Some(MemberState::Recovering));
        assert!(matches!(
            sm.transition(S::Joining, E::JoinCompleted, &ctx),
            TransitionResult::GuardFailed { .. }
        ));
        let ctx = ctx.with_clone(true);
        assert!(sm.transition(S::Joining, E::JoinCompleted, &ctx).is_success());
    }

    #[test]
    fn test_last_member_guard() {
        let sm = InstanceStateMachine::new();
        let ctx = TransitionContext::new(1, Some(MemberState::Online));
        match sm.transition(S::Online, E::GracefulRemove, &ctx) {
            TransitionResult::GuardFailed { reason, .. } => {
                assert!(reason.contains("only member"))
            }
            other => panic!("Expected guard failure, got {other:?}"),
        }
        let ctx = TransitionContext::new(2, Some(MemberState::Online));
        assert!(sm.transition(S::Online, E::GracefulRemove, &ctx).is_success());

        let ctx = TransitionContext::new(1, None);
        assert!(matches!(
            sm.transition(S::Missing, E::ForceRemoved, &ctx),
            TransitionResult::GuardFailed { .. }
        ));
    }

    #[test]
    fn test_rejoin_active_member_invalid() {
        let sm = InstanceStateMachine::new();
        let ctx = TransitionContext::new(3, Some(MemberState::Online));
        assert!(matches!(
            sm.transition(S::Online, E::RejoinRequested, &ctx),
            TransitionResult::InvalidTransition { .. }
        ));
        assert!(!sm.can_transition(S::Joining, E::RejoinRequested));
        assert!(sm.can_transition(S::Missing, E::RejoinRequested));
    }

    #[test]
    fn test_missing_requires_force() {
        let sm = InstanceStateMachine::new();
        assert!(!sm.can_transition(S::Missing, E::GracefulRemove));
        assert!(sm.can_transition(S::Missing, E::ForceRemoved));
        assert!(sm.can_transition(S::Online, E::ForceRemoved));
    }

    #[test]
    fn test_unmanaged_only_accepts_add() {
        let sm = InstanceStateMachine::new();
        assert_eq!(sm.valid_events(S::Unmanaged), vec![E::AddRequested]);
    }

    #[test]
    fn test_join_progress() {
        assert_eq!(join_progress(Some(MemberState::Recovering), false), None);
        assert_eq!(
            join_progress(Some(MemberState::Recovering), true),
            Some(E::JoinCompleted)
        );
        assert_eq!(join_progress(Some(MemberState::Error), false), Some(E::JoinFailed));
        assert_eq!(join_progress(None, false), Some(E::JoinFailed));
    }
}
