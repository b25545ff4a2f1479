//! Flow (pour session) entity, lifecycle states and filter predicates.

use crate::{FlowError, FlowResult, Tap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Process-local identifier of a flow.
///
/// Assigned by the session manager in strictly increasing order, so
/// ordering by id is ordering by start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(u64);

impl FlowId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Flow State
// ============================================================================

/// Lifecycle state of a flow.
///
/// `Initial -> Active -> {Idle <-> Active} -> Completed`. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Constructed but not yet started by the manager.
    #[default]
    Initial,

    /// Receiving ticks or recently poked.
    Active,

    /// Started but marked as not currently pouring.
    Idle,

    /// Ended. No further mutation is accepted.
    Completed,
}

impl FlowState {
    /// Returns true if the lifecycle allows moving from `self` to `next`.
    ///
    /// Re-entering the current state is allowed except for `Completed`.
    #[must_use]
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::{Active, Completed, Idle, Initial};
        match (self, next) {
            (Completed, _) => false,
            (from, to) if from == to => true,
            (Initial, Active) => true,
            (Active, Idle) | (Idle, Active) => true,
            (Active, Completed) | (Idle, Completed) => true,
            _ => false,
        }
    }

    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Flow Entity
// ============================================================================

/// One pour session on a tap.
///
/// Flows are owned by the session manager; callers receive clones as
/// immutable snapshots. The tap never changes after construction,
/// `total_ticks` never decreases, and a completed flow rejects every
/// mutation with [`FlowError::Completed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    id: FlowId,
    tap: Tap,
    state: FlowState,
    total_ticks: u64,
    max_idle_time_ms: u64,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
    /// `None` while the pour is anonymous
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shout: Option<String>,
    /// Attachment references in insertion order, without duplicates
    images: Vec<String>,
}

impl Flow {
    /// Creates a flow in the `Initial` state.
    pub fn new(id: FlowId, tap: Tap, max_idle_time_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            tap,
            state: FlowState::Initial,
            total_ticks: 0,
            max_idle_time_ms,
            started_at: now,
            last_activity: now,
            ended_at: None,
            username: None,
            shout: None,
            images: Vec::new(),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn max_idle_time_ms(&self) -> u64 {
        self.max_idle_time_ms
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn shout(&self) -> Option<&str> {
        self.shout.as_deref()
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    fn ensure_mutable(&self) -> FlowResult<()> {
        if self.state == FlowState::Completed {
            return Err(FlowError::Completed { id: self.id });
        }
        Ok(())
    }

    /// Adds `delta` ticks and refreshes the activity timestamp.
    pub fn add_ticks(&mut self, delta: u64) -> FlowResult<()> {
        self.ensure_mutable()?;
        self.total_ticks = self.total_ticks.saturating_add(delta);
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Refreshes the activity timestamp without changing ticks.
    pub fn poke_activity(&mut self) -> FlowResult<()> {
        self.ensure_mutable()?;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Returns time elapsed since the last tick or poke.
    ///
    /// Clamped to zero if the wall clock stepped backwards.
    pub fn idle_time(&self) -> chrono::Duration {
        Utc::now()
            .signed_duration_since(self.last_activity)
            .max(chrono::Duration::zero())
    }

    /// Returns [`Flow::idle_time`] in milliseconds.
    pub fn idle_time_ms(&self) -> u64 {
        u64::try_from(self.idle_time().num_milliseconds()).unwrap_or(0)
    }

    /// Sets the user owning this pour. An empty name makes the flow anonymous.
    ///
    /// Returns true if the username changed.
    pub fn set_username(&mut self, username: impl Into<String>) -> FlowResult<bool> {
        self.ensure_mutable()?;
        let username = Some(username.into()).filter(|name| !name.is_empty());
        if self.username == username {
            return Ok(false);
        }
        self.username = username;
        Ok(true)
    }

    /// Sets the shout text (last write wins). Returns true if it changed.
    pub fn set_shout(&mut self, text: impl Into<String>) -> FlowResult<bool> {
        self.ensure_mutable()?;
        let text = Some(text.into()).filter(|t| !t.is_empty());
        if self.shout == text {
            return Ok(false);
        }
        self.shout = text;
        Ok(true)
    }

    /// Appends an image reference. Returns false if it was already attached.
    pub fn add_image(&mut self, image: impl Into<String>) -> FlowResult<bool> {
        self.ensure_mutable()?;
        let image = image.into();
        if self.images.contains(&image) {
            return Ok(false);
        }
        self.images.push(image);
        Ok(true)
    }

    /// Removes an image reference. Returns false if it was not attached.
    pub fn remove_image(&mut self, image: &str) -> FlowResult<bool> {
        self.ensure_mutable()?;
        let before = self.images.len();
        self.images.retain(|existing| existing != image);
        Ok(self.images.len() != before)
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    pub fn is_authenticated(&self) -> bool {
        !self.is_anonymous()
    }

    /// Moves the flow to `next`, enforcing the lifecycle order.
    pub fn set_state(&mut self, next: FlowState) -> FlowResult<()> {
        if self.state == FlowState::Completed {
            return Err(FlowError::Completed { id: self.id });
        }
        if !self.state.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        if next == FlowState::Completed {
            self.ended_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Started and not yet completed (`Active` or `Idle`).
    pub fn is_active(&self) -> bool {
        matches!(self.state, FlowState::Active | FlowState::Idle)
    }

    /// Active and without activity for at least `max_idle_time_ms`.
    pub fn is_idle(&self) -> bool {
        self.is_active() && self.idle_time_ms() >= self.max_idle_time_ms
    }

    pub fn is_completed(&self) -> bool {
        self.state == FlowState::Completed
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flow(id={}, tap={}, state={}, ticks={}, user={})",
            self.id,
            self.tap,
            self.state,
            self.total_ticks,
            self.username.as_deref().unwrap_or("-")
        )
    }
}

// ============================================================================
// Predicates
// ============================================================================

/// Predicate form of [`Flow::is_active`].
pub fn is_active(flow: &Flow) -> bool {
    flow.is_active()
}

/// Predicate form of [`Flow::is_idle`].
pub fn is_idle(flow: &Flow) -> bool {
    flow.is_idle()
}

/// Predicate form of [`Flow::is_completed`].
pub fn is_completed(flow: &Flow) -> bool {
    flow.is_completed()
}

/// Copies the flows matching `predicate` into an owned snapshot, ordered by id.
pub fn filter_flows<'a, I, P>(flows: I, predicate: P) -> Vec<Flow>
where
    I: IntoIterator<Item = &'a Flow>,
    P: Fn(&Flow) -> bool,
{
    let mut matching: Vec<Flow> = flows
        .into_iter()
        .filter(|flow| predicate(*flow))
        .cloned()
        .collect();
    matching.sort_by_key(Flow::id);
    matching
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_flow(id: u64) -> Flow {
        Flow::new(FlowId::new(id), Tap::from_meter_name("kegboard.flow0"), 30_000)
    }

    fn create_active_flow(id: u64) -> Flow {
        let mut flow = create_test_flow(id);
        flow.set_state(FlowState::Active).unwrap();
        flow
    }

    #[test]
    fn test_new_flow_defaults() {
        let flow = create_test_flow(1);
        assert_eq!(flow.state(), FlowState::Initial);
        assert_eq!(flow.total_ticks(), 0);
        assert!(flow.is_anonymous());
        assert!(flow.images().is_empty());
        assert!(flow.ended_at().is_none());
        // Initial flows are neither active nor completed
        assert!(!flow.is_active());
        assert!(!flow.is_completed());
    }

    #[test]
    fn test_add_ticks_accumulates() {
        let mut flow = create_active_flow(1);
        flow.add_ticks(12).unwrap();
        flow.add_ticks(0).unwrap();
        flow.add_ticks(30).unwrap();
        assert_eq!(flow.total_ticks(), 42);
    }

    #[test]
    fn test_add_ticks_refreshes_activity() {
        let mut flow = create_active_flow(1);
        let before = flow.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        flow.add_ticks(10).unwrap();
        assert!(flow.last_activity() > before);
    }

    #[test]
    fn test_state_transitions() {
        let mut flow = create_test_flow(1);
        flow.set_state(FlowState::Active).unwrap();
        flow.set_state(FlowState::Idle).unwrap();
        flow.set_state(FlowState::Active).unwrap();
        flow.set_state(FlowState::Completed).unwrap();
        assert!(flow.is_completed());
        assert!(flow.ended_at().is_some());
    }

    #[test]
    fn test_initial_cannot_complete() {
        let mut flow = create_test_flow(4);
        let err = flow.set_state(FlowState::Completed).unwrap_err();
        assert_eq!(
            err,
            FlowError::InvalidTransition {
                id: FlowId::new(4),
                from: FlowState::Initial,
                to: FlowState::Completed,
            }
        );
    }

    #[test]
    fn test_active_cannot_return_to_initial() {
        let mut flow = create_active_flow(2);
        assert!(matches!(
            flow.set_state(FlowState::Initial),
            Err(FlowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_completed_rejects_mutation() {
        let mut flow = create_active_flow(9);
        flow.add_ticks(20).unwrap();
        flow.set_state(FlowState::Completed).unwrap();

        let completed = Err(FlowError::Completed { id: FlowId::new(9) });
        assert_eq!(flow.add_ticks(5), completed);
        assert_eq!(flow.poke_activity(), completed);
        assert_eq!(flow.set_state(FlowState::Active), completed);
        assert_eq!(flow.set_state(FlowState::Completed), completed);
        assert!(flow.set_username("alice").is_err());
        assert!(flow.set_shout("cheers").is_err());
        assert!(flow.add_image("photo.jpg").is_err());
        assert_eq!(flow.total_ticks(), 20);
    }

    #[test]
    fn test_username_and_anonymity() {
        let mut flow = create_active_flow(1);
        assert!(flow.is_anonymous());

        assert!(flow.set_username("alice").unwrap());
        assert!(flow.is_authenticated());
        assert_eq!(flow.username(), Some("alice"));

        // Same name again is not a change
        assert!(!flow.set_username("alice").unwrap());

        assert!(flow.set_username("").unwrap());
        assert!(flow.is_anonymous());
    }

    #[test]
    fn test_shout_last_write_wins() {
        let mut flow = create_active_flow(1);
        assert!(flow.set_shout("first").unwrap());
        assert!(flow.set_shout("second").unwrap());
        assert!(!flow.set_shout("second").unwrap());
        assert_eq!(flow.shout(), Some("second"));
    }

    #[test]
    fn test_images_keep_order_and_reject_duplicates() {
        let mut flow = create_active_flow(1);
        assert!(flow.add_image("b.jpg").unwrap());
        assert!(flow.add_image("a.jpg").unwrap());
        assert!(!flow.add_image("b.jpg").unwrap());
        assert_eq!(flow.images(), ["b.jpg".to_string(), "a.jpg".to_string()]);

        assert!(flow.remove_image("b.jpg").unwrap());
        assert!(!flow.remove_image("b.jpg").unwrap());
        assert_eq!(flow.images(), ["a.jpg".to_string()]);
    }

    #[test]
    fn test_idle_predicate() {
        let mut flow = Flow::new(FlowId::new(1), Tap::from_meter_name("m"), 0);
        // Not started: never idle
        assert!(!flow.is_idle());

        flow.set_state(FlowState::Active).unwrap();
        assert!(flow.is_idle());

        let mut patient = create_active_flow(2);
        patient.poke_activity().unwrap();
        assert!(!patient.is_idle());
    }

    #[test]
    fn test_idle_state_still_counts_as_active() {
        let mut flow = create_active_flow(1);
        flow.set_state(FlowState::Idle).unwrap();
        assert!(flow.is_active());
        assert!(is_active(&flow));
        assert!(!is_completed(&flow));
    }

    #[test]
    fn test_filter_flows_orders_by_id() {
        let mut done = create_active_flow(2);
        done.set_state(FlowState::Completed).unwrap();
        let flows = [create_active_flow(5), done, create_active_flow(3), create_test_flow(1)];

        let active: Vec<u64> = filter_flows(&flows, is_active)
            .iter()
            .map(|f| f.id().get())
            .collect();
        assert_eq!(active, vec![3, 5]);

        let completed = filter_flows(&flows, is_completed);
        assert_eq!(completed.len(), 1);
        assert!(filter_flows(&flows, is_idle).is_empty());
    }

    #[test]
    fn test_flow_serializes_snapshot() {
        let mut flow = create_active_flow(11);
        flow.add_ticks(50).unwrap();
        flow.set_username("bob").unwrap();

        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["id"], 11);
        assert_eq!(json["state"], "active");
        assert_eq!(json["total_ticks"], 50);
        assert_eq!(json["username"], "bob");
        assert!(json.get("shout").is_none());
    }

    #[test]
    fn test_flow_display() {
        let mut flow = create_active_flow(3);
        flow.add_ticks(15).unwrap();
        assert_eq!(
            flow.to_string(),
            "Flow(id=3, tap=kegboard.flow0, state=active, ticks=15, user=-)"
        );
    }
}
