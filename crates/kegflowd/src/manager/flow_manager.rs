//! Flow session manager - owns all active flows and drives their lifecycle.
//!
//! # Locking
//!
//! One mutex guards the flow table: the tap -> flow map, the last meter
//! reading per tap, and the idle-reaper handle. Every check-then-act
//! sequence (debounce, find-or-start, end) runs inside a single critical
//! section. Listener notifications are queued inside that section, so their
//! order matches mutation order, and delivered after it ends. Callbacks never
//! run with the flow table locked.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Poisoned locks are recovered; a panicking listener cannot wedge the manager
//! - Flow mutation errors are logged, never propagated to sensor callers

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use kegflow_core::{
    filter_flows, is_active, is_completed, is_idle, Flow, FlowId, FlowResult, FlowState, Tap,
    TapRegistry,
};

use super::dispatch::Notifier;
use super::listener::FlowListener;
use super::outcome::{ManagerError, MeterOutcome};
use super::reaper::IdleReaper;
use crate::config::{check_idle_timeout, FlowConfig};

// ============================================================================
// Flow Table
// ============================================================================

/// State guarded by the manager's main lock.
#[derive(Default)]
struct FlowTable {
    /// At most one flow per tap; entries are removed when a flow ends
    flows_by_tap: HashMap<Tap, Flow>,

    /// Last committed cumulative meter value per tap. Survives flow boundaries.
    last_reading_by_tap: HashMap<Tap, u64>,

    /// Running while `flows_by_tap` is non-empty
    reaper: Option<IdleReaper>,
}

struct Inner {
    taps: Arc<dyn TapRegistry>,
    runtime: Handle,
    min_flow_start_ticks: u64,
    idle_poll_interval: Duration,
    default_idle_timeout_ms: AtomicU64,
    next_flow_id: AtomicU64,
    table: Mutex<FlowTable>,
    notifier: Notifier,
}

// ============================================================================
// Flow Manager
// ============================================================================

/// Converts per-tap meter readings into flow sessions.
///
/// This is a cheap-to-clone handle; clones share the same flows. All
/// operations are synchronous and may be called from any thread, including
/// from inside a [`FlowListener`] callback. The idle reaper runs on the tokio
/// runtime captured at construction.
///
/// Flows handed out are snapshots: mutate them through the manager.
#[derive(Clone)]
pub struct FlowManager {
    inner: Arc<Inner>,
}

impl FlowManager {
    /// Creates a manager using the tokio runtime of the calling thread.
    ///
    /// # Errors
    ///
    /// - `ManagerError::NoRuntime` if called outside a tokio runtime
    /// - `ManagerError::Config` if `config` fails validation
    pub fn new(taps: Arc<dyn TapRegistry>, config: &FlowConfig) -> Result<Self, ManagerError> {
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        Self::with_runtime(taps, config, runtime)
    }

    /// Creates a manager whose idle reaper runs on `runtime`.
    ///
    /// # Errors
    ///
    /// - `ManagerError::Config` if `config` fails validation
    pub fn with_runtime(
        taps: Arc<dyn TapRegistry>,
        config: &FlowConfig,
        runtime: Handle,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                taps,
                runtime,
                min_flow_start_ticks: config.min_flow_start_ticks,
                idle_poll_interval: config.idle_poll_interval(),
                default_idle_timeout_ms: AtomicU64::new(config.default_idle_timeout_ms),
                next_flow_id: AtomicU64::new(1),
                table: Mutex::new(FlowTable::default()),
                notifier: Notifier::default(),
            }),
        })
    }

    fn lock_table(&self) -> MutexGuard<'_, FlowTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` with the flow table locked, then delivers the notifications
    /// it queued.
    fn with_table<R>(&self, op: impl FnOnce(&mut FlowTable) -> R) -> R {
        let result = {
            let mut table = self.lock_table();
            op(&mut table)
        };
        self.inner.notifier.flush();
        result
    }

    /// Resolves a meter name through the tap registry.
    pub fn tap_for_meter_name(&self, meter_name: &str) -> Option<Tap> {
        let tap = self.inner.taps.tap_for_meter_name(meter_name);
        if tap.is_none() {
            debug!(meter = meter_name, "Dropping activity for unknown tap");
        }
        tap
    }

    // ========================================================================
    // Meter Input
    // ========================================================================

    /// Handles an incremental tick report.
    ///
    /// The ticks are added to the tap's last known reading (0 if unseen) and
    /// the sum goes through [`FlowManager::handle_meter_activity`] semantics.
    pub fn handle_new_ticks(&self, meter_name: &str, ticks: u64) -> MeterOutcome {
        let Some(tap) = self.tap_for_meter_name(meter_name) else {
            return MeterOutcome::UnknownTap {
                meter_name: meter_name.to_string(),
            };
        };

        self.with_table(|table| {
            let cumulative = table
                .last_reading_by_tap
                .get(&tap)
                .copied()
                .unwrap_or(0)
                .saturating_add(ticks);
            self.apply_reading(table, tap, cumulative)
        })
    }

    /// Handles a cumulative meter reading.
    ///
    /// A first reading or a reading below the previous one starts a new
    /// sensor epoch with a delta of zero. A positive delta under the
    /// debounce threshold is rejected without touching any state.
    /// Otherwise the reading is committed and the delta is credited to the
    /// tap's active flow, starting one if needed.
    pub fn handle_meter_activity(&self, meter_name: &str, ticks: u64) -> MeterOutcome {
        debug!(meter = meter_name, ticks, "handle_meter_activity");
        let Some(tap) = self.tap_for_meter_name(meter_name) else {
            return MeterOutcome::UnknownTap {
                meter_name: meter_name.to_string(),
            };
        };

        self.with_table(|table| self.apply_reading(table, tap, ticks))
    }

    fn apply_reading(&self, table: &mut FlowTable, tap: Tap, ticks: u64) -> MeterOutcome {
        let last_reading = table.last_reading_by_tap.get(&tap).copied();
        let delta = match last_reading {
            // First report for this meter, or the counter went backwards
            None => 0,
            Some(last) if last > ticks => 0,
            Some(last) => ticks - last,
        };

        let min = self.inner.min_flow_start_ticks;
        if delta > 0 && delta < min {
            debug!(tap = %tap, delta, min, "Not enough activity to start flow");
            return MeterOutcome::Debounced { tap, delta, min };
        }

        table.last_reading_by_tap.insert(tap.clone(), ticks);
        debug!(tap = %tap, last_reading = ?last_reading, ticks, delta, "Meter reading committed");

        let flow = match table.flows_by_tap.get_mut(&tap) {
            Some(flow) if flow.state() == FlowState::Active => {
                debug!(flow_id = %flow.id(), "Found existing flow");
                flow
            }
            _ => {
                let max_idle_time_ms = self.default_idle_timeout();
                self.start_flow_locked(table, tap, max_idle_time_ms)
            }
        };

        if let Err(err) = flow.add_ticks(delta) {
            error!(flow_id = %flow.id(), error = %err, "Failed to credit ticks");
        }
        self.inner.notifier.update(flow);

        MeterOutcome::Accepted(flow.clone())
    }

    // ========================================================================
    // Session Control
    // ========================================================================

    /// Handles a user arriving at a tap.
    ///
    /// With no flow in progress a new one is started for the user. An
    /// anonymous flow is taken over. A flow owned by another user is left
    /// untouched and returned as-is.
    pub fn activate_user_at_tap(&self, tap: &Tap, username: &str) -> Flow {
        self.with_table(|table| {
            if let Some(flow) = table.flows_by_tap.get_mut(tap) {
                debug!(
                    tap = %tap,
                    username,
                    flow_id = %flow.id(),
                    "Activating user at tap with flow in progress"
                );

                if flow.username() == Some(username) {
                    debug!("Same username, nothing to do");
                    return flow.clone();
                }
                if flow.is_anonymous() {
                    info!(flow_id = %flow.id(), username, "Anonymous flow taken over");
                    match flow.set_username(username) {
                        Ok(true) => self.inner.notifier.update(flow),
                        Ok(false) => {}
                        Err(err) => error!(flow_id = %flow.id(), error = %err, "Takeover failed"),
                    }
                    return flow.clone();
                }
                // A second authentication must not hijack someone else's pour
                info!(
                    flow_id = %flow.id(),
                    owner = flow.username().unwrap_or_default(),
                    username,
                    "Flow already authenticated, ignoring activation"
                );
                return flow.clone();
            }

            debug!(tap = %tap, username, "Activating user at idle tap, creating new flow");
            let max_idle_time_ms = self.default_idle_timeout();
            let flow = self.start_flow_locked(table, tap.clone(), max_idle_time_ms);
            match flow.set_username(username) {
                Ok(true) => self.inner.notifier.update(flow),
                Ok(false) => {}
                Err(err) => error!(flow_id = %flow.id(), error = %err, "Failed to set username"),
            }
            flow.clone()
        })
    }

    /// Starts a new active flow on `tap`, replacing any flow already there.
    pub fn start_flow(&self, tap: Tap, max_idle_time_ms: u64) -> Flow {
        self.with_table(|table| self.start_flow_locked(table, tap, max_idle_time_ms).clone())
    }

    fn start_flow_locked<'t>(
        &self,
        table: &'t mut FlowTable,
        tap: Tap,
        max_idle_time_ms: u64,
    ) -> &'t mut Flow {
        let id = FlowId::new(self.inner.next_flow_id.fetch_add(1, Ordering::Relaxed));
        let mut flow = Flow::new(id, tap.clone(), max_idle_time_ms);
        if let Err(err) = flow.set_state(FlowState::Active).and_then(|()| flow.poke_activity()) {
            error!(flow_id = %id, error = %err, "Failed to activate new flow");
        }

        // The replaced flow ends with its usual notifications
        if let Some(previous) = table.flows_by_tap.remove(&tap) {
            warn!(flow_id = %previous.id(), tap = %tap, "Replacing flow still present on tap");
            self.complete_and_notify(previous);
        }

        self.ensure_reaper(table);

        info!(
            flow_id = %id,
            tap = %tap,
            max_idle_time_ms,
            active_flows = table.flows_by_tap.len() + 1,
            "Flow started"
        );

        let flow = match table.flows_by_tap.entry(tap) {
            Entry::Occupied(mut entry) => {
                entry.insert(flow);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(flow),
        };
        self.inner.notifier.start(flow);
        flow
    }

    /// Ends `flow` if it is still the active flow of its tap.
    ///
    /// Returns the completed flow, or `None` if it had already ended (or been
    /// replaced). Safe to call concurrently; exactly one caller gets `Some`.
    pub fn end_flow(&self, flow: &Flow) -> Option<Flow> {
        self.end_flow_if(flow, |_| true)
    }

    /// Ends `flow` only if it is still current and still idle under the
    /// table lock. Ticks arriving after an idle scan keep the pour going.
    fn end_flow_if_idle(&self, flow: &Flow) -> Option<Flow> {
        self.end_flow_if(flow, Flow::is_idle)
    }

    fn end_flow_if<P>(&self, flow: &Flow, should_end: P) -> Option<Flow>
    where
        P: FnOnce(&Flow) -> bool,
    {
        self.with_table(|table| {
            let current = match table.flows_by_tap.get(flow.tap()) {
                Some(current) if current.id() == flow.id() => current,
                _ => {
                    warn!(flow_id = %flow.id(), tap = %flow.tap(), "No active flow to end");
                    return None;
                }
            };
            if !should_end(current) {
                debug!(flow_id = %flow.id(), "Flow saw activity, not ending");
                return None;
            }

            let ended = table.flows_by_tap.remove(flow.tap())?;
            if table.flows_by_tap.is_empty() {
                Self::stop_reaper(table);
            }
            Some(self.complete_and_notify(ended))
        })
    }

    /// Ends every active flow. Returns the completed flows in start order.
    pub fn end_all_flows(&self) -> Vec<Flow> {
        self.with_table(|table| {
            let mut flows: Vec<Flow> = table.flows_by_tap.drain().map(|(_, flow)| flow).collect();
            flows.sort_by_key(Flow::id);
            Self::stop_reaper(table);

            flows
                .into_iter()
                .map(|flow| self.complete_and_notify(flow))
                .collect()
        })
    }

    /// Shuts the manager down: ends all flows and stops the idle reaper.
    pub fn stop(&self) -> Vec<Flow> {
        info!("Flow manager stopping");
        let ended = self.end_all_flows();
        info!(ended = ended.len(), "Flow manager stopped");
        ended
    }

    fn complete_and_notify(&self, mut flow: Flow) -> Flow {
        if let Err(err) = flow.set_state(FlowState::Completed) {
            error!(flow_id = %flow.id(), error = %err, "Failed to complete flow");
        }
        info!(
            flow_id = %flow.id(),
            tap = %flow.tap(),
            total_ticks = flow.total_ticks(),
            username = flow.username().unwrap_or_default(),
            "Flow ended"
        );
        self.inner.notifier.end(&flow);
        flow
    }

    // ========================================================================
    // Idle Reaping
    // ========================================================================

    fn ensure_reaper(&self, table: &mut FlowTable) {
        if table.reaper.is_some() {
            return;
        }
        debug!("Starting idle checker");

        let weak = Arc::downgrade(&self.inner);
        table.reaper = Some(IdleReaper::spawn(
            &self.inner.runtime,
            self.inner.idle_poll_interval,
            move || match weak.upgrade() {
                Some(inner) => {
                    FlowManager { inner }.reap_idle_flows();
                    true
                }
                None => false,
            },
        ));
    }

    fn stop_reaper(table: &mut FlowTable) {
        if table.reaper.take().is_some() {
            debug!("Stopping idle checker");
        }
    }

    /// Ends every flow whose idle predicate holds. Returns how many ended.
    ///
    /// Called by the idle reaper on each tick. Idleness is checked again
    /// under the table lock before each end. A panic while ending one flow
    /// is logged and does not stop the scan.
    pub fn reap_idle_flows(&self) -> usize {
        let mut ended = 0;
        for flow in self.idle_flows() {
            debug!(flow_id = %flow.id(), idle_ms = flow.idle_time_ms(), "Flow is idle, ending");
            match catch_unwind(AssertUnwindSafe(|| self.end_flow_if_idle(&flow))) {
                Ok(Some(_)) => ended += 1,
                Ok(None) => {}
                Err(_) => {
                    error!(flow_id = %flow.id(), tap = %flow.tap(), "Panic while ending idle flow");
                }
            }
        }
        ended
    }

    /// Returns true while the idle reaper task is alive.
    pub fn is_reaper_running(&self) -> bool {
        self.lock_table()
            .reaper
            .as_ref()
            .is_some_and(|reaper| !reaper.is_finished())
    }

    // ========================================================================
    // Flow Metadata
    // ========================================================================

    fn update_flow<F>(&self, tap: &Tap, update: F) -> Option<Flow>
    where
        F: FnOnce(&mut Flow) -> FlowResult<bool>,
    {
        self.with_table(|table| {
            let flow = table.flows_by_tap.get_mut(tap)?;
            match update(flow) {
                Ok(true) => self.inner.notifier.update(flow),
                Ok(false) => {}
                Err(err) => warn!(flow_id = %flow.id(), error = %err, "Flow update rejected"),
            }
            Some(flow.clone())
        })
    }

    /// Sets the shout text of the tap's flow.
    pub fn set_shout(&self, tap: &Tap, text: &str) -> Option<Flow> {
        self.update_flow(tap, |flow| flow.set_shout(text))
    }

    /// Attaches an image reference to the tap's flow.
    pub fn add_image(&self, tap: &Tap, image: &str) -> Option<Flow> {
        self.update_flow(tap, |flow| flow.add_image(image))
    }

    /// Detaches an image reference from the tap's flow.
    pub fn remove_image(&self, tap: &Tap, image: &str) -> Option<Flow> {
        self.update_flow(tap, |flow| flow.remove_image(image))
    }

    /// Marks the tap's flow as still pouring. Does not notify listeners.
    pub fn poke_flow(&self, tap: &Tap) -> Option<Flow> {
        self.update_flow(tap, |flow| flow.poke_activity().map(|()| false))
    }

    /// Pokes every active flow. Returns how many were poked.
    pub fn poke_all_active(&self) -> usize {
        let mut table = self.lock_table();
        let mut poked = 0;
        for flow in table.flows_by_tap.values_mut().filter(|flow| flow.is_active()) {
            if flow.poke_activity().is_ok() {
                poked += 1;
            }
        }
        poked
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of started, not yet completed flows, in start order.
    pub fn active_flows(&self) -> Vec<Flow> {
        filter_flows(self.lock_table().flows_by_tap.values(), is_active)
    }

    /// Snapshot of flows past their idle threshold.
    pub fn idle_flows(&self) -> Vec<Flow> {
        filter_flows(self.lock_table().flows_by_tap.values(), is_idle)
    }

    /// Snapshot of completed flows still held by the manager.
    ///
    /// Ending a flow removes it, so this is normally empty.
    pub fn completed_flows(&self) -> Vec<Flow> {
        filter_flows(self.lock_table().flows_by_tap.values(), is_completed)
    }

    /// Taps that currently own a flow, in flow start order.
    pub fn active_taps(&self) -> Vec<Tap> {
        self.active_flows()
            .into_iter()
            .map(|flow| flow.tap().clone())
            .collect()
    }

    pub fn flow_for_tap(&self, tap: &Tap) -> Option<Flow> {
        self.lock_table().flows_by_tap.get(tap).cloned()
    }

    pub fn flow_for_meter_name(&self, meter_name: &str) -> Option<Flow> {
        let tap = self.tap_for_meter_name(meter_name)?;
        self.flow_for_tap(&tap)
    }

    pub fn flow_for_id(&self, id: FlowId) -> Option<Flow> {
        self.lock_table()
            .flows_by_tap
            .values()
            .find(|flow| flow.id() == id)
            .cloned()
    }

    /// The active flow with the most recent activity.
    pub fn most_recently_active(&self) -> Option<Flow> {
        self.lock_table()
            .flows_by_tap
            .values()
            .filter(|flow| flow.is_active())
            .max_by_key(|flow| (flow.last_activity(), flow.id()))
            .cloned()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Idle timeout applied to flows started from now on.
    ///
    /// # Errors
    ///
    /// - `ManagerError::Config` if `timeout_ms` is zero; the current value is kept
    pub fn set_default_idle_timeout(&self, timeout_ms: u64) -> Result<(), ManagerError> {
        check_idle_timeout(timeout_ms)?;
        info!(timeout_ms, "Default idle timeout changed");
        self.inner
            .default_idle_timeout_ms
            .store(timeout_ms, Ordering::Relaxed);
        Ok(())
    }

    pub fn default_idle_timeout(&self) -> u64 {
        self.inner.default_idle_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn min_flow_start_ticks(&self) -> u64 {
        self.inner.min_flow_start_ticks
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Attaches a listener. Returns false if it was already attached.
    pub fn add_listener(&self, listener: Arc<dyn FlowListener>) -> bool {
        self.inner.notifier.add_listener(listener)
    }

    /// Detaches a listener. Returns false if it was not attached.
    pub fn remove_listener<L: FlowListener + ?Sized>(&self, listener: &Arc<L>) -> bool {
        self.inner.notifier.remove_listener(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.notifier.listener_count()
    }
}
