//! Startup-Activity Ledger
//!
//! Per-process bookkeeping of in-flight startup prerequisites. A
//! [`StartupActivity`] handle *is* the record of one pending prerequisite:
//! creating it counts the prerequisite as running, finishing (or dropping)
//! it counts it as done. Finishing one prerequisite may synchronously start
//! new ones, so "running reached zero" is never trusted immediately: the
//! ledger moves to a draining phase and re-checks one debounce tick later,
//! and anything started in between cancels the pending re-check.
//!
//! The phases form an explicit state machine:
//!
//! ```text
//! Idle --(running hits 0)--> Draining --(tick fires, still idle)--> Announced
//!   ^                           |
//!   '----(activity starts)------'
//! ```
//!
//! Announced is terminal and fires the process-wide readiness latch exactly
//! once; reaching it twice is a contract violation and panics.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Running hit zero; a re-check with this epoch is pending
    Draining {
        epoch: u64,
    },
    Announced,
}

#[derive(Debug)]
struct LedgerState {
    phase: Phase,
    running: u32,
    /// Monotonic count of activities ever begun
    ever_started: u64,
    /// External requestors (a pending barrier answer) that veto announcing
    holds: u32,
    /// Bumped for every new draining phase; stale re-checks miss it
    epoch: u64,
}

struct LedgerInner {
    state: Mutex<LedgerState>,
    ready_tx: watch::Sender<bool>,
    tick: Duration,
}

/// Process-wide startup-activity ledger; cheap to clone
#[derive(Clone)]
pub struct StartupLedger {
    inner: Arc<LedgerInner>,
}

impl StartupLedger {
    pub fn new(tick: Duration) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(LedgerInner {
                state: Mutex::new(LedgerState {
                    phase: Phase::Idle,
                    running: 0,
                    ever_started: 0,
                    holds: 0,
                    epoch: 0,
                }),
                ready_tx,
                tick,
            }),
        }
    }

    /// Begin tracking one startup prerequisite
    pub fn begin(&self, label: impl Into<String>) -> StartupActivity {
        let label = label.into();
        {
            let mut state = self.inner.state.lock();
            state.running += 1;
            state.ever_started += 1;
            // A start during draining invalidates the pending re-check.
            if matches!(state.phase, Phase::Draining { .. }) {
                state.phase = Phase::Idle;
            }
            trace!(label = %label, running = state.running, "startup activity began");
        }
        StartupActivity {
            ledger: self.clone(),
            label,
            done: false,
        }
    }

    /// Veto readiness while an external answer is still pending
    pub fn hold(&self) -> LedgerHold {
        self.inner.state.lock().holds += 1;
        LedgerHold {
            ledger: self.clone(),
        }
    }

    /// Latch observer; flips to `true` exactly once
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    /// Await the readiness latch
    pub async fn wait_ready(&self) {
        let mut rx = self.ready();
        // wait_for never errs while the ledger itself holds the sender
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn running(&self) -> u32 {
        self.inner.state.lock().running
    }

    pub fn ever_started(&self) -> u64 {
        self.inner.state.lock().ever_started
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    fn finished(&self, label: &str) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.running > 0, "activity finished that never began");
        state.running -= 1;
        trace!(label = %label, running = state.running, "startup activity finished");
        if state.running == 0 {
            self.schedule_recheck(&mut state);
        }
    }

    fn released(&self) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.holds > 0, "released a hold that was never taken");
        state.holds -= 1;
        // The hold may have been the last thing standing between a quiet
        // ledger and the announcement; re-run the drain.
        if state.holds == 0 && state.running == 0 {
            self.schedule_recheck(&mut state);
        }
    }

    /// Enter (or re-enter) Draining and arm the debounced re-check
    fn schedule_recheck(&self, state: &mut LedgerState) {
        if state.phase == Phase::Announced {
            return;
        }
        state.epoch += 1;
        let epoch = state.epoch;
        state.phase = Phase::Draining { epoch };

        let ledger = self.clone();
        let tick = self.inner.tick;
        tokio::spawn(async move {
            tokio::time::sleep(tick).await;
            ledger.recheck(epoch);
        });
    }

    fn recheck(&self, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.phase != (Phase::Draining { epoch }) {
            // Canceled: something started (or a newer drain superseded us)
            // between scheduling and firing.
            trace!(epoch, "stale readiness re-check ignored");
            return;
        }
        if state.running > 0 || state.holds > 0 {
            state.phase = Phase::Idle;
            return;
        }

        assert!(
            !*self.inner.ready_tx.borrow(),
            "process readiness announced twice"
        );
        state.phase = Phase::Announced;
        debug!(
            ever_started = state.ever_started,
            "all startup activities finished"
        );
        drop(state);
        self.inner.ready_tx.send_replace(true);
    }
}

impl std::fmt::Debug for StartupLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StartupLedger")
            .field("phase", &state.phase)
            .field("running", &state.running)
            .field("ever_started", &state.ever_started)
            .field("holds", &state.holds)
            .finish()
    }
}

/// Live record of one pending startup prerequisite
pub struct StartupActivity {
    ledger: StartupLedger,
    label: String,
    done: bool,
}

impl StartupActivity {
    /// Complete the prerequisite explicitly
    pub fn finish(mut self) {
        self.complete();
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn complete(&mut self) {
        if !self.done {
            self.done = true;
            self.ledger.finished(&self.label);
        }
    }
}

impl Drop for StartupActivity {
    fn drop(&mut self) {
        self.complete();
    }
}

impl std::fmt::Debug for StartupActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupActivity")
            .field("label", &self.label)
            .field("done", &self.done)
            .finish()
    }
}

/// Start/finish pair for call sites that only sometimes need tracking.
/// `finish` without a prior `start` is a contract violation.
#[derive(Debug, Default)]
pub struct OptionalStartupActivity {
    activity: Option<StartupActivity>,
}

impl OptionalStartupActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, ledger: &StartupLedger, label: impl Into<String>) {
        assert!(
            self.activity.is_none(),
            "startup activity started twice without finishing"
        );
        self.activity = Some(ledger.begin(label));
    }

    pub fn finish(&mut self) {
        self.activity
            .take()
            .expect("finished a startup activity that was never started")
            .finish();
    }

    pub fn is_started(&self) -> bool {
        self.activity.is_some()
    }
}

/// Readiness veto held while an external answer is outstanding
pub struct LedgerHold {
    ledger: StartupLedger,
}

impl Drop for LedgerHold {
    fn drop(&mut self) {
        self.ledger.released();
    }
}

impl std::fmt::Debug for LedgerHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHold").finish()
    }
}
