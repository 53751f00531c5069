//! Cluster Controller
//!
//! Runs reconciliation passes against the workload API:
//! - one pass at a time per cluster, passes for different clusters in parallel
//! - desired-state events arriving mid-pass are coalesced into one follow-up pass
//! - rejected specs are reported and never applied; the last accepted
//!   topology stays in place until a new spec arrives

use crate::controlplane::backends::BackendConfig;
use crate::controlplane::metrics::{
    ControllerMetrics, PASS_CONVERGED, PASS_FAILED, PASS_PROGRESSING, PASS_REJECTED,
};
use crate::controlplane::reconciler::{Intent, ReconcilePlan, Reconciler};
use crate::controlplane::state::{ClusterRecord, ClusterStatusView, ControllerEvent, Rejection};
use crate::crd::ClusterPhase;
use crate::domain::ports::WorkloadApiRef;
use crate::error::{Error, Result};
use crate::topology::{ClusterKey, ClusterSpec, QuorumGuard, DEFAULT_MAX_MASTERS};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the cluster controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ceiling on master-eligible replicas per cluster
    pub max_masters: u32,
    /// Requeue interval once a cluster has converged
    pub converged_requeue_secs: u64,
    /// Requeue interval while workloads are still coming up
    pub progressing_requeue_secs: u64,
    /// Field manager for server-side writes
    pub field_manager: String,
    /// Workload backend configuration
    pub backend: BackendConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_masters: DEFAULT_MAX_MASTERS,
            converged_requeue_secs: 300,
            progressing_requeue_secs: 10,
            field_manager: "elasticsearch-operator".to_string(),
            backend: BackendConfig::default(),
        }
    }
}

// =============================================================================
// Pass Outcome
// =============================================================================

/// Result of one successful pass
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub key: ClusterKey,
    pub phase: ClusterPhase,
    pub plan: ReconcilePlan,
    /// Intents applied to the substrate
    pub applied: usize,
}

// =============================================================================
// Cluster Slot
// =============================================================================

/// Work queued for the next pass of a cluster
enum Request {
    /// Converge onto a newly submitted spec
    Desired(ClusterSpec),
    /// Revisit the accepted spec
    Resync,
}

impl Request {
    fn is_desired(&self) -> bool {
        matches!(self, Request::Desired(_))
    }
}

/// Per-cluster serialization point
struct ClusterSlot {
    key: ClusterKey,
    /// Held for the whole duration of a pass
    pass: Mutex<()>,
    /// State published at the end of each pass; readers never wait on `pass`
    record: RwLock<ClusterRecord>,
    /// Latest request not yet picked up by a pass
    pending: parking_lot::Mutex<Option<Request>>,
    /// Set while a submitter is draining `pending`
    draining: AtomicBool,
    /// Set once the cluster is forgotten; later requests start a new slot
    retired: AtomicBool,
}

impl ClusterSlot {
    fn new(key: ClusterKey, max_masters: u32) -> Self {
        Self {
            record: RwLock::new(ClusterRecord::new(key.clone(), max_masters)),
            key,
            pass: Mutex::new(()),
            pending: parking_lot::Mutex::new(None),
            draining: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn queue(&self, request: Request) {
        let mut pending = self.pending.lock();
        // A resync never displaces a submitted spec
        if request.is_desired() || pending.is_none() {
            *pending = Some(request);
        }
    }
}

/// Clears the draining flag, also when the draining future is dropped
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Cluster Controller
// =============================================================================

/// Converges clusters onto their desired topology
pub struct ClusterController {
    config: ControllerConfig,
    reconciler: Reconciler,
    workloads: WorkloadApiRef,
    slots: DashMap<ClusterKey, Arc<ClusterSlot>>,
    metrics: ControllerMetrics,
    event_sender: broadcast::Sender<ControllerEvent>,
}

impl ClusterController {
    /// Create a new controller over a workload API
    pub fn new(config: ControllerConfig, workloads: WorkloadApiRef) -> Result<Arc<Self>> {
        let guard = QuorumGuard::new(config.max_masters)?;
        let (event_sender, _) = broadcast::channel(1024);

        info!(
            "Cluster controller using {} workloads, max {} masters",
            workloads.backend_name(),
            guard.max_masters()
        );

        Ok(Arc::new(Self {
            config,
            reconciler: Reconciler::new(guard),
            workloads,
            slots: DashMap::new(),
            metrics: ControllerMetrics::new()?,
            event_sender,
        }))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    pub fn workloads(&self) -> &WorkloadApiRef {
        &self.workloads
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.event_sender.send(event);
    }

    fn slot(&self, key: &ClusterKey) -> Arc<ClusterSlot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(ClusterSlot::new(
                    key.clone(),
                    self.reconciler.guard().max_masters(),
                ))
            })
            .clone()
    }

    fn existing(&self, key: &ClusterKey) -> Option<Arc<ClusterSlot>> {
        self.slots.get(key).map(|s| s.value().clone())
    }

    /// Run one pass for `desired`, waiting for any pass in flight for the
    /// same cluster to finish first.
    pub async fn reconcile(&self, desired: ClusterSpec) -> Result<PassOutcome> {
        loop {
            let slot = self.slot(&desired.key);
            let _pass = slot.pass.lock().await;
            if slot.is_retired() {
                continue;
            }
            return self.pass_on(&slot, desired).await;
        }
    }

    /// Hand a new desired spec to the controller.
    ///
    /// Runs passes until no newer spec is pending and returns the result of
    /// the last one. Returns None when another submitter is already running
    /// passes for this cluster; it picks the spec up before it returns.
    pub async fn submit(&self, desired: ClusterSpec) -> Option<Result<PassOutcome>> {
        let slot = self.slot(&desired.key);
        self.enqueue(slot, Request::Desired(desired)).await
    }

    async fn enqueue(&self, mut slot: Arc<ClusterSlot>, request: Request) -> Option<Result<PassOutcome>> {
        let mut carried = Some(request);
        let mut last = None;

        loop {
            if let Some(request) = carried.take() {
                slot.queue(request);
            }
            if slot.draining.swap(true, Ordering::AcqRel) {
                debug!(cluster = %slot.key, "Pass in flight, coalescing desired state");
                return last;
            }
            let draining = DrainGuard(&slot.draining);
            let pass = slot.pass.lock().await;

            if slot.is_retired() {
                drop(pass);
                drop(draining);
                // Carry a submitted spec over to the cluster's next slot
                carried = slot.pending.lock().take().filter(Request::is_desired);
                if carried.is_none() {
                    return last;
                }
                slot = self.slot(&slot.key);
                continue;
            }

            loop {
                let next = slot.pending.lock().take();
                let Some(next) = next else { break };
                if let Some(result) = self.serve(&slot, next).await {
                    last = Some(result);
                }
            }
            drop(pass);
            drop(draining);

            // A request may have landed between the last take and clearing the flag
            if slot.pending.lock().is_none() {
                return last;
            }
        }
    }

    /// Run a pass on a copy of the slot's record and publish it afterwards.
    /// The caller holds the slot's pass lock.
    async fn pass_on(&self, slot: &ClusterSlot, desired: ClusterSpec) -> Result<PassOutcome> {
        let mut record = slot.record.read().clone();
        let result = self.run_pass(&mut record, desired).await;
        *slot.record.write() = record;
        result
    }

    async fn serve(&self, slot: &ClusterSlot, request: Request) -> Option<Result<PassOutcome>> {
        match request {
            Request::Desired(desired) => Some(self.pass_on(slot, desired).await),
            Request::Resync => {
                let (phase, accepted) = {
                    let record = slot.record.read();
                    (record.phase, record.accepted.clone())
                };
                match (phase, accepted) {
                    (ClusterPhase::Reconciling | ClusterPhase::Converged, Some(accepted)) => {
                        Some(self.pass_on(slot, accepted).await)
                    }
                    (ClusterPhase::Rejected, Some(_)) => {
                        let mut record = slot.record.read().clone();
                        let result = self.hold_accepted(&mut record).await;
                        *slot.record.write() = record;
                        result.err().map(Err)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Record that the latest desired state failed validation
    pub async fn record_invalid(&self, key: &ClusterKey, generation: Option<i64>, error: &Error) {
        loop {
            let slot = self.slot(key);
            let _pass = slot.pass.lock().await;
            if slot.is_retired() {
                continue;
            }
            let mut record = slot.record.write();
            // Invalid is reachable from every phase
            let _ = record.transition(ClusterPhase::Invalid);
            record.generation = generation;
            record.last_error = Some(error.to_string());
            record.last_pass = Some(Utc::now());
            break;
        }

        warn!(cluster = %key, error = %error, "Desired state is invalid");
        self.metrics.record_pass(PASS_REJECTED);
        self.emit(ControllerEvent::Invalid {
            cluster: key.to_string(),
            reason: error.to_string(),
        });
    }

    /// Delete every workload of a cluster and drop its state
    pub async fn forget(&self, key: &ClusterKey) -> Result<()> {
        let Some(slot) = self.existing(key) else {
            return Ok(());
        };
        let _pass = slot.pass.lock().await;
        if slot.is_retired() {
            return Ok(());
        }

        self.pass_on(&slot, ClusterSpec::new(key.clone())).await?;
        self.retire(&slot);
        Ok(())
    }

    /// Drop the state of a cluster whose workloads the substrate removes
    /// on its own, e.g. through owner references.
    pub async fn release(&self, key: &ClusterKey) {
        let Some(slot) = self.existing(key) else {
            return;
        };
        let _pass = slot.pass.lock().await;
        if !slot.is_retired() {
            self.retire(&slot);
        }
    }

    /// Remove a slot from the map. The caller holds its pass lock.
    fn retire(&self, slot: &Arc<ClusterSlot>) {
        slot.retired.store(true, Ordering::Release);
        self.slots.remove_if(&slot.key, |_, s| Arc::ptr_eq(s, slot));

        let cluster = slot.key.to_string();
        self.metrics.forget_cluster(&cluster);
        self.emit(ControllerEvent::Forgotten {
            cluster: cluster.clone(),
        });
        info!(cluster = %cluster, "Cluster removed");
    }

    /// Revisit every cluster with an accepted spec: progressing and converged
    /// clusters get a pass against it, rejected ones have it restored.
    /// Invalid clusters wait for a new spec.
    pub async fn resync(&self) {
        let slots: Vec<Arc<ClusterSlot>> = self.slots.iter().map(|s| s.value().clone()).collect();

        for slot in slots {
            let due = {
                let record = slot.record.read();
                record.accepted.is_some()
                    && matches!(
                        record.phase,
                        ClusterPhase::Reconciling | ClusterPhase::Converged | ClusterPhase::Rejected
                    )
            };
            if !due {
                continue;
            }
            match self.enqueue(slot, Request::Resync).await {
                Some(Err(e)) if !e.is_rejection() => debug!(error = %e, "Resync pass failed"),
                _ => {}
            }
        }
    }

    /// Snapshot of the state kept for a cluster
    pub fn record(&self, key: &ClusterKey) -> Option<ClusterRecord> {
        self.slots.get(key).map(|s| s.record.read().clone())
    }

    /// Status of one cluster
    pub fn status(&self, key: &ClusterKey) -> Option<ClusterStatusView> {
        self.slots.get(key).map(|s| s.record.read().view())
    }

    /// Status of every known cluster, sorted by key
    pub fn statuses(&self) -> Vec<ClusterStatusView> {
        let mut views: Vec<ClusterStatusView> =
            self.slots.iter().map(|s| s.record.read().view()).collect();
        views.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        views
    }

    /// How long to wait before looking at a cluster again, if at all
    pub fn requeue_after(&self, phase: ClusterPhase) -> Option<Duration> {
        match phase {
            ClusterPhase::Converged => Some(Duration::from_secs(self.config.converged_requeue_secs)),
            ClusterPhase::Unreconciled | ClusterPhase::Reconciling => {
                Some(Duration::from_secs(self.config.progressing_requeue_secs))
            }
            ClusterPhase::Rejected | ClusterPhase::Invalid => None,
        }
    }

    // =========================================================================
    // Pass
    // =========================================================================

    async fn run_pass(&self, record: &mut ClusterRecord, desired: ClusterSpec) -> Result<PassOutcome> {
        let cluster = desired.key.to_string();

        if record.is_same_rejection(&desired) {
            debug!(cluster = %cluster, "Spec unchanged since rejection, holding accepted state");
            // Workload API failures are already recorded on the record
            let _ = self.hold_accepted(record).await;
            return Err(self.rejection_error(record));
        }

        let previous = record.phase;
        record.transition(ClusterPhase::Reconciling)?;
        record.generation = desired.generation;
        record.passes += 1;
        record.last_pass = Some(Utc::now());
        self.emit(ControllerEvent::PassStarted {
            cluster: cluster.clone(),
        });

        if let Err(err) = self.reconciler.guard().validate(&desired) {
            let err = self.reject(record, &desired, err);
            let _ = self.hold_accepted(record).await;
            return Err(err);
        }
        record.rejection = None;
        record.accepted = Some(desired.clone());

        let (plan, applied) = self.converge(record, &desired).await?;

        let phase = if plan.is_converged() {
            ClusterPhase::Converged
        } else {
            ClusterPhase::Reconciling
        };
        record.transition(phase)?;

        if phase == ClusterPhase::Converged {
            self.metrics.record_pass(PASS_CONVERGED);
            if previous != ClusterPhase::Converged {
                info!(cluster = %cluster, workloads = plan.desired_workloads, "Cluster converged");
                self.emit(ControllerEvent::Converged {
                    cluster: cluster.clone(),
                    workloads: plan.desired_workloads,
                });
            }
        } else {
            self.metrics.record_pass(PASS_PROGRESSING);
            info!(
                cluster = %cluster,
                applied,
                ready = plan.ready_workloads,
                desired = plan.desired_workloads,
                "Reconcile pass complete"
            );
        }

        Ok(PassOutcome {
            key: desired.key,
            phase,
            plan,
            applied,
        })
    }

    /// List, plan and apply for a spec that passed the guard.
    /// Stops at the first workload API error.
    async fn converge(&self, record: &mut ClusterRecord, spec: &ClusterSpec) -> Result<(ReconcilePlan, usize)> {
        let cluster = spec.key.to_string();

        let observed = match self.workloads.list(&spec.key).await {
            Ok(observed) => observed,
            Err(err) => return Err(self.fail(record, err)),
        };
        record.workloads = observed.iter().map(|w| w.identity.name()).collect();
        self.metrics.set_workloads(&cluster, observed.len());

        let plan = match self.reconciler.plan(spec, &observed) {
            Ok(plan) => plan,
            Err(err) => return Err(self.fail(record, err)),
        };
        record.master_count = plan.master_count;
        record.desired_workloads = plan.desired_workloads;
        record.ready_workloads = plan.ready_workloads;

        let mut applied = 0;
        for intent in &plan.intents {
            if let Err(err) = self.apply(intent).await {
                warn!(
                    cluster = %cluster,
                    applied,
                    remaining = plan.intents.len() - applied,
                    "Stopping pass on workload API error"
                );
                return Err(self.fail(record, err));
            }
            applied += 1;
            self.metrics.record_intent(intent.kind().as_str());
            self.emit(ControllerEvent::IntentApplied {
                cluster: cluster.clone(),
                kind: intent.kind().to_string(),
                workload: intent.identity().name(),
            });
        }
        record.last_error = None;

        Ok((plan, applied))
    }

    /// Keep the last accepted topology in place while a newer spec is
    /// refused. The phase stays Rejected.
    async fn hold_accepted(&self, record: &mut ClusterRecord) -> Result<()> {
        let Some(accepted) = record.accepted.clone() else {
            return Ok(());
        };
        let (_, applied) = self.converge(record, &accepted).await?;
        if applied > 0 {
            info!(cluster = %record.key, applied, "Restored accepted workloads");
        }
        Ok(())
    }

    async fn apply(&self, intent: &Intent) -> Result<()> {
        debug!("Applying intent: {}", intent);
        match intent {
            Intent::CreateWorkload { identity, template } => {
                self.workloads.create(identity, template).await
            }
            Intent::UpdateWorkloadReplicas { identity, replicas } => {
                self.workloads.update(identity, *replicas).await
            }
            Intent::ReplaceWorkload { identity, template } => {
                self.workloads.replace(identity, template).await
            }
            Intent::DeleteWorkload { identity } => self.workloads.delete(identity).await,
        }
    }

    /// Record a guard rejection; the rejected spec is never applied
    fn reject(&self, record: &mut ClusterRecord, desired: &ClusterSpec, err: Error) -> Error {
        if let Error::QuorumExceeded {
            master_count,
            max_masters,
            ..
        } = &err
        {
            record.rejection = Some(Rejection {
                master_count: *master_count,
                max_masters: *max_masters,
                fingerprint: desired.fingerprint(),
                at: Utc::now(),
            });
            self.metrics.record_rejection();
            self.emit(ControllerEvent::Rejected {
                cluster: desired.key.to_string(),
                master_count: *master_count,
                max_masters: *max_masters,
            });
        }
        let _ = record.transition(ClusterPhase::Rejected);
        self.metrics.record_pass(PASS_REJECTED);
        warn!(cluster = %desired.key, error = %err, "Desired state rejected");
        err
    }

    /// Record a workload API failure; the next pass starts from a fresh diff
    fn fail(&self, record: &mut ClusterRecord, err: Error) -> Error {
        record.last_error = Some(err.to_string());
        self.metrics.record_pass(PASS_FAILED);
        self.emit(ControllerEvent::PassFailed {
            cluster: record.key.to_string(),
            error: err.to_string(),
        });
        warn!(cluster = %record.key, error = %err, "Reconcile pass failed");
        err
    }

    fn rejection_error(&self, record: &ClusterRecord) -> Error {
        match &record.rejection {
            Some(r) => Error::QuorumExceeded {
                cluster: record.key.to_string(),
                master_count: r.master_count,
                max_masters: r.max_masters,
            },
            None => Error::Internal(format!("cluster {} rejected without cause", record.key)),
        }
    }
}
