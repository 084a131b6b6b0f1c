//! Escrow Engine - milestone state machine and payment accounting
//!
//! Every external command enters here. Each one authorizes the caller
//! against the project's recorded roles, validates the state transition,
//! mutates the ledger store, and optionally issues value transfers. The
//! whole unit of work runs under one exclusive store guard, and payouts
//! commit the status flip and accounting totals before invoking the
//! transfer capability: a retry or re-entrant call finds the milestone
//! already `Paid` and fails the ordinary state check.

use crate::EscrowResult;
use crate::clock::{Clock, SystemClock};
use crate::error::EscrowError;
use crate::models::{
    EscrowEvent, Milestone, MilestoneStatus, PayoutReceipt, Project, ProjectStats, RefundReceipt,
    Resolution, RoleInfo, manager_fee_sats,
};
use crate::store::LedgerStore;
use crate::transfer::{Payment, TransferProvider};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub use crate::models::MilestoneSpec;

/// Configuration for the escrow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Smallest escrowable milestone amount (rejects dust entries)
    pub min_milestone_amount_sats: i64,
    /// Largest escrowable milestone amount
    pub max_milestone_amount_sats: i64,
    /// Maximum milestones per project
    pub max_milestones: usize,
    /// Maximum milestone description length in characters
    pub max_description_len: usize,
    /// Manager commission cap in basis points (2000 = 20%)
    pub max_fee_bps: u32,
    /// How long an unaccepted assignment survives before anyone may clear it
    pub assignment_timeout_hours: u32,
    /// How long a submission waits for review before anyone may release it
    pub submission_timeout_hours: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_milestone_amount_sats: 1_000,
            max_milestone_amount_sats: 1_000_000_000, // 10 BTC
            max_milestones: 50,
            max_description_len: 500,
            max_fee_bps: 2_000,
            assignment_timeout_hours: 168, // 7 days
            submission_timeout_hours: 336, // 14 days
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ESCROW_`-prefixed environment variables,
    /// falling back to the defaults above.
    pub fn from_env() -> EscrowResult<Self> {
        let cfg = config::Config::builder()
            .set_default("min_milestone_amount_sats", 1_000i64)?
            .set_default("max_milestone_amount_sats", 1_000_000_000i64)?
            .set_default("max_milestones", 50i64)?
            .set_default("max_description_len", 500i64)?
            .set_default("max_fee_bps", 2_000i64)?
            .set_default("assignment_timeout_hours", 168i64)?
            .set_default("submission_timeout_hours", 336i64)?
            .add_source(config::Environment::with_prefix("ESCROW"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::hours(i64::from(self.assignment_timeout_hours))
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::hours(i64::from(self.submission_timeout_hours))
    }

    /// Emergency reclaim window, measured from milestone creation
    pub fn emergency_timeout(&self) -> Duration {
        self.submission_timeout() * 2
    }
}

/// Project creation request. The deposit must equal the milestone total in
/// the same atomic step as creation; mismatch is a creation-time failure.
#[derive(Debug, Clone)]
pub struct CreateProjectRequest {
    pub client: String,
    pub manager: Option<String>,
    pub pm_fee_bps: u32,
    /// Fixed worker for the whole project (direct flow). Mutually exclusive
    /// with per-milestone initial assignees.
    pub worker: Option<String>,
    pub milestones: Vec<MilestoneSpec>,
    pub deposit_sats: i64,
}

/// Main escrow engine coordinating the milestone lifecycle
pub struct EscrowEngine {
    config: EngineConfig,
    store: Arc<LedgerStore>,
    transfers: Arc<dyn TransferProvider>,
    clock: Arc<dyn Clock>,
    /// In-process audit trail, kept for the lifetime of the engine. Events
    /// append after the store guard is released, so ordering between
    /// concurrent commands is best-effort; within a single awaited command
    /// the order is exact.
    events: RwLock<Vec<EscrowEvent>>,
}

impl EscrowEngine {
    /// Create an engine reading wall-clock time
    pub fn new(
        config: EngineConfig,
        store: Arc<LedgerStore>,
        transfers: Arc<dyn TransferProvider>,
    ) -> Self {
        Self::with_clock(config, store, transfers, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock (tests, simulations)
    pub fn with_clock(
        config: EngineConfig,
        store: Arc<LedgerStore>,
        transfers: Arc<dyn TransferProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            transfers,
            clock,
            events: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- commands ----------------------------------------------------

    /// Create a fully-funded project. The caller becomes the client.
    pub async fn create_project(&self, request: CreateProjectRequest) -> EscrowResult<Project> {
        self.validate_create(&request)?;

        let now = self.clock.now();
        let client = request.client.clone();
        let deposit_sats = request.deposit_sats;
        let milestones: Vec<Milestone> = request
            .milestones
            .into_iter()
            .map(|spec| Milestone::new(spec.description, spec.amount_sats, spec.assignee, now))
            .collect();

        let project = Project::new(
            request.client,
            request.manager,
            request.pm_fee_bps,
            request.worker,
            milestones,
            now,
        );
        let id = self.store.create_project(project).await;
        let project = self.store.get_project(id).await?;

        self.record_event(
            "project.created",
            id,
            None,
            Some(&client),
            Some(project.total_sats),
            Some(json!({
                "milestones": project.milestones.len(),
                "deposit_sats": deposit_sats,
                "direct": project.is_direct(),
            })),
        )
        .await;

        info!(
            "Created project {} with {} milestones ({} sats escrowed)",
            id,
            project.milestones.len(),
            project.total_sats
        );

        Ok(project)
    }

    /// Propose a worker for a milestone (client or manager)
    pub async fn assign(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
        assignee: &str,
    ) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            project.milestone(index)?;

            if !project.is_supervisor(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client or manager may assign a milestone",
                ));
            }
            if project.is_direct() {
                return Err(EscrowError::validation(
                    "project binds a fixed worker; per-milestone assignment does not apply",
                ));
            }
            if assignee.trim().is_empty() {
                return Err(EscrowError::validation("assignee cannot be empty"));
            }
            if project.is_client(assignee) || project.is_manager(assignee) {
                return Err(EscrowError::validation(
                    "client and manager cannot be assigned to a milestone",
                ));
            }

            let status = project.milestone(index)?.status;
            if !status.can_assign() {
                return Err(transition_err(
                    status,
                    MilestoneStatus::Assigned,
                    "only unassigned milestones can be assigned",
                ));
            }

            let milestone = project.milestone_mut(index)?;
            milestone.assignee = Some(assignee.to_string());
            milestone.status = MilestoneStatus::Assigned;
            milestone.assigned_at = Some(now);
            project.updated_at = now;
        }

        self.record_event(
            "milestone.assigned",
            project_id,
            Some(index),
            Some(caller),
            None,
            Some(json!({ "assignee": assignee })),
        )
        .await;
        info!("Assigned milestone {index} of project {project_id} to {assignee}");

        Ok(())
    }

    /// Accept an assignment (assignee)
    pub async fn accept(&self, caller: &str, project_id: u64, index: usize) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let milestone = project.milestone(index)?;

            if milestone.assignee.as_deref() != Some(caller) {
                return Err(EscrowError::unauthorized(
                    "only the assigned worker may accept",
                ));
            }
            if !milestone.status.can_resolve_assignment() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Accepted,
                    "milestone has no pending assignment",
                ));
            }

            let milestone = project.milestone_mut(index)?;
            milestone.status = MilestoneStatus::Accepted;
            milestone.accepted_at = Some(now);
            project.updated_at = now;
        }

        self.record_event(
            "milestone.accepted",
            project_id,
            Some(index),
            Some(caller),
            None,
            None,
        )
        .await;
        info!("Milestone {index} of project {project_id} accepted by {caller}");

        Ok(())
    }

    /// Decline an assignment, clearing the assignee (assignee)
    pub async fn decline(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
        reason: &str,
    ) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let milestone = project.milestone(index)?;

            if milestone.assignee.as_deref() != Some(caller) {
                return Err(EscrowError::unauthorized(
                    "only the assigned worker may decline",
                ));
            }
            if !milestone.status.can_resolve_assignment() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Created,
                    "milestone has no pending assignment",
                ));
            }

            clear_assignment(project.milestone_mut(index)?);
            project.updated_at = now;
        }

        self.record_event(
            "milestone.declined",
            project_id,
            Some(index),
            Some(caller),
            None,
            Some(json!({ "reason": reason })),
        )
        .await;
        info!("Milestone {index} of project {project_id} declined by {caller}: {reason}");

        Ok(())
    }

    /// Withdraw an unaccepted assignment (client or manager)
    pub async fn unassign(&self, caller: &str, project_id: u64, index: usize) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            project.milestone(index)?;

            if !project.is_supervisor(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client or manager may unassign",
                ));
            }
            let status = project.milestone(index)?.status;
            if !status.can_resolve_assignment() {
                return Err(transition_err(
                    status,
                    MilestoneStatus::Created,
                    "milestone has no pending assignment",
                ));
            }

            clear_assignment(project.milestone_mut(index)?);
            project.updated_at = now;
        }

        self.record_event(
            "milestone.unassigned",
            project_id,
            Some(index),
            Some(caller),
            None,
            None,
        )
        .await;
        info!("Milestone {index} of project {project_id} unassigned by {caller}");

        Ok(())
    }

    /// Clear an assignment that was never accepted within the assignment
    /// timeout. Open to any caller, enabling reassignment without client or
    /// manager action.
    pub async fn expire_assignment(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
    ) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let milestone = project.milestone(index)?;

            if !milestone.status.can_resolve_assignment() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Created,
                    "milestone has no pending assignment",
                ));
            }
            let assigned_at = milestone
                .assigned_at
                .ok_or_else(|| EscrowError::internal("assigned milestone without assigned_at"))?;
            if now < assigned_at + self.config.assignment_timeout() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Created,
                    "assignment timeout not reached",
                ));
            }

            clear_assignment(project.milestone_mut(index)?);
            project.updated_at = now;
        }

        self.record_event(
            "milestone.assignment_expired",
            project_id,
            Some(index),
            Some(caller),
            None,
            None,
        )
        .await;
        info!("Assignment of milestone {index} in project {project_id} expired");

        Ok(())
    }

    /// Begin work on an accepted milestone (assignee)
    pub async fn start(&self, caller: &str, project_id: u64, index: usize) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let milestone = project.milestone(index)?;

            if project.effective_assignee(milestone) != Some(caller) {
                return Err(EscrowError::unauthorized(
                    "only the assigned worker may start",
                ));
            }
            if !milestone.status.can_start() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::InProgress,
                    "work can only start on an accepted milestone",
                ));
            }

            project.milestone_mut(index)?.status = MilestoneStatus::InProgress;
            project.updated_at = now;
        }

        self.record_event(
            "milestone.started",
            project_id,
            Some(index),
            Some(caller),
            None,
            None,
        )
        .await;
        info!("Work started on milestone {index} of project {project_id}");

        Ok(())
    }

    /// Submit deliverables for review (assignee). Fixed-worker projects may
    /// submit straight from `Created` without an explicit start.
    pub async fn submit(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
        note: &str,
    ) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let direct = project.is_direct();
            let milestone = project.milestone(index)?;

            if project.effective_assignee(milestone) != Some(caller) {
                return Err(EscrowError::unauthorized(
                    "only the assigned worker may submit",
                ));
            }
            if note.trim().is_empty() {
                return Err(EscrowError::validation("submission note cannot be empty"));
            }
            if !milestone.status.can_submit(direct) {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Submitted,
                    "milestone is not in a submittable state",
                ));
            }

            let milestone = project.milestone_mut(index)?;
            milestone.status = MilestoneStatus::Submitted;
            milestone.submitted_at = Some(now);
            milestone.submission_note = Some(note.to_string());
            project.updated_at = now;
        }

        self.record_event(
            "milestone.submitted",
            project_id,
            Some(index),
            Some(caller),
            None,
            Some(json!({ "note": note })),
        )
        .await;
        info!("Milestone {index} of project {project_id} submitted by {caller}");

        Ok(())
    }

    /// Approve submitted work and pay it out immediately (client)
    pub async fn approve(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
    ) -> EscrowResult<PayoutReceipt> {
        let now = self.clock.now();
        let receipt = {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let status = project.milestone(index)?.status;

            if !project.is_client(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client may approve a submission",
                ));
            }
            if !status.can_review() {
                return Err(transition_err(
                    status,
                    MilestoneStatus::Paid,
                    "only submitted work can be approved",
                ));
            }

            self.pay_milestone(project, index, Resolution::PaidOut, false, now)
                .await?
        };

        self.record_event(
            "milestone.approved",
            project_id,
            Some(index),
            Some(caller),
            Some(receipt.amount_sats),
            Some(json!({
                "assignee_amount_sats": receipt.assignee_amount_sats,
                "manager_fee_sats": receipt.manager_fee_sats,
            })),
        )
        .await;
        info!(
            "Approved milestone {index} of project {project_id}: paid {} sats",
            receipt.amount_sats
        );

        Ok(receipt)
    }

    /// Reject submitted work, returning it to `InProgress` (client)
    pub async fn reject(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
        reason: &str,
    ) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let status = project.milestone(index)?.status;

            if !project.is_client(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client may reject a submission",
                ));
            }
            if !status.can_review() {
                return Err(transition_err(
                    status,
                    MilestoneStatus::InProgress,
                    "only submitted work can be rejected",
                ));
            }

            let milestone = project.milestone_mut(index)?;
            milestone.status = MilestoneStatus::InProgress;
            milestone.submitted_at = None;
            milestone.submission_note = None;
            project.updated_at = now;
        }

        self.record_event(
            "milestone.rejected",
            project_id,
            Some(index),
            Some(caller),
            None,
            Some(json!({ "reason": reason })),
        )
        .await;
        info!("Rejected milestone {index} of project {project_id}: {reason}");

        Ok(())
    }

    /// Legacy fixed-worker path: the client marks a milestone ready for
    /// release without an immediate transfer.
    pub async fn complete(&self, caller: &str, project_id: u64, index: usize) -> EscrowResult<()> {
        let now = self.clock.now();
        {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let status = project.milestone(index)?.status;

            if !project.is_client(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client may mark a milestone complete",
                ));
            }
            if !project.is_direct() {
                return Err(EscrowError::validation(
                    "the completion path applies only to fixed-worker projects",
                ));
            }
            if !status.can_complete() {
                return Err(transition_err(
                    status,
                    MilestoneStatus::Approved,
                    "milestone is already approved or settled",
                ));
            }

            project.milestone_mut(index)?.status = MilestoneStatus::Approved;
            project.updated_at = now;
        }

        self.record_event(
            "milestone.completed",
            project_id,
            Some(index),
            Some(caller),
            None,
            None,
        )
        .await;
        info!("Milestone {index} of project {project_id} marked complete");

        Ok(())
    }

    /// Pay out an approved milestone, or a submitted one whose review
    /// window elapsed. Open to any caller; the receipt records whether the
    /// release was timeout-triggered.
    pub async fn release(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
    ) -> EscrowResult<PayoutReceipt> {
        let now = self.clock.now();
        let receipt = {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let milestone = project.milestone(index)?;

            let auto = match milestone.status {
                MilestoneStatus::Approved => false,
                MilestoneStatus::Submitted => {
                    let submitted_at = milestone.submitted_at.ok_or_else(|| {
                        EscrowError::internal("submitted milestone without submitted_at")
                    })?;
                    if now < submitted_at + self.config.submission_timeout() {
                        return Err(transition_err(
                            milestone.status,
                            MilestoneStatus::Paid,
                            "submission review window is still open",
                        ));
                    }
                    true
                }
                status => {
                    return Err(transition_err(
                        status,
                        MilestoneStatus::Paid,
                        "only approved or timed-out submitted milestones can be released",
                    ));
                }
            };

            self.pay_milestone(project, index, Resolution::PaidOut, auto, now)
                .await?
        };

        self.record_event(
            "milestone.released",
            project_id,
            Some(index),
            Some(caller),
            Some(receipt.amount_sats),
            Some(json!({ "auto": receipt.auto_released })),
        )
        .await;
        info!(
            "Released milestone {index} of project {project_id} ({} release)",
            if receipt.auto_released { "auto" } else { "manual" }
        );

        Ok(receipt)
    }

    /// Return the escrowed amount of a stuck, unsubmitted milestone to the
    /// client after the extended emergency timeout (client only).
    pub async fn emergency_reclaim(
        &self,
        caller: &str,
        project_id: u64,
        index: usize,
    ) -> EscrowResult<PayoutReceipt> {
        let now = self.clock.now();
        let receipt = {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;
            let milestone = project.milestone(index)?;

            if !project.is_client(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client may reclaim escrowed funds",
                ));
            }
            if !milestone.status.can_reclaim() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Paid,
                    "submitted or approved work must be resolved through review",
                ));
            }
            if now < milestone.created_at + self.config.emergency_timeout() {
                return Err(transition_err(
                    milestone.status,
                    MilestoneStatus::Paid,
                    "emergency timeout not reached",
                ));
            }

            self.pay_milestone(project, index, Resolution::Reclaimed, false, now)
                .await?
        };

        self.record_event(
            "milestone.reclaimed",
            project_id,
            Some(index),
            Some(caller),
            Some(receipt.amount_sats),
            None,
        )
        .await;
        info!(
            "Reclaimed milestone {index} of project {project_id}: {} sats returned to client",
            receipt.amount_sats
        );

        Ok(receipt)
    }

    /// Cancel a project and refund every unsettled milestone in one atomic
    /// transfer to the client. Rejected while any work is submitted or
    /// approved.
    pub async fn cancel_project(&self, caller: &str, project_id: u64) -> EscrowResult<RefundReceipt> {
        let now = self.clock.now();
        let receipt = {
            let mut guard = self.store.lock().await;
            let project = guard.project_mut(project_id)?;
            ensure_active(project)?;

            if !project.is_client(caller) {
                return Err(EscrowError::unauthorized(
                    "only the client may cancel a project",
                ));
            }
            if let Some(milestone) = project
                .milestones
                .iter()
                .find(|m| matches!(m.status, MilestoneStatus::Submitted | MilestoneStatus::Approved))
            {
                return Err(EscrowError::invalid_transition(
                    format!("{:?}", milestone.status),
                    "Cancelled".to_string(),
                    "submitted or approved work must be resolved before cancellation".to_string(),
                ));
            }

            let refunded: Vec<usize> = project
                .milestones
                .iter()
                .enumerate()
                .filter(|(_, m)| m.status != MilestoneStatus::Paid)
                .map(|(i, _)| i)
                .collect();
            let refund_total: i64 = refunded
                .iter()
                .map(|&i| project.milestones[i].amount_sats)
                .sum();
            if refund_total == 0 {
                return Err(EscrowError::invalid_transition(
                    "Active".to_string(),
                    "Cancelled".to_string(),
                    "all milestones are already settled; nothing to refund".to_string(),
                ));
            }

            // Commit before the refund transfer, roll back if it fails
            let prior: Vec<(usize, MilestoneStatus)> = refunded
                .iter()
                .map(|&i| (i, project.milestones[i].status))
                .collect();
            for &i in &refunded {
                let milestone = project.milestone_mut(i)?;
                milestone.status = MilestoneStatus::Paid;
                milestone.resolution = Some(Resolution::Refunded);
            }
            project.active = false;
            project.total_paid_sats += refund_total;
            project.updated_at = now;

            let refund = [Payment {
                to: project.client.clone(),
                amount_sats: refund_total,
            }];
            if let Err(err) = self.transfers.disburse(&refund).await {
                warn!("Refund transfer failed for project {project_id}, rolling back: {err}");
                for (i, status) in prior {
                    let milestone = project.milestone_mut(i)?;
                    milestone.status = status;
                    milestone.resolution = None;
                }
                project.active = true;
                project.total_paid_sats -= refund_total;
                return Err(err);
            }

            RefundReceipt {
                project_id,
                refunded_sats: refund_total,
                refunded_milestones: refunded,
            }
        };

        self.record_event(
            "project.cancelled",
            project_id,
            None,
            Some(caller),
            Some(receipt.refunded_sats),
            Some(json!({ "refunded_milestones": receipt.refunded_milestones })),
        )
        .await;
        info!(
            "Cancelled project {project_id}: refunded {} sats to client",
            receipt.refunded_sats
        );

        Ok(receipt)
    }

    // ---- queries -----------------------------------------------------

    /// Read a project summary
    pub async fn get_project(&self, project_id: u64) -> EscrowResult<Project> {
        self.store.get_project(project_id).await
    }

    /// Read a single milestone
    pub async fn get_milestone(&self, project_id: u64, index: usize) -> EscrowResult<Milestone> {
        self.store.get_milestone(project_id, index).await
    }

    /// Read all milestones of a project
    pub async fn list_milestones(&self, project_id: u64) -> EscrowResult<Vec<Milestone>> {
        self.store.list_milestones(project_id).await
    }

    /// Aggregate statistics: counts by status and remaining unpaid value
    pub async fn project_stats(&self, project_id: u64) -> EscrowResult<ProjectStats> {
        let project = self.store.get_project(project_id).await?;
        let mut stats = ProjectStats {
            project_id,
            total_milestones: project.milestones.len(),
            created: 0,
            assigned: 0,
            accepted: 0,
            in_progress: 0,
            submitted: 0,
            approved: 0,
            paid: 0,
            total_sats: project.total_sats,
            total_paid_sats: project.total_paid_sats,
            total_manager_fees_sats: project.total_manager_fees_sats,
            remaining_sats: project.remaining_sats(),
        };
        for milestone in &project.milestones {
            match milestone.status {
                MilestoneStatus::Created => stats.created += 1,
                MilestoneStatus::Assigned => stats.assigned += 1,
                MilestoneStatus::Accepted => stats.accepted += 1,
                MilestoneStatus::InProgress => stats.in_progress += 1,
                MilestoneStatus::Submitted => stats.submitted += 1,
                MilestoneStatus::Approved => stats.approved += 1,
                MilestoneStatus::Paid => stats.paid += 1,
            }
        }
        Ok(stats)
    }

    /// An identity's roles and workable milestone indices within a project
    pub async fn role_info(&self, addr: &str, project_id: u64) -> EscrowResult<RoleInfo> {
        let project = self.store.get_project(project_id).await?;
        let assigned_milestones = project
            .milestones
            .iter()
            .enumerate()
            .filter(|(_, m)| project.effective_assignee(m) == Some(addr))
            .map(|(i, _)| i)
            .collect();
        Ok(RoleInfo {
            address: addr.to_string(),
            roles: project.roles_of(addr),
            assigned_milestones,
        })
    }

    /// Audit trail for a project. Ordering across commands that raced each
    /// other is best-effort; see the field note on `events`.
    pub async fn project_events(&self, project_id: u64) -> Vec<EscrowEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.project_id == project_id)
            .cloned()
            .collect()
    }

    // ---- internals ---------------------------------------------------

    /// Settle one milestone: flip the status and accounting totals, then
    /// issue the transfers. Runs under the caller's store guard; a transfer
    /// failure rolls every mutation back before returning.
    async fn pay_milestone(
        &self,
        project: &mut Project,
        index: usize,
        resolution: Resolution,
        auto: bool,
        now: DateTime<Utc>,
    ) -> EscrowResult<PayoutReceipt> {
        let project_id = project.id;
        let client = project.client.clone();
        let manager = project.manager.clone();
        let fee_bps = project.pm_fee_bps;
        let worker = project.worker.clone();

        let milestone = project.milestone(index)?;
        let amount = milestone.amount_sats;
        let prior_status = milestone.status;

        let (assignee_amount, fee, payments) = match resolution {
            Resolution::PaidOut => {
                let assignee = milestone
                    .assignee
                    .clone()
                    .or(worker)
                    .ok_or_else(|| EscrowError::internal("payout without a bound assignee"))?;
                let fee = manager_fee_sats(amount, fee_bps);
                let mut payments = vec![Payment {
                    to: assignee,
                    amount_sats: amount - fee,
                }];
                if fee > 0 {
                    let manager = manager
                        .ok_or_else(|| EscrowError::internal("manager fee without a manager"))?;
                    payments.push(Payment {
                        to: manager,
                        amount_sats: fee,
                    });
                }
                (amount - fee, fee, payments)
            }
            Resolution::Reclaimed => (
                0,
                0,
                vec![Payment {
                    to: client,
                    amount_sats: amount,
                }],
            ),
            Resolution::Refunded => {
                return Err(EscrowError::internal(
                    "refunds are settled at project level",
                ));
            }
        };

        // State commit precedes the external transfer
        {
            let milestone = project.milestone_mut(index)?;
            milestone.status = MilestoneStatus::Paid;
            milestone.resolution = Some(resolution);
            milestone.auto_released = auto;
        }
        project.total_paid_sats += amount;
        project.total_manager_fees_sats += fee;
        project.updated_at = now;

        if let Err(err) = self.transfers.disburse(&payments).await {
            warn!("Disbursement failed for milestone {index} of project {project_id}, rolling back: {err}");
            let milestone = project.milestone_mut(index)?;
            milestone.status = prior_status;
            milestone.resolution = None;
            milestone.auto_released = false;
            project.total_paid_sats -= amount;
            project.total_manager_fees_sats -= fee;
            return Err(err);
        }

        Ok(PayoutReceipt {
            project_id,
            milestone_index: index,
            amount_sats: amount,
            assignee_amount_sats: assignee_amount,
            manager_fee_sats: fee,
            resolution,
            auto_released: auto,
        })
    }

    /// Validate a project creation request before touching the store
    fn validate_create(&self, request: &CreateProjectRequest) -> EscrowResult<()> {
        if request.client.trim().is_empty() {
            return Err(EscrowError::validation("client identity cannot be empty"));
        }
        if request.milestones.is_empty() {
            return Err(EscrowError::validation(
                "a project needs at least one milestone",
            ));
        }
        if request.milestones.len() > self.config.max_milestones {
            return Err(EscrowError::validation(format!(
                "too many milestones: {} exceeds maximum {}",
                request.milestones.len(),
                self.config.max_milestones
            )));
        }

        if let Some(manager) = &request.manager {
            if manager.trim().is_empty() {
                return Err(EscrowError::validation("manager identity cannot be empty"));
            }
            if manager == &request.client {
                return Err(EscrowError::validation(
                    "client cannot act as project manager",
                ));
            }
        }
        if request.pm_fee_bps > self.config.max_fee_bps {
            return Err(EscrowError::validation(format!(
                "manager fee {} bps exceeds cap {}",
                request.pm_fee_bps, self.config.max_fee_bps
            )));
        }
        if request.pm_fee_bps > 0 && request.manager.is_none() {
            return Err(EscrowError::validation(
                "manager fee set without a project manager",
            ));
        }

        if let Some(worker) = &request.worker {
            if worker.trim().is_empty() {
                return Err(EscrowError::validation("worker identity cannot be empty"));
            }
            if worker == &request.client || Some(worker) == request.manager.as_ref() {
                return Err(EscrowError::validation(
                    "client and manager cannot act as the worker",
                ));
            }
            if request.milestones.iter().any(|m| m.assignee.is_some()) {
                return Err(EscrowError::validation(
                    "fixed-worker projects cannot carry per-milestone assignees",
                ));
            }
        }

        for (index, spec) in request.milestones.iter().enumerate() {
            if spec.description.trim().is_empty() {
                return Err(EscrowError::validation(format!(
                    "milestone {index} description cannot be empty"
                )));
            }
            if spec.description.chars().count() > self.config.max_description_len {
                return Err(EscrowError::validation(format!(
                    "milestone {index} description exceeds {} characters",
                    self.config.max_description_len
                )));
            }
            if spec.amount_sats < self.config.min_milestone_amount_sats {
                return Err(EscrowError::validation(format!(
                    "milestone {index} amount {} is below the minimum {}",
                    spec.amount_sats, self.config.min_milestone_amount_sats
                )));
            }
            if spec.amount_sats > self.config.max_milestone_amount_sats {
                return Err(EscrowError::validation(format!(
                    "milestone {index} amount {} exceeds the maximum {}",
                    spec.amount_sats, self.config.max_milestone_amount_sats
                )));
            }
            if let Some(assignee) = &spec.assignee {
                if assignee.trim().is_empty() {
                    return Err(EscrowError::validation(format!(
                        "milestone {index} assignee cannot be empty"
                    )));
                }
                if assignee == &request.client || Some(assignee) == request.manager.as_ref() {
                    return Err(EscrowError::validation(
                        "client and manager cannot be assigned to a milestone",
                    ));
                }
            }
        }

        let mut total: i64 = 0;
        for spec in &request.milestones {
            total = total.checked_add(spec.amount_sats).ok_or_else(|| {
                EscrowError::validation("milestone amounts overflow the project total")
            })?;
        }
        if request.deposit_sats != total {
            return Err(EscrowError::validation(format!(
                "deposit {} sats does not match milestone total {}",
                request.deposit_sats, total
            )));
        }

        Ok(())
    }

    /// Append an audit event
    async fn record_event(
        &self,
        kind: &str,
        project_id: u64,
        milestone_index: Option<usize>,
        actor: Option<&str>,
        amount_sats: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) {
        let event = EscrowEvent {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            project_id,
            milestone_index,
            actor: actor.map(str::to_string),
            amount_sats,
            metadata,
            created_at: self.clock.now(),
        };
        self.events.write().await.push(event);
    }
}

fn ensure_active(project: &Project) -> EscrowResult<()> {
    if project.active {
        Ok(())
    } else {
        Err(EscrowError::ProjectInactive(project.id))
    }
}

fn transition_err(from: MilestoneStatus, to: MilestoneStatus, reason: &str) -> EscrowError {
    EscrowError::invalid_transition(format!("{from:?}"), format!("{to:?}"), reason.to_string())
}

fn clear_assignment(milestone: &mut Milestone) {
    milestone.assignee = None;
    milestone.assigned_at = None;
    milestone.status = MilestoneStatus::Created;
}
