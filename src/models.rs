//! Core data models for the escrow ledger
//!
//! This module contains the project and milestone records, the milestone
//! state machine, payout receipts, and the audit-event type. Business rules
//! live in the engine; the types here only expose transition predicates and
//! derived views.

use crate::EscrowResult;
use crate::error::EscrowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milestone state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MilestoneStatus {
    /// Created and funded, no worker bound yet
    Created,
    /// Worker proposed, awaiting acceptance
    Assigned,
    /// Worker accepted the assignment
    Accepted,
    /// Work underway
    InProgress,
    /// Deliverables submitted, awaiting client review
    Submitted,
    /// Marked ready for release without an immediate transfer (legacy
    /// fixed-worker completion path)
    Approved,
    /// Terminal: funds left escrow (payout, reclaim, or refund)
    Paid,
}

impl MilestoneStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid)
    }

    /// Check if this state allows assigning a worker
    pub fn can_assign(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check if this state allows accept/decline/unassign/expiry
    pub fn can_resolve_assignment(&self) -> bool {
        matches!(self, Self::Assigned)
    }

    /// Check if this state allows starting work
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Check if this state allows submitting deliverables.
    ///
    /// Fixed-worker projects skip the assignment phase, so their worker may
    /// submit straight from `Created`.
    pub fn can_submit(&self, fixed_worker: bool) -> bool {
        if fixed_worker {
            matches!(self, Self::Created | Self::InProgress)
        } else {
            matches!(self, Self::Accepted | Self::InProgress)
        }
    }

    /// Check if this state allows client approval or rejection
    pub fn can_review(&self) -> bool {
        matches!(self, Self::Submitted)
    }

    /// Check if this state allows the legacy client mark-complete
    pub fn can_complete(&self) -> bool {
        matches!(self, Self::Created | Self::InProgress | Self::Submitted)
    }

    /// Check if this state allows emergency reclaim by the client.
    ///
    /// Work in review or already approved must be resolved through the
    /// ordinary approve/reject/release path.
    pub fn can_reclaim(&self) -> bool {
        !matches!(self, Self::Submitted | Self::Approved | Self::Paid)
    }
}

/// How a milestone reached the terminal `Paid` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Real payout to the worker (and manager fee, when due)
    PaidOut,
    /// Full amount returned to the client via emergency reclaim
    Reclaimed,
    /// Full amount returned to the client via project cancellation
    Refunded,
}

/// Roles derived from identity comparison against project fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Manager,
    Assignee,
}

/// A single unit of escrowed work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub description: String,
    pub amount_sats: i64,

    /// Bound worker (per-milestone assignment flow). Fixed-worker projects
    /// leave this unset and resolve the worker at the project level.
    pub assignee: Option<String>,

    pub status: MilestoneStatus,
    pub resolution: Option<Resolution>,
    pub submission_note: Option<String>,
    pub auto_released: bool,

    // Timestamps: set on the transition in, cleared when backing out
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Milestone {
    /// Create a new milestone. One given an initial assignee starts out
    /// `Assigned` rather than `Created`.
    pub fn new(
        description: String,
        amount_sats: i64,
        assignee: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (status, assigned_at) = match assignee {
            Some(_) => (MilestoneStatus::Assigned, Some(now)),
            None => (MilestoneStatus::Created, None),
        };

        Self {
            description,
            amount_sats,
            assignee,
            status,
            resolution: None,
            submission_note: None,
            auto_released: false,
            created_at: now,
            assigned_at,
            accepted_at: None,
            submitted_at: None,
        }
    }
}

/// Project record owning its milestones outright
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,

    // Parties
    pub client: String,
    pub manager: Option<String>,
    /// Manager commission per milestone payout, in basis points (0-2000)
    pub pm_fee_bps: u32,
    /// Fixed worker bound at creation. When set, the project uses the
    /// direct flow: no per-milestone assignment, submit without start, and
    /// the legacy `complete` path.
    pub worker: Option<String>,

    // Accounting
    pub total_sats: i64,
    pub total_paid_sats: i64,
    pub total_manager_fees_sats: i64,

    pub active: bool,
    pub milestones: Vec<Milestone>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project. The id is assigned by the ledger store.
    pub fn new(
        client: String,
        manager: Option<String>,
        pm_fee_bps: u32,
        worker: Option<String>,
        milestones: Vec<Milestone>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_sats = milestones.iter().map(|m| m.amount_sats).sum();

        Self {
            id: 0,
            client,
            manager,
            pm_fee_bps,
            worker,
            total_sats,
            total_paid_sats: 0,
            total_manager_fees_sats: 0,
            active: true,
            milestones,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fixed-worker (direct) project, as opposed to per-milestone assignment
    pub fn is_direct(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_client(&self, addr: &str) -> bool {
        self.client == addr
    }

    pub fn is_manager(&self, addr: &str) -> bool {
        self.manager.as_deref() == Some(addr)
    }

    /// Client or manager: the parties allowed to steer assignment
    pub fn is_supervisor(&self, addr: &str) -> bool {
        self.is_client(addr) || self.is_manager(addr)
    }

    /// The identity allowed to work a given milestone right now
    pub fn effective_assignee<'a>(&'a self, milestone: &'a Milestone) -> Option<&'a str> {
        milestone.assignee.as_deref().or(self.worker.as_deref())
    }

    /// All roles an identity holds within this project
    pub fn roles_of(&self, addr: &str) -> Vec<Role> {
        let mut roles = Vec::new();
        if self.is_client(addr) {
            roles.push(Role::Client);
        }
        if self.is_manager(addr) {
            roles.push(Role::Manager);
        }
        let assigned = self.worker.as_deref() == Some(addr)
            || self
                .milestones
                .iter()
                .any(|m| m.assignee.as_deref() == Some(addr));
        if assigned {
            roles.push(Role::Assignee);
        }
        roles
    }

    /// Escrowed value that has not yet left the project
    pub fn remaining_sats(&self) -> i64 {
        self.total_sats - self.total_paid_sats
    }

    /// Read access to a milestone by index
    pub fn milestone(&self, index: usize) -> EscrowResult<&Milestone> {
        self.milestones.get(index).ok_or_else(|| {
            EscrowError::not_found(format!("milestone {} in project {}", index, self.id))
        })
    }

    /// Mutable access to a milestone by index
    pub fn milestone_mut(&mut self, index: usize) -> EscrowResult<&mut Milestone> {
        let id = self.id;
        self.milestones
            .get_mut(index)
            .ok_or_else(|| EscrowError::not_found(format!("milestone {index} in project {id}")))
    }
}

/// Manager commission for a milestone amount, floored integer arithmetic.
/// 10_000 basis points = 100%. Widened internally so no sat amount can
/// overflow the multiply.
pub fn manager_fee_sats(amount_sats: i64, fee_bps: u32) -> i64 {
    (i128::from(amount_sats) * i128::from(fee_bps) / 10_000) as i64
}

/// Milestone description + amount as supplied at project creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub description: String,
    pub amount_sats: i64,
    /// Initial assignee; the milestone starts `Assigned` when set
    pub assignee: Option<String>,
}

/// Outcome of a payout-triggering operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub project_id: u64,
    pub milestone_index: usize,
    pub amount_sats: i64,
    pub assignee_amount_sats: i64,
    pub manager_fee_sats: i64,
    pub resolution: Resolution,
    /// True when the payout was triggered by the submission timeout rather
    /// than explicit client action
    pub auto_released: bool,
}

/// Outcome of a project cancellation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub project_id: u64,
    pub refunded_sats: i64,
    pub refunded_milestones: Vec<usize>,
}

/// Aggregate per-project statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: u64,
    pub total_milestones: usize,
    pub created: usize,
    pub assigned: usize,
    pub accepted: usize,
    pub in_progress: usize,
    pub submitted: usize,
    pub approved: usize,
    pub paid: usize,
    pub total_sats: i64,
    pub total_paid_sats: i64,
    pub total_manager_fees_sats: i64,
    pub remaining_sats: i64,
}

/// An identity's standing within a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInfo {
    pub address: String,
    pub roles: Vec<Role>,
    /// Indices of milestones this identity may currently work
    pub assigned_milestones: Vec<usize>,
}

/// Escrow event for the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub id: Uuid,
    pub kind: String,
    pub project_id: u64,
    pub milestone_index: Option<usize>,
    pub actor: Option<String>,
    pub amount_sats: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_arithmetic_floors() {
        assert_eq!(manager_fee_sats(100_000_000, 500), 5_000_000);
        assert_eq!(manager_fee_sats(333, 100), 3); // 3.33 floors to 3
        assert_eq!(manager_fee_sats(1_000, 0), 0);
        assert_eq!(manager_fee_sats(999, 2_000), 199); // 19.98% of 999
    }

    #[test]
    fn fee_arithmetic_never_overflows() {
        assert_eq!(manager_fee_sats(i64::MAX, 2_000), i64::MAX / 5);
        assert_eq!(manager_fee_sats(i64::MAX, 10_000), i64::MAX);
        assert_eq!(manager_fee_sats(i64::MAX, 0), 0);
    }

    #[test]
    fn assignee_share_never_negative_under_fee_cap() {
        for amount in [1_000, 999_999, 100_000_000] {
            let fee = manager_fee_sats(amount, 2_000);
            assert!(amount - fee > 0);
        }
    }

    #[test]
    fn initial_assignee_starts_assigned() {
        let now = Utc::now();
        let open = Milestone::new("design".into(), 50_000, None, now);
        assert_eq!(open.status, MilestoneStatus::Created);
        assert!(open.assigned_at.is_none());

        let bound = Milestone::new("build".into(), 50_000, Some("worker".into()), now);
        assert_eq!(bound.status, MilestoneStatus::Assigned);
        assert_eq!(bound.assigned_at, Some(now));
    }

    #[test]
    fn submit_predicate_depends_on_variant() {
        assert!(MilestoneStatus::Created.can_submit(true));
        assert!(!MilestoneStatus::Created.can_submit(false));
        assert!(MilestoneStatus::Accepted.can_submit(false));
        assert!(!MilestoneStatus::Accepted.can_submit(true));
        assert!(MilestoneStatus::InProgress.can_submit(true));
        assert!(MilestoneStatus::InProgress.can_submit(false));
        assert!(!MilestoneStatus::Paid.can_submit(true));
    }

    #[test]
    fn reclaim_blocked_for_in_flight_work() {
        assert!(MilestoneStatus::Created.can_reclaim());
        assert!(MilestoneStatus::Assigned.can_reclaim());
        assert!(MilestoneStatus::InProgress.can_reclaim());
        assert!(!MilestoneStatus::Submitted.can_reclaim());
        assert!(!MilestoneStatus::Approved.can_reclaim());
        assert!(!MilestoneStatus::Paid.can_reclaim());
    }

    #[test]
    fn effective_assignee_falls_back_to_fixed_worker() {
        let now = Utc::now();
        let milestones = vec![Milestone::new("m".into(), 10_000, None, now)];
        let direct = Project::new(
            "client".into(),
            None,
            0,
            Some("worker".into()),
            milestones.clone(),
            now,
        );
        assert_eq!(direct.effective_assignee(&direct.milestones[0]), Some("worker"));
        assert!(direct.is_direct());

        let managed = Project::new("client".into(), None, 0, None, milestones, now);
        assert_eq!(managed.effective_assignee(&managed.milestones[0]), None);
    }

    #[test]
    fn roles_are_derived_from_identity() {
        let now = Utc::now();
        let milestones = vec![Milestone::new(
            "m".into(),
            10_000,
            Some("wanda".into()),
            now,
        )];
        let project = Project::new(
            "carol".into(),
            Some("mark".into()),
            250,
            None,
            milestones,
            now,
        );

        assert_eq!(project.roles_of("carol"), vec![Role::Client]);
        assert_eq!(project.roles_of("mark"), vec![Role::Manager]);
        assert_eq!(project.roles_of("wanda"), vec![Role::Assignee]);
        assert!(project.roles_of("stranger").is_empty());
    }
}
