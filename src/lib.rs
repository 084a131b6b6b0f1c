//! Milestone escrow ledger and payment engine
//!
//! This crate holds client funds against a project made of milestones and
//! releases payment to the worker (plus an optional project-manager
//! commission) only when a milestone reaches an approved state. It
//! implements:
//! - the per-milestone lifecycle (assign, accept, start, submit,
//!   approve/reject, payout)
//! - fee-splitting arithmetic in basis points
//! - timeout-driven auto-release and emergency reclaim
//! - project-level refund and cancellation under partial completion
//!
//! Value movement is delegated to a [`transfer::TransferProvider`]; the
//! engine commits the status flip and accounting totals before invoking it,
//! which is the mechanism that makes double payout impossible.

pub mod clock;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;
pub mod transfer;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;

/// Install a global `tracing` subscriber reading `RUST_LOG`.
///
/// Intended for binaries and integration harnesses; calling it twice
/// panics, so library users should configure their own subscriber.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}
