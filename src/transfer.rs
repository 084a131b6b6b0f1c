//! Value-transfer capability consumed by the engine
//!
//! The ledger substrate that actually moves value is external to this
//! crate. The engine sees it as a single all-or-nothing disbursement call:
//! either every payment in the batch lands or none do. Keeping atomicity in
//! the provider contract lets a payout carry both the worker share and the
//! manager fee without a partial-failure window.

use crate::EscrowResult;
use crate::error::EscrowError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// A single outbound payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub to: String,
    pub amount_sats: i64,
}

/// External transfer capability.
///
/// Implementations must be atomic and non-blocking from the engine's point
/// of view: a returned `Ok` means every payment committed irreversibly, a
/// returned `Err` means no value moved at all.
#[async_trait]
pub trait TransferProvider: Send + Sync {
    /// All-or-nothing disbursement of a payment batch
    async fn disburse(&self, payments: &[Payment]) -> EscrowResult<()>;
}

/// In-memory transfer provider crediting balances in a map.
///
/// Used by tests and demos; supports scripted failure of the next
/// disbursement so rollback paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryTransferProvider {
    balances: RwLock<HashMap<String, i64>>,
    fail_next: AtomicBool,
}

impl MemoryTransferProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `disburse` call fail without moving value
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Current credited balance for an address
    pub async fn balance_of(&self, addr: &str) -> i64 {
        self.balances.read().await.get(addr).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TransferProvider for MemoryTransferProvider {
    async fn disburse(&self, payments: &[Payment]) -> EscrowResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EscrowError::transfer("scripted disbursement failure"));
        }

        // Validate the whole batch before crediting anything
        for payment in payments {
            if payment.to.trim().is_empty() {
                return Err(EscrowError::transfer("payment recipient cannot be empty"));
            }
            if payment.amount_sats <= 0 {
                return Err(EscrowError::transfer(format!(
                    "payment amount must be positive, got {}",
                    payment.amount_sats
                )));
            }
        }

        let mut balances = self.balances.write().await;
        for payment in payments {
            *balances.entry(payment.to.clone()).or_insert(0) += payment.amount_sats;
            info!(
                "Transferred {} sats to {}",
                payment.amount_sats, payment.to
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disburse_credits_every_recipient() {
        let provider = MemoryTransferProvider::new();
        provider
            .disburse(&[
                Payment {
                    to: "worker".into(),
                    amount_sats: 95_000,
                },
                Payment {
                    to: "manager".into(),
                    amount_sats: 5_000,
                },
            ])
            .await
            .unwrap();

        assert_eq!(provider.balance_of("worker").await, 95_000);
        assert_eq!(provider.balance_of("manager").await, 5_000);
        assert_eq!(provider.balance_of("nobody").await, 0);
    }

    #[tokio::test]
    async fn invalid_batch_moves_nothing() {
        let provider = MemoryTransferProvider::new();
        let result = provider
            .disburse(&[
                Payment {
                    to: "worker".into(),
                    amount_sats: 1_000,
                },
                Payment {
                    to: "manager".into(),
                    amount_sats: 0,
                },
            ])
            .await;

        assert!(matches!(result, Err(EscrowError::Transfer(_))));
        assert_eq!(provider.balance_of("worker").await, 0);
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let provider = MemoryTransferProvider::new();
        provider.fail_next();

        let payment = [Payment {
            to: "worker".into(),
            amount_sats: 1_000,
        }];
        assert!(provider.disburse(&payment).await.is_err());
        assert_eq!(provider.balance_of("worker").await, 0);

        provider.disburse(&payment).await.unwrap();
        assert_eq!(provider.balance_of("worker").await, 1_000);
    }
}
