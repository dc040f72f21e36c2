//! Structural ledger checks and reconciliation
//!
//! Both paths produce reports for operator review; neither is ever fatal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::{replay_user, LedgerStore};

/// Outcome of one structural check
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl IntegrityCheck {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: None,
        }
    }

    fn fail(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: Some(detail),
        }
    }
}

/// Structural check results for one user's ledger
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub user_id: Uuid,
    pub checks: Vec<IntegrityCheck>,
    pub passed: bool,
    pub checked_at: DateTime<Utc>,
}

/// Ledger-vs-cache (and optional secondary source) comparison
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub user_id: Uuid,
    pub replayed_equity: Decimal,
    pub cached_equity: Decimal,
    pub secondary_equity: Option<Decimal>,
    pub discrepancy_pct: Decimal,
    pub threshold_pct: Decimal,
    pub within_threshold: bool,
    pub checked_at: DateTime<Utc>,
}

fn discrepancy_pct(reference: Decimal, observed: Decimal) -> Decimal {
    if reference.is_zero() {
        if observed.is_zero() {
            Decimal::ZERO
        } else {
            Decimal::from(100)
        }
    } else {
        ((observed - reference) / reference * Decimal::from(100)).abs()
    }
}

impl LedgerStore {
    /// Compare cached equity (and a secondary balance, when available)
    /// against a full replay
    pub async fn reconcile(
        &self,
        user_id: Uuid,
        threshold_pct: Decimal,
        secondary_equity: Option<Decimal>,
    ) -> ReconciliationReport {
        let inner = self.inner.read().await;
        let replayed = replay_user(&inner, user_id);
        let cached_equity = inner
            .cache
            .get(&user_id)
            .map(|c| c.equity)
            .unwrap_or(replayed.equity);

        let mut discrepancy = discrepancy_pct(replayed.equity, cached_equity);
        if let Some(secondary) = secondary_equity {
            discrepancy = discrepancy.max(discrepancy_pct(replayed.equity, secondary));
        }

        let within_threshold = discrepancy <= threshold_pct;
        if !within_threshold {
            warn!(
                "Reconciliation discrepancy for user {}: {}% (threshold {}%)",
                user_id, discrepancy, threshold_pct
            );
        }

        ReconciliationReport {
            user_id,
            replayed_equity: replayed.equity,
            cached_equity,
            secondary_equity,
            discrepancy_pct: discrepancy,
            threshold_pct,
            within_threshold,
            checked_at: Utc::now(),
        }
    }

    /// Run structural checks; returns pass/fail per check, never errors
    pub async fn verify_integrity(&self, user_id: Uuid) -> IntegrityReport {
        let inner = self.inner.read().await;
        let fills: Vec<_> = inner
            .fills
            .iter()
            .filter(|f| f.rec.user_id == user_id)
            .collect();
        let mut checks = Vec::new();

        // Duplicate fill ids
        let mut seen_ids = std::collections::HashSet::new();
        let dup_id = fills.iter().find(|f| !seen_ids.insert(f.rec.id));
        checks.push(match dup_id {
            Some(f) => IntegrityCheck::fail(
                "unique_fill_ids",
                format!("duplicate fill id {}", f.rec.id),
            ),
            None => IntegrityCheck::pass("unique_fill_ids"),
        });

        // Duplicate idempotency keys
        let mut seen_keys = std::collections::HashSet::new();
        let dup_key = fills
            .iter()
            .find(|f| !seen_keys.insert(f.rec.idempotency_key.as_str()));
        checks.push(match dup_key {
            Some(f) => IntegrityCheck::fail(
                "unique_idempotency_keys",
                format!("duplicate idempotency key {}", f.rec.idempotency_key),
            ),
            None => IntegrityCheck::pass("unique_idempotency_keys"),
        });

        // Chronological ordering of appends
        let out_of_order = fills
            .windows(2)
            .find(|w| w[1].rec.timestamp < w[0].rec.timestamp);
        checks.push(match out_of_order {
            Some(w) => IntegrityCheck::fail(
                "chronological_ordering",
                format!(
                    "fill {} recorded before its predecessor's timestamp",
                    w[1].rec.id
                ),
            ),
            None => IntegrityCheck::pass("chronological_ordering"),
        });

        // Fee completeness
        let bad_fee = fills
            .iter()
            .find(|f| f.rec.fee < Decimal::ZERO || f.rec.fee_currency.is_empty());
        checks.push(match bad_fee {
            Some(f) => IntegrityCheck::fail(
                "fee_completeness",
                format!("fill {} has an incomplete fee record", f.rec.id),
            ),
            None => IntegrityCheck::pass("fee_completeness"),
        });

        // Cached equity matches a full recomputation
        let replayed = replay_user(&inner, user_id);
        checks.push(match inner.cache.get(&user_id) {
            Some(cached) if cached.equity != replayed.equity => IntegrityCheck::fail(
                "equity_recomputation",
                format!(
                    "cached equity {} != replayed equity {}",
                    cached.equity, replayed.equity
                ),
            ),
            _ => IntegrityCheck::pass("equity_recomputation"),
        });

        let passed = checks.iter().all(|c| c.passed);
        if !passed {
            warn!("Integrity check failed for user {}", user_id);
        }

        IntegrityReport {
            user_id,
            checks,
            passed,
            checked_at: Utc::now(),
        }
    }
}
