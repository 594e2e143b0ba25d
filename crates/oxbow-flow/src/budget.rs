//! Per-provider daily spend ledger and admission-time budget checks.
//!
//! The ledger rolls over at UTC midnight: rows are keyed by
//! `(provider, date)` and created lazily on first touch. Admission calls
//! [`BudgetAccountant::reserve`]; workers call
//! [`BudgetAccountant::commit`] after a handler reports actual spend.
//! `spent_usd` is monotonically non-decreasing within a day.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::task::Provider;

/// Default per-provider daily budget (`MODEL_DAILY_BUDGET_USD`).
pub const DEFAULT_DAILY_BUDGET_USD: f64 = 100.0;

/// Fraction of the daily budget by which in-flight work may over-commit.
pub const OVERCOMMIT_FRACTION: f64 = 0.10;

/// One provider-day of budget accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    /// The provider whose spend this row meters.
    pub provider: Provider,
    /// The UTC day.
    pub date: NaiveDate,
    /// The configured daily budget.
    pub budget_usd: f64,
    /// Spend committed so far. Monotonically non-decreasing.
    pub spent_usd: f64,
    /// Tokens consumed so far.
    pub tokens: u64,
    /// Requests committed so far.
    pub requests: u64,
    /// Last mutation time.
    pub last_updated: DateTime<Utc>,
}

impl BudgetLedger {
    /// Creates an untouched ledger row for a provider-day.
    #[must_use]
    pub fn new(provider: Provider, date: NaiveDate, budget_usd: f64) -> Self {
        Self {
            provider,
            date,
            budget_usd,
            spent_usd: 0.0,
            tokens: 0,
            requests: 0,
            last_updated: Utc::now(),
        }
    }

    /// Remaining budget for the day; may be negative once over-committed.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        self.budget_usd - self.spent_usd
    }
}

/// Tunables for the accountant.
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    /// Per-provider daily budget in USD.
    pub daily_budget_usd: f64,
    /// Allowed over-commit as a fraction of the daily budget.
    pub overcommit_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: DEFAULT_DAILY_BUDGET_USD,
            overcommit_fraction: OVERCOMMIT_FRACTION,
        }
    }
}

/// Meters model spend per provider and day.
pub struct BudgetAccountant {
    store: Arc<dyn Store>,
    config: BudgetConfig,
}

impl BudgetAccountant {
    /// Creates an accountant over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: BudgetConfig) -> Self {
        Self { store, config }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Returns the remaining budget for `provider` today.
    pub async fn remaining(&self, provider: Provider) -> Result<f64> {
        let ledger = self
            .store
            .fetch_or_create_ledger(provider, Self::today(), self.config.daily_budget_usd)
            .await?;
        Ok(ledger.remaining())
    }

    /// Admission-time check that `reserved_usd` fits in today's budget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BudgetExceeded`] when the remaining budget does not
    /// cover the reservation. In-flight work that already passed this gate
    /// may still push spend past the budget; the over-commit tolerance
    /// exists so that such work is not lost, and the next reservation is
    /// the enforcement point.
    pub async fn reserve(&self, provider: Provider, reserved_usd: f64) -> Result<()> {
        let remaining = self.remaining(provider).await?;
        if remaining <= reserved_usd {
            return Err(Error::BudgetExceeded {
                provider,
                remaining,
                reserved: reserved_usd,
            });
        }
        Ok(())
    }

    /// Commits actual spend after a handler reports it.
    ///
    /// Spend is recorded unconditionally: the work already happened. Spend
    /// past the over-commit tolerance is logged for operators.
    pub async fn commit(&self, provider: Provider, cost_usd: f64, tokens: u64) -> Result<BudgetLedger> {
        let ledger = self
            .store
            .commit_spend(
                provider,
                Self::today(),
                self.config.daily_budget_usd,
                cost_usd.max(0.0),
                tokens,
            )
            .await?;

        let tolerance = ledger.budget_usd * (1.0 + self.config.overcommit_fraction);
        if ledger.spent_usd > tolerance {
            tracing::warn!(
                provider = %provider,
                spent_usd = ledger.spent_usd,
                budget_usd = ledger.budget_usd,
                "daily spend exceeds budget beyond over-commit tolerance"
            );
        }

        Ok(ledger)
    }

    /// Returns today's ledgers for every provider with activity.
    pub async fn snapshot_today(&self) -> Result<Vec<BudgetLedger>> {
        self.store.list_ledgers(Self::today()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn accountant(daily: f64) -> BudgetAccountant {
        BudgetAccountant::new(
            Arc::new(MemoryStore::new()),
            BudgetConfig {
                daily_budget_usd: daily,
                ..BudgetConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn fresh_ledger_has_full_budget() {
        let accountant = accountant(1.0);
        let remaining = accountant.remaining(Provider::Anthropic).await.unwrap();
        assert!((remaining - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn commits_reduce_remaining_until_reserve_rejects() {
        let accountant = accountant(1.0);

        // Two $0.40 calls fit; the third reservation does not.
        accountant.reserve(Provider::Anthropic, 0.40).await.unwrap();
        accountant.commit(Provider::Anthropic, 0.40, 1200).await.unwrap();

        accountant.reserve(Provider::Anthropic, 0.40).await.unwrap();
        accountant.commit(Provider::Anthropic, 0.40, 1100).await.unwrap();

        let err = accountant.reserve(Provider::Anthropic, 0.40).await.unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn spend_is_monotonic_and_tracks_tokens() {
        let accountant = accountant(10.0);

        let first = accountant.commit(Provider::Openai, 0.25, 500).await.unwrap();
        let second = accountant.commit(Provider::Openai, 0.50, 700).await.unwrap();

        assert!(second.spent_usd > first.spent_usd);
        assert_eq!(second.tokens, 1200);
        assert_eq!(second.requests, 2);
    }

    #[tokio::test]
    async fn negative_costs_are_clamped() {
        let accountant = accountant(10.0);
        accountant.commit(Provider::Google, 1.0, 0).await.unwrap();
        let ledger = accountant.commit(Provider::Google, -5.0, 0).await.unwrap();
        assert!((ledger.spent_usd - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn providers_have_independent_ledgers() {
        let accountant = accountant(1.0);
        accountant.commit(Provider::Anthropic, 0.9, 100).await.unwrap();

        // Anthropic is nearly exhausted, Google untouched.
        assert!(accountant.reserve(Provider::Anthropic, 0.2).await.is_err());
        accountant.reserve(Provider::Google, 0.2).await.unwrap();
    }
}
