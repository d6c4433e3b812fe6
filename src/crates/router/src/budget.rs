//! Token estimation and tenant budget enforcement.
//!
//! Cost projection uses a deterministic heuristic so budget decisions are
//! reproducible: prompts at or below the configured length threshold are
//! counted by whitespace tokens, longer prompts estimate `len / 4`. The meter
//! keeps one spend ledger per tenant behind a single lock, so the preflight
//! check and the reservation are one atomic step and concurrent requests
//! cannot jointly slip past a cap.

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::config::BudgetConfig;
use crate::{Result, RouterError, TenantContext};

/// Estimate the token count of a prompt.
///
/// At or below `long_text_threshold` bytes the whitespace-token count is used
/// directly; above it the estimate is `len / 4`. This exact split is relied on
/// by downstream budget tests and must not change.
pub fn estimate_tokens(text: &str, long_text_threshold: usize) -> u64 {
    if text.len() > long_text_threshold {
        (text.len() / 4) as u64
    } else {
        text.split_whitespace().count() as u64
    }
}

/// Projected cost in USD for `tokens` tokens on `model`.
pub fn estimate_cost_usd(budgets: &BudgetConfig, model: &str, tokens: u64) -> f64 {
    tokens as f64 / 1000.0 * budgets.price_per_1k(model)
}

/// A spend reservation taken at preflight and settled after dispatch.
#[derive(Debug, Clone)]
pub struct Reservation {
    tenant_key: String,
    pub amount_usd: f64,
}

#[derive(Debug)]
struct DayLedger {
    day: NaiveDate,
    spent_usd: f64,
}

/// Per-tenant spend tracking with atomic preflight reservations.
#[derive(Debug, Default)]
pub struct BudgetMeter {
    ledgers: Mutex<HashMap<String, DayLedger>>,
}

impl BudgetMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend recorded for the tenant in the current UTC day.
    pub fn spent_today(&self, tenant: &TenantContext) -> f64 {
        self.spent_on(tenant, Utc::now().date_naive())
    }

    fn spent_on(&self, tenant: &TenantContext, today: NaiveDate) -> f64 {
        let mut ledgers = self.ledgers.lock();
        let ledger = Self::ledger_for(&mut ledgers, &tenant.storage_key(), today);
        ledger.spent_usd
    }

    /// Remaining budget for the tenant in the current UTC day.
    pub fn remaining_today(&self, tenant: &TenantContext, budgets: &BudgetConfig) -> f64 {
        (budgets.daily_cap_usd - self.spent_today(tenant)).max(0.0)
    }

    /// Filter `candidates` down to those whose projected cost fits both the
    /// per-request cap for this task and the remaining daily budget, paired
    /// with each survivor's projected cost. Order is preserved so the bandit
    /// sees candidates as the caller presented them.
    pub fn affordable_candidates(
        &self,
        tenant: &TenantContext,
        budgets: &BudgetConfig,
        task_type: &str,
        candidates: &[String],
        tokens: u64,
    ) -> Vec<(String, f64)> {
        let cap = budgets.per_request_cap(task_type);
        let remaining = self.remaining_today(tenant, budgets);
        candidates
            .iter()
            .filter_map(|model| {
                let cost = estimate_cost_usd(budgets, model, tokens);
                if cost <= cap && cost <= remaining {
                    Some((model.clone(), cost))
                } else {
                    debug!(
                        model = %model,
                        projected_usd = cost,
                        cap_usd = cap,
                        remaining_usd = remaining,
                        "candidate pruned by budget"
                    );
                    None
                }
            })
            .collect()
    }

    /// Atomically check the caps and reserve `amount_usd` against the daily
    /// ledger. Denials carry the cap, projection, and current spend so the
    /// caller can explain them without re-deriving anything.
    pub fn try_reserve(
        &self,
        tenant: &TenantContext,
        budgets: &BudgetConfig,
        task_type: &str,
        amount_usd: f64,
    ) -> Result<Reservation> {
        self.try_reserve_on(tenant, budgets, task_type, amount_usd, Utc::now().date_naive())
    }

    fn try_reserve_on(
        &self,
        tenant: &TenantContext,
        budgets: &BudgetConfig,
        task_type: &str,
        amount_usd: f64,
        today: NaiveDate,
    ) -> Result<Reservation> {
        let per_request_cap = budgets.per_request_cap(task_type);
        if amount_usd > per_request_cap {
            return Err(RouterError::BudgetExceeded {
                task_type: task_type.to_string(),
                projected_usd: amount_usd,
                cap_usd: per_request_cap,
                spent_usd: self.spent_on(tenant, today),
            });
        }

        let key = tenant.storage_key();
        let mut ledgers = self.ledgers.lock();
        let ledger = Self::ledger_for(&mut ledgers, &key, today);
        if ledger.spent_usd + amount_usd > budgets.daily_cap_usd {
            return Err(RouterError::BudgetExceeded {
                task_type: task_type.to_string(),
                projected_usd: amount_usd,
                cap_usd: budgets.daily_cap_usd,
                spent_usd: ledger.spent_usd,
            });
        }
        ledger.spent_usd += amount_usd;
        Ok(Reservation {
            tenant_key: key,
            amount_usd,
        })
    }

    /// Replace the reserved estimate with the realized cost.
    pub fn settle(&self, reservation: &Reservation, actual_usd: f64) {
        let mut ledgers = self.ledgers.lock();
        if let Some(ledger) = ledgers.get_mut(&reservation.tenant_key) {
            ledger.spent_usd =
                (ledger.spent_usd - reservation.amount_usd + actual_usd.max(0.0)).max(0.0);
        }
    }

    /// Return a reservation unspent (dispatch never happened).
    pub fn release(&self, reservation: &Reservation) {
        self.settle(reservation, 0.0);
    }

    fn ledger_for<'a>(
        ledgers: &'a mut HashMap<String, DayLedger>,
        key: &str,
        today: NaiveDate,
    ) -> &'a mut DayLedger {
        let ledger = ledgers.entry(key.to_string()).or_insert(DayLedger {
            day: today,
            spent_usd: 0.0,
        });
        if ledger.day != today {
            ledger.day = today;
            ledger.spent_usd = 0.0;
        }
        ledger
    }
}
