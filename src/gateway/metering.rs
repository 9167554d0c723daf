use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DurationUnit, Ledger, PermitConfig, SqliteStore};
use crate::Result;

pub const COST_HEADER: &str = "x-opendata-cost";
pub const FREE_REMAINING_HEADER: &str = "x-opendata-free-remaining";
pub const FREE_UNTIL_HEADER: &str = "x-opendata-free-until";
pub const FREE_RESET_HEADER: &str = "x-opendata-free-reset";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeSessionType {
    #[default]
    None,
    OneTime,
    Interval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub free_session: FreeSessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_interval_unit: Option<DurationUnit>,
    #[serde(default = "default_interval_count")]
    pub free_interval_count: u32,
    #[serde(default)]
    pub free_requests: u32,
    pub request_cost: i64,
}

fn default_interval_count() -> u32 {
    1
}

impl PaymentConfig {
    fn free_interval_millis(&self) -> Option<u64> {
        self.free_interval_unit
            .map(|unit| unit.millis().saturating_mul(u64::from(self.free_interval_count)))
    }
}

/// Outcome of the metering stage. On a free call no money moved and
/// `transaction_id` is None; on a charged call it references the debit
/// against the consumer's account.
#[derive(Clone, Debug)]
pub struct MeterOutcome {
    pub cost: i64,
    pub transaction_id: Option<i64>,
    pub headers: BTreeMap<String, String>,
    pub log_fields: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug)]
pub struct MeteringEngine {
    store: SqliteStore,
    ledger: Ledger,
}

impl MeteringEngine {
    pub fn new(store: SqliteStore, ledger: Ledger) -> Self {
        Self { store, ledger }
    }

    /// Settles the cost of one call: free-session bookkeeping first, then a
    /// pay-per-call ledger transfer. Charge-then-serve: by the time the
    /// backend is invoked the transfer has already been applied.
    pub async fn settle(
        &self,
        permit: &PermitConfig,
        payment: &PaymentConfig,
        now_ms: u64,
    ) -> Result<MeterOutcome> {
        if payment.free_session != FreeSessionType::None {
            if let Some(outcome) = self.try_free_session(permit, payment, now_ms).await? {
                return Ok(outcome);
            }
        }

        if payment.request_cost <= 0 {
            return Ok(free_outcome(0, BTreeMap::new()));
        }

        let account = self.ledger.user_account(&permit.user_id).await?;
        let transfer = self
            .ledger
            .withdraw_from_account(
                &account.id,
                payment.request_cost,
                &format!("metered call on permit {}", permit.id),
            )
            .await?;

        let mut headers = BTreeMap::new();
        headers.insert(COST_HEADER.to_string(), payment.request_cost.to_string());
        let mut log_fields = serde_json::Map::new();
        log_fields.insert("cost".to_string(), Value::from(payment.request_cost));
        log_fields.insert("transaction_id".to_string(), Value::from(transfer.from_tx));
        log_fields.insert("transfer_id".to_string(), Value::from(transfer.id));

        Ok(MeterOutcome {
            cost: payment.request_cost,
            transaction_id: Some(transfer.from_tx),
            headers,
            log_fields,
        })
    }

    /// Free-quota check. The window count includes every usage-log row for
    /// the permit, failed calls included — failed attempts consume quota.
    async fn try_free_session(
        &self,
        permit: &PermitConfig,
        payment: &PaymentConfig,
        now_ms: u64,
    ) -> Result<Option<MeterOutcome>> {
        let interval = payment.free_interval_millis();
        let (from_ms, until_ms, window_end) = match payment.free_session {
            FreeSessionType::OneTime => {
                let start = permit.created_at_ms;
                let end = interval.map(|interval| start.saturating_add(interval));
                if let Some(end) = end {
                    if now_ms >= end {
                        return Ok(None);
                    }
                }
                (start, now_ms, end)
            }
            FreeSessionType::Interval => {
                let Some(interval) = interval else {
                    return Ok(None);
                };
                (now_ms.saturating_sub(interval), now_ms, None)
            }
            FreeSessionType::None => return Ok(None),
        };

        let window = self
            .store
            .usage_window(&permit.id, from_ms, until_ms)
            .await?;
        if window.count >= u64::from(payment.free_requests) {
            return Ok(None);
        }

        let remaining_after = payment
            .free_requests
            .saturating_sub(window.count as u32)
            .saturating_sub(1);
        let mut headers = BTreeMap::new();
        headers.insert(
            FREE_REMAINING_HEADER.to_string(),
            remaining_after.to_string(),
        );
        match payment.free_session {
            FreeSessionType::OneTime => {
                if let Some(end) = window_end {
                    headers.insert(FREE_UNTIL_HEADER.to_string(), (end / 1_000).to_string());
                }
            }
            FreeSessionType::Interval => {
                if let (Some(interval), Some(oldest)) = (interval, window.oldest_ts_ms) {
                    headers.insert(
                        FREE_RESET_HEADER.to_string(),
                        (oldest.saturating_add(interval) / 1_000).to_string(),
                    );
                }
            }
            FreeSessionType::None => {}
        }

        Ok(Some(free_outcome(remaining_after, headers)))
    }
}

fn free_outcome(remaining: u32, mut headers: BTreeMap<String, String>) -> MeterOutcome {
    headers.insert(COST_HEADER.to_string(), "0".to_string());
    let mut log_fields = serde_json::Map::new();
    log_fields.insert("cost".to_string(), Value::from(0));
    log_fields.insert("free_session".to_string(), Value::from(true));
    log_fields.insert("free_remaining".to_string(), Value::from(remaining));
    MeterOutcome {
        cost: 0,
        transaction_id: None,
        headers,
        log_fields,
    }
}
