use std::collections::BTreeMap;

use serde_json::Value;

use super::{Ledger, MeteringEngine, PermitConfig, PolicyConfig, SqliteStore, limits};
use crate::{GatewayError, Result};

/// Merged result of all enforcement stages that ran for a call. Headers and
/// log fields accumulate across stages even when the verdict is a rejection,
/// so a 429 still carries its Retry-After and reset headers.
#[derive(Debug)]
pub struct PolicyVerdict {
    pub passed: bool,
    pub error: Option<GatewayError>,
    pub headers: BTreeMap<String, String>,
    pub log_fields: serde_json::Map<String, Value>,
    pub cost: i64,
    pub transaction_id: Option<i64>,
}

impl PolicyVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            error: None,
            headers: BTreeMap::new(),
            log_fields: serde_json::Map::new(),
            cost: 0,
            transaction_id: None,
        }
    }

    fn reject(mut self, error: GatewayError) -> Self {
        self.passed = false;
        self.error = Some(error);
        self
    }
}

#[derive(Clone, Debug)]
pub struct PolicyEngine {
    store: SqliteStore,
    metering: MeteringEngine,
}

impl PolicyEngine {
    pub fn new(store: SqliteStore, ledger: Ledger) -> Self {
        let metering = MeteringEngine::new(store.clone(), ledger);
        Self { store, metering }
    }

    /// Runs rate-limit admission before metering so no money moves for a
    /// call that is going to be rejected on volume. Stage merge is
    /// pass-through: each stage only sets its own header keys.
    pub async fn evaluate(
        &self,
        permit: &PermitConfig,
        policy: &PolicyConfig,
        now_ms: u64,
    ) -> Result<PolicyVerdict> {
        let mut verdict = PolicyVerdict::pass();

        if let Some(rate_limit) = &policy.rate_limit {
            let window_start = now_ms.saturating_sub(rate_limit.window_millis());
            let window = self
                .store
                .usage_window(&permit.id, window_start, now_ms)
                .await?;
            let outcome = limits::check(rate_limit, window, now_ms);
            verdict.headers.extend(outcome.headers);
            verdict
                .log_fields
                .insert("rate_limit_points".to_string(), Value::from(rate_limit.points));
            verdict
                .log_fields
                .insert("rate_limit_count".to_string(), Value::from(window.count));
            if !outcome.allowed {
                let window_secs = rate_limit.window_millis() / 1_000;
                return Ok(verdict.reject(GatewayError::RateLimitExceeded {
                    limit: format!("{} per {window_secs}s", rate_limit.points),
                }));
            }
        }

        if let Some(payment) = &policy.payment {
            match self.metering.settle(permit, payment, now_ms).await {
                Ok(outcome) => {
                    verdict.headers.extend(outcome.headers);
                    verdict.log_fields.extend(outcome.log_fields);
                    verdict.cost = outcome.cost;
                    verdict.transaction_id = outcome.transaction_id;
                }
                Err(err) => return Ok(verdict.reject(err)),
            }
        }

        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        DurationUnit, FreeSessionType, PaymentConfig, RateLimitConfig, UsageLogEntry,
    };

    async fn setup() -> (tempfile::TempDir, PolicyEngine, SqliteStore, Ledger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.expect("init");
        store
            .ensure_system_accounts()
            .await
            .expect("system accounts");
        let ledger = Ledger::new(store.clone());
        let engine = PolicyEngine::new(store.clone(), ledger.clone());
        (dir, engine, store, ledger)
    }

    fn permit() -> PermitConfig {
        PermitConfig::new("p-1", "k", "u-1", "weather", "basic")
    }

    fn policy(points: u32, payment: Option<PaymentConfig>) -> PolicyConfig {
        PolicyConfig {
            name: "basic".to_string(),
            rate_limit: Some(RateLimitConfig {
                unit: DurationUnit::Minute,
                multiplier: 1,
                points,
            }),
            payment,
        }
    }

    fn log_entry(ts_ms: u64) -> UsageLogEntry {
        UsageLogEntry {
            permit_id: "p-1".to_string(),
            ts_start_ms: ts_ms,
            ts_end_ms: ts_ms,
            ok: true,
            latency_ms: 1,
            caller_ip: None,
            request_summary: serde_json::json!({}),
            response_summary: serde_json::json!({}),
            cost: 0,
            transaction_id: None,
        }
    }

    #[tokio::test]
    async fn rate_limit_rejection_short_circuits_before_metering() {
        let (_dir, engine, store, ledger) = setup().await;
        let account = ledger.ensure_user_account("u-1").await.expect("account");
        ledger
            .deposit_into_account(&account.id, 500, "top-up")
            .await
            .expect("deposit");

        let now = 100_000;
        for offset in [1_000u64, 2_000, 3_000] {
            store
                .append_usage_log(&log_entry(now - offset))
                .await
                .expect("append");
        }

        let payment = PaymentConfig {
            free_session: FreeSessionType::None,
            free_interval_unit: None,
            free_interval_count: 1,
            free_requests: 0,
            request_cost: 100,
        };
        let verdict = engine
            .evaluate(&permit(), &policy(3, Some(payment)), now)
            .await
            .expect("evaluate");

        assert!(!verdict.passed);
        assert!(matches!(
            verdict.error,
            Some(GatewayError::RateLimitExceeded { .. })
        ));
        assert_eq!(verdict.headers["X-RateLimit-Remaining"], "0");
        assert!(verdict.headers.contains_key("Retry-After"));

        // No charge happened: the rejection came before the metering stage.
        let user = ledger.user_account("u-1").await.expect("account");
        assert_eq!(user.balance, 500);
    }

    #[tokio::test]
    async fn passing_verdict_merges_stage_headers() {
        let (_dir, engine, _store, ledger) = setup().await;
        let account = ledger.ensure_user_account("u-1").await.expect("account");
        ledger
            .deposit_into_account(&account.id, 500, "top-up")
            .await
            .expect("deposit");

        let payment = PaymentConfig {
            free_session: FreeSessionType::None,
            free_interval_unit: None,
            free_interval_count: 1,
            free_requests: 0,
            request_cost: 100,
        };
        let verdict = engine
            .evaluate(&permit(), &policy(3, Some(payment)), 100_000)
            .await
            .expect("evaluate");

        assert!(verdict.passed);
        assert_eq!(verdict.cost, 100);
        assert_eq!(verdict.headers["X-RateLimit-Remaining"], "3");
        assert_eq!(verdict.headers["x-opendata-cost"], "100");
        assert!(verdict.transaction_id.is_some());
    }

    #[tokio::test]
    async fn policy_without_stages_passes_with_no_headers() {
        let (_dir, engine, _store, _ledger) = setup().await;
        let bare = PolicyConfig {
            name: "bare".to_string(),
            rate_limit: None,
            payment: None,
        };
        let verdict = engine
            .evaluate(&permit(), &bare, 1_000)
            .await
            .expect("evaluate");
        assert!(verdict.passed);
        assert!(verdict.headers.is_empty());
    }
}
