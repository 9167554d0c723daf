//! Metered gateway dispatch pipeline: permit resolution, admission control,
//! ledger settlement, and backend invocation.

pub mod config;
pub mod http;
pub mod invoke;
pub mod ledger;
pub mod limits;
pub mod metering;
pub mod observability;
pub mod policy;
pub mod schema;
pub mod sqlite_store;
pub mod store_types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use invoke::HttpInvoker;
use observability::Observability;
use policy::PolicyEngine;

pub use config::{
    ApiEndpointConfig, ApiVersionConfig, GatewayConfig, PermitConfig, PolicyConfig, Protocol,
};
pub use http::{GatewayHttpState, router};
pub use invoke::{InvokeSuccess, Invoker, validate_payload};
pub use ledger::Ledger;
pub use limits::{DurationUnit, RateLimitConfig};
pub use metering::{FreeSessionType, MeteringEngine, PaymentConfig};
pub use observability::ObservabilitySnapshot;
pub use policy::PolicyVerdict;
pub use schema::{BodySchema, SchemaField};
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use store_types::{
    AccountRecord, DRAIN_ACCOUNT_ID, SOURCE_ACCOUNT_ID, TransactionRecord, TransferRecord,
    UsageLogEntry, UsageLogRecord, UsageWindow,
};

use crate::GatewayError;

pub const LATENCY_HEADER: &str = "x-opendata-latency";

/// Headers owned by the hop, never forwarded from the backend response.
const HOP_HEADERS: [&str; 4] = [
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
];

/// Caller-supplied call payload: one bucket per declared parameter kind plus
/// an optional body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CallPayload {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub path: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct CallerInfo {
    pub ip: Option<String>,
}

/// The backend's response passed through, augmented with policy and latency
/// headers.
#[derive(Clone, Debug)]
pub struct GatewayReply {
    pub status: u16,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
}

/// A rejected call. Headers accumulated before the rejection (rate-limit
/// state, cost) still reach the caller.
#[derive(Debug)]
pub struct GatewayRejection {
    pub error: GatewayError,
    pub headers: BTreeMap<String, String>,
}

impl From<GatewayError> for GatewayRejection {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            headers: BTreeMap::new(),
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|now| now.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub struct Gateway {
    config: GatewayConfig,
    store: SqliteStore,
    ledger: Ledger,
    policy: PolicyEngine,
    invoker: Arc<dyn Invoker>,
    observability: Observability,
    clock: Box<dyn Clock>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, store: SqliteStore) -> crate::Result<Self> {
        let ledger = Ledger::new(store.clone());
        let policy = PolicyEngine::new(store.clone(), ledger.clone());
        let invoker = Arc::new(HttpInvoker::new(Duration::from_secs(
            config.backend_timeout_secs,
        ))?);
        Ok(Self {
            config,
            store,
            ledger,
            policy,
            invoker,
            observability: Observability::default(),
            clock: Box::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// The full dispatch pipeline for one inbound call. Payload validation
    /// runs before the policy engine so a malformed request is rejected with
    /// no ledger movement; after a successful charge the backend call may
    /// still fail, in which case the charge stands and the failure is logged
    /// for reconciliation.
    pub async fn execute(
        &self,
        api_key: &str,
        version_number: u32,
        payload: CallPayload,
        caller: CallerInfo,
    ) -> std::result::Result<GatewayReply, GatewayRejection> {
        self.observability.record_request();
        let now_ms = self.clock.now_epoch_millis();

        let permit = self
            .config
            .permit_by_key(api_key)
            .ok_or_else(|| GatewayRejection::from(GatewayError::NotFound {
                what: "permit".to_string(),
            }))?;
        check_permit(permit, now_ms)?;

        let endpoint = self.config.endpoint(&permit.endpoint).ok_or_else(|| {
            GatewayRejection::from(GatewayError::NotFound {
                what: format!("api endpoint {}", permit.endpoint),
            })
        })?;
        if !endpoint.enabled {
            return Err(disabled_rejection(
                endpoint.disabled_message.as_deref(),
                &format!("api endpoint {} is disabled", endpoint.name),
            ));
        }
        let version = endpoint.version(version_number).ok_or_else(|| {
            GatewayRejection::from(GatewayError::NotFound {
                what: format!("version {version_number} of api endpoint {}", endpoint.name),
            })
        })?;
        if !version.enabled {
            return Err(disabled_rejection(
                version.disabled_message.as_deref(),
                &format!(
                    "version {version_number} of api endpoint {} is disabled",
                    endpoint.name
                ),
            ));
        }

        invoke::validate_payload(version, &payload)?;

        let policy = self.config.policy(&permit.policy).ok_or_else(|| {
            GatewayRejection::from(GatewayError::Internal {
                message: format!("policy {} is not configured", permit.policy),
            })
        })?;

        let verdict = self
            .policy
            .evaluate(permit, policy, now_ms)
            .await
            .map_err(GatewayRejection::from)?;

        if !verdict.passed {
            let error = verdict.error.unwrap_or_else(|| GatewayError::Internal {
                message: "policy rejection without error".to_string(),
            });
            match error {
                GatewayError::RateLimitExceeded { .. } => {
                    self.observability.record_rate_limited()
                }
                _ => self.observability.record_metering_blocked(),
            }
            tracing::info!(permit = %permit.id, error = %error, "call rejected by policy");
            self.write_log(
                permit,
                version,
                &caller,
                now_ms,
                0,
                false,
                0,
                None,
                serde_json::json!({ "rejected": error.to_string() }),
            )
            .await;
            return Err(GatewayRejection {
                error,
                headers: verdict.headers,
            });
        }

        self.observability.record_backend_call();
        let started = std::time::Instant::now();
        match self.invoker.send(version, &payload).await {
            Ok(success) => {
                let mut headers: BTreeMap<String, String> = success
                    .headers
                    .iter()
                    .filter(|(name, _)| !HOP_HEADERS.contains(&name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                headers.extend(verdict.headers.clone());
                headers.insert(LATENCY_HEADER.to_string(), success.latency_ms.to_string());

                self.write_log(
                    permit,
                    version,
                    &caller,
                    now_ms,
                    success.latency_ms,
                    true,
                    verdict.cost,
                    verdict.transaction_id,
                    serde_json::json!({ "status": success.status }),
                )
                .await;

                Ok(GatewayReply {
                    status: success.status,
                    body: success.data,
                    headers,
                })
            }
            Err(error) => {
                self.observability.record_backend_error();
                let latency_ms = started.elapsed().as_millis() as u64;
                if verdict.cost > 0 {
                    // Charge-then-serve: the transfer is not rolled back.
                    // Logged so reconciliation can find refund-worthy cases.
                    tracing::warn!(
                        permit = %permit.id,
                        cost = verdict.cost,
                        transaction_id = ?verdict.transaction_id,
                        error = %error,
                        "backend call failed after charge; charge stands"
                    );
                }
                self.write_log(
                    permit,
                    version,
                    &caller,
                    now_ms,
                    latency_ms,
                    false,
                    verdict.cost,
                    verdict.transaction_id,
                    serde_json::json!({ "error": error.to_string() }),
                )
                .await;
                Err(GatewayRejection {
                    error,
                    headers: verdict.headers,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_log(
        &self,
        permit: &PermitConfig,
        version: &ApiVersionConfig,
        caller: &CallerInfo,
        ts_start_ms: u64,
        latency_ms: u64,
        ok: bool,
        cost: i64,
        transaction_id: Option<i64>,
        response_summary: Value,
    ) {
        let entry = UsageLogEntry {
            permit_id: permit.id.clone(),
            ts_start_ms,
            ts_end_ms: self.clock.now_epoch_millis(),
            ok,
            latency_ms,
            caller_ip: caller.ip.clone(),
            request_summary: serde_json::json!({
                "endpoint": permit.endpoint,
                "version": version.version,
                "method": version.method,
                "url": version.url,
            }),
            response_summary,
            cost,
            transaction_id,
        };
        if let Err(err) = self.store.append_usage_log(&entry).await {
            tracing::error!(permit = %permit.id, error = %err, "failed to append usage log entry");
        }
    }
}

fn check_permit(permit: &PermitConfig, now_ms: u64) -> std::result::Result<(), GatewayRejection> {
    if permit.blocked {
        let reason = permit
            .block_reason
            .as_deref()
            .map(|reason| format!(": {reason}"))
            .unwrap_or_default();
        return Err(GatewayRejection::from(GatewayError::InvalidState {
            reason: format!("permit {} is blocked{reason}", permit.id),
        }));
    }
    if !permit.enabled {
        return Err(GatewayRejection::from(GatewayError::InvalidState {
            reason: format!("permit {} is disabled", permit.id),
        }));
    }
    if let Some(from) = permit.valid_from_ms {
        if now_ms < from {
            return Err(GatewayRejection::from(GatewayError::InvalidState {
                reason: format!("permit {} is not valid yet", permit.id),
            }));
        }
    }
    if let Some(until) = permit.valid_until_ms {
        if now_ms > until {
            return Err(GatewayRejection::from(GatewayError::InvalidState {
                reason: format!("permit {} has expired", permit.id),
            }));
        }
    }
    Ok(())
}

fn disabled_rejection(message: Option<&str>, fallback: &str) -> GatewayRejection {
    GatewayRejection::from(GatewayError::InvalidState {
        reason: message.unwrap_or(fallback).to_string(),
    })
}
