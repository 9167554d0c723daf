use serde::{Deserialize, Serialize};

pub const SOURCE_ACCOUNT_ID: &str = "acct:source";
pub const DRAIN_ACCOUNT_ID: &str = "acct:drain";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub balance: i64,
    pub accepts_input: bool,
    pub accepts_output: bool,
    pub allow_negative: bool,
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub account_id: String,
    pub amount: i64,
    pub description: String,
    pub ts_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: i64,
    pub from_account: String,
    pub to_account: String,
    pub amount: i64,
    pub description: String,
    pub from_tx: i64,
    pub to_tx: i64,
    pub ts_ms: u64,
}

/// One row per attempted call, written by the dispatcher for every outcome.
/// Rate-limit and free-quota windows are computed over these rows, so failed
/// and rejected calls are recorded too.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub permit_id: String,
    pub ts_start_ms: u64,
    pub ts_end_ms: u64,
    pub ok: bool,
    pub latency_ms: u64,
    pub caller_ip: Option<String>,
    pub request_summary: serde_json::Value,
    pub response_summary: serde_json::Value,
    pub cost: i64,
    pub transaction_id: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: UsageLogEntry,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UsageWindow {
    pub count: u64,
    pub oldest_ts_ms: Option<u64>,
}
