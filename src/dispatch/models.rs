//! Dispatch data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Stable identity of a checker node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeTag(String);

impl NodeTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Tag given to the single node configured through the legacy address option
    pub fn legacy() -> Self {
        Self::new("legacy")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Address and tag of one checker node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub addr: String,
    pub tag: NodeTag,
}

impl NodeConfig {
    pub fn new(addr: impl Into<String>, tag: impl Into<NodeTag>) -> Self {
        Self {
            addr: addr.into(),
            tag: tag.into(),
        }
    }
}

/// Status reported by a checker node for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Checking,
    Success,
    Timeout,
    /// Any other terminal value, with the raw wire code
    Failed(i32),
}

impl RemoteStatus {
    /// Progress markers carry no verdict
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteStatus::Pending | RemoteStatus::Checking)
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteStatus::Pending => write!(f, "PENDING"),
            RemoteStatus::Checking => write!(f, "CHECKING"),
            RemoteStatus::Success => write!(f, "SUCCESS"),
            RemoteStatus::Timeout => write!(f, "TIMEOUT"),
            RemoteStatus::Failed(code) => write!(f, "FAILED({})", code),
        }
    }
}

/// One request written to a node's check stream
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRequest {
    pub job_id: String,
    pub item: String,
    pub timeout: Duration,
    pub index: usize,
    pub total: usize,
}

/// One response read from a node's check stream
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResponse {
    pub job_id: String,
    pub item: String,
    pub is_valid: bool,
    pub latency_ms: i64,
    pub error: String,
    pub protocol: String,
    pub server: String,
    pub country_code: String,
    pub remark: String,
    pub status: RemoteStatus,
    pub timestamp: Option<DateTime<Utc>>,
    /// Tag the node reports for itself
    pub node_tag: String,
}

impl NodeResponse {
    /// A node verdict counts as a pass only when both flags agree
    pub fn is_success(&self) -> bool {
        self.is_valid && self.status == RemoteStatus::Success
    }
}

/// Counters reported by a checker node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub success_rate: f64,
    pub uptime_seconds: i64,
}

/// Engine counters combined with one node's counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub active_requests: u64,
    pub node: NodeTag,
    pub remote: NodeStats,
}

/// Final verdict for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Success,
    Unavailable,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Success => write!(f, "success"),
            CheckStatus::Unavailable => write!(f, "unavailable"),
            CheckStatus::Error => write!(f, "error"),
        }
    }
}

/// Details a node extracts from a working proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDetails {
    pub protocol: String,
    pub server: String,
    pub country_code: String,
    pub remark: String,
}

impl ProxyDetails {
    pub(crate) fn from_response(response: &NodeResponse) -> Self {
        Self {
            protocol: response.protocol.clone(),
            server: response.server.clone(),
            country_code: response.country_code.clone(),
            remark: response.remark.clone(),
        }
    }
}

/// Result of checking one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub raw: String,
    pub status: CheckStatus,
    #[serde(with = "latency_ms")]
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ProxyDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checker_nodes: BTreeSet<NodeTag>,
}

impl CheckResult {
    pub fn success(
        raw: String,
        latency: Duration,
        details: ProxyDetails,
        checker_nodes: BTreeSet<NodeTag>,
    ) -> Self {
        Self {
            raw,
            status: CheckStatus::Success,
            latency,
            details: Some(details),
            error: None,
            checker_nodes,
        }
    }

    pub fn unavailable(raw: String, error: String, checker_nodes: BTreeSet<NodeTag>) -> Self {
        Self {
            raw,
            status: CheckStatus::Unavailable,
            latency: Duration::ZERO,
            details: None,
            error: Some(error),
            checker_nodes,
        }
    }

    pub fn error(raw: String, error: String, checker_nodes: BTreeSet<NodeTag>) -> Self {
        Self {
            raw,
            status: CheckStatus::Error,
            latency: Duration::ZERO,
            details: None,
            error: Some(error),
            checker_nodes,
        }
    }

    /// Convert a single node's terminal response, attributing it to `tag`
    pub fn from_node(raw: String, response: &NodeResponse, tag: NodeTag) -> Self {
        let nodes = BTreeSet::from([tag]);
        if response.is_success() {
            return Self::success(
                raw,
                latency_from_ms(response.latency_ms),
                ProxyDetails::from_response(response),
                nodes,
            );
        }
        match response.status {
            RemoteStatus::Timeout => Self::unavailable(raw, "Connection timeout".to_string(), nodes),
            _ => Self::error(raw, response.error.clone(), nodes),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CheckStatus::Success
    }
}

pub(crate) fn latency_from_ms(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

mod latency_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(latency.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Shorten item text for log fields
pub(crate) fn preview(item: &str) -> &str {
    match item.char_indices().nth(50) {
        Some((idx, _)) => &item[..idx],
        None => item,
    }
}

#[cfg(test)]
pub(crate) fn response(item: &str, status: RemoteStatus, is_valid: bool, latency_ms: i64) -> NodeResponse {
    NodeResponse {
        job_id: "job".to_string(),
        item: item.to_string(),
        is_valid,
        latency_ms,
        error: if is_valid { String::new() } else { "probe failed".to_string() },
        protocol: "vless".to_string(),
        server: "1.2.3.4".to_string(),
        country_code: "DE".to_string(),
        remark: "remark".to_string(),
        status,
        timestamp: None,
        node_tag: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_terminal() {
        assert!(!RemoteStatus::Pending.is_terminal());
        assert!(!RemoteStatus::Checking.is_terminal());
        assert!(RemoteStatus::Success.is_terminal());
        assert!(RemoteStatus::Timeout.is_terminal());
        assert!(RemoteStatus::Failed(5).is_terminal());
    }

    #[test]
    fn test_from_node_success() {
        let resp = response("vless://a", RemoteStatus::Success, true, 120);
        let result = CheckResult::from_node("vless://a".to_string(), &resp, NodeTag::new("n1"));
        assert!(result.is_success());
        assert_eq!(result.latency, Duration::from_millis(120));
        assert_eq!(result.details.as_ref().map(|d| d.country_code.as_str()), Some("DE"));
        assert!(result.error.is_none());
        assert!(result.checker_nodes.contains(&NodeTag::new("n1")));
    }

    #[test]
    fn test_from_node_timeout_is_unavailable() {
        let resp = response("x", RemoteStatus::Timeout, false, 0);
        let result = CheckResult::from_node("x".to_string(), &resp, NodeTag::new("n1"));
        assert_eq!(result.status, CheckStatus::Unavailable);
        assert_eq!(result.error.as_deref(), Some("Connection timeout"));
        assert!(result.details.is_none());
    }

    #[test]
    fn test_from_node_valid_flag_required() {
        let resp = response("x", RemoteStatus::Success, false, 80);
        let result = CheckResult::from_node("x".to_string(), &resp, NodeTag::new("n1"));
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.error.as_deref(), Some("probe failed"));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(80);
        assert_eq!(preview(&long).chars().count(), 50);
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_result_serializes_latency_as_ms() {
        let result = CheckResult::error("x".to_string(), "boom".to_string(), BTreeSet::new());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["latency"], 0);
        assert_eq!(json["status"], "Error");
        assert!(json.get("details").is_none());
    }
}
