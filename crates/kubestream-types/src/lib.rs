//! Shared types for kubestream
//!
//! This crate contains data structures used across multiple kubestream crates:
//! the raw session request, the records relayed to clients, and their wire frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Session Request
// ============================================================================

/// Raw, client-supplied parameters of one log session.
///
/// Every field is kept as the string the client sent. Nothing here is trusted
/// until it has been through the filter compiler and the configuration builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionParams {
    pub namespace: String,
    pub selector: String,
    pub query: String,
    pub since: String,
    pub container: String,
    pub exclude_container: String,
    pub exclude_pod: String,
    pub container_state: String,
    pub include: String,
    pub exclude: String,
    pub highlight: String,
    pub tail: String,
    pub node: String,
    pub all_namespaces: String,
    pub init_containers: String,
    pub ephemeral_containers: String,
    pub timestamps: String,
    pub no_follow: String,
    pub context: String,
    pub max_log_requests: String,
}

impl SessionParams {
    /// Parameters with only the (mandatory) pod query set
    pub fn with_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Cluster context name, if the client picked one
    pub fn context_name(&self) -> Option<&str> {
        if self.context.is_empty() {
            None
        } else {
            Some(&self.context)
        }
    }
}

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Container state a session restricts itself to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ContainerState {
    #[default]
    Running,
    Waiting,
    Terminated,
    /// Any other value, taken verbatim
    Other(String),
}

impl ContainerState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Terminated => "terminated",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for ContainerState {
    fn from(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "waiting" => Self::Waiting,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Which kind of container a log target belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Regular,
    Init,
    Ephemeral,
}

/// Namespaces a session is allowed to look at
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Every namespace in the cluster
    All,
    /// An explicit list of namespaces
    Named(Vec<String>),
}

impl NamespaceScope {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Namespace names, or `None` for the unrestricted scope
    pub fn names(&self) -> Option<&[String]> {
        match self {
            Self::All => None,
            Self::Named(names) => Some(names),
        }
    }
}

/// How (and whether) timestamps are prepended to relayed messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    #[default]
    Off,
    /// RFC3339 with nanoseconds
    Default,
    /// `MM-DD HH:MM:SS`
    Short,
}

impl From<&str> for TimestampFormat {
    fn from(s: &str) -> Self {
        match s {
            "" => Self::Off,
            "short" => Self::Short,
            _ => Self::Default,
        }
    }
}

impl TimestampFormat {
    /// Render a timestamp in this format (`None` when timestamps are off)
    pub fn render(&self, ts: &DateTime<Utc>) -> Option<String> {
        match self {
            Self::Off => None,
            Self::Default => Some(ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
            Self::Short => Some(ts.format("%m-%d %H:%M:%S").to_string()),
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// One observed log line attributed to a container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub node_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// Borrowed JSON shape of a relayed record
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    namespace: &'a str,
    pod_name: &'a str,
    container_name: &'a str,
    node_name: &'a str,
    message: &'a str,
}

impl LogRecord {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_name: container_name.into(),
            node_name: String::new(),
            timestamp: None,
            message: message.into(),
        }
    }

    /// Serialize to the single-line, newline-terminated JSON frame sent to clients
    pub fn to_wire(&self) -> String {
        let wire = WireRecord {
            namespace: &self.namespace,
            pod_name: &self.pod_name,
            container_name: &self.container_name,
            node_name: &self.node_name,
            message: &self.message,
        };
        // Serializing a struct of strings cannot fail
        let mut line = serde_json::to_string(&wire).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// Terminal error frame, sent at most once per session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Session Lifecycle
// ============================================================================

/// Lifecycle of one streaming session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Starting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

// ============================================================================
// Inventory
// ============================================================================

/// Scope of an inventory lookup
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryQuery {
    pub context: String,
    pub namespace: String,
    pub all_namespaces: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_record_shape() {
        let mut record = LogRecord::new("default", "web-1", "nginx", "GET / \"200\"");
        record.node_name = "worker-1".to_string();

        let line = record.to_wire();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["namespace"], "default");
        assert_eq!(value["podName"], "web-1");
        assert_eq!(value["containerName"], "nginx");
        assert_eq!(value["nodeName"], "worker-1");
        assert_eq!(value["message"], "GET / \"200\"");
        assert_eq!(value.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_wire_record_escapes_newlines() {
        let record = LogRecord::new("ns", "pod", "c", "line one\nline two");
        let line = record.to_wire();
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_error_frame() {
        let frame = ErrorFrame::new("boom");
        assert_eq!(frame.to_wire(), r#"{"error":"boom"}"#);
    }

    #[test]
    fn test_container_state_from_str() {
        assert_eq!(ContainerState::from("running"), ContainerState::Running);
        assert_eq!(ContainerState::from("terminated"), ContainerState::Terminated);
        assert_eq!(
            ContainerState::from("crashloop"),
            ContainerState::Other("crashloop".to_string())
        );
    }

    #[test]
    fn test_session_params_from_query_names() {
        let params: SessionParams = serde_json::from_value(serde_json::json!({
            "query": ".",
            "allNamespaces": "true",
            "excludeContainer": "istio-proxy",
            "maxLogRequests": "10",
            "context": "minikube"
        }))
        .unwrap();
        assert_eq!(params.all_namespaces, "true");
        assert_eq!(params.exclude_container, "istio-proxy");
        assert_eq!(params.max_log_requests, "10");
        assert_eq!(params.context_name(), Some("minikube"));
        assert!(params.namespace.is_empty());
    }

    #[test]
    fn test_timestamp_formats() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(TimestampFormat::from("").render(&ts), None);
        assert_eq!(
            TimestampFormat::from("short").render(&ts).as_deref(),
            Some("01-15 10:30:00")
        );
        assert_eq!(
            TimestampFormat::from("default").render(&ts).as_deref(),
            Some("2024-01-15T10:30:00.000000000Z")
        );
    }
}
