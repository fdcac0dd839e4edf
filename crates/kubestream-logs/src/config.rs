//! Session configuration
//!
//! Maps validated parameters onto the single immutable configuration handed
//! to the tailing engine. Numeric parameters are advisory: anything that does
//! not parse falls back to its default instead of failing the session.

use std::time::Duration;

use kubestream_types::{NamespaceScope, SessionParams, TimestampFormat};

use crate::filter::CompiledFilters;

/// Lookback window used when `since` is absent or unparsable
pub const DEFAULT_SINCE: Duration = Duration::from_secs(48 * 60 * 60);

/// Concurrent log request cap used when `maxLogRequests` is absent or unparsable
pub const DEFAULT_MAX_LOG_REQUESTS: usize = 50;

/// Namespace used when neither the request nor the context names one
const FALLBACK_NAMESPACE: &str = "default";

/// Everything the tailing engine needs to know about one session
#[derive(Clone, Debug)]
pub struct TailConfig {
    pub namespaces: NamespaceScope,
    pub filters: CompiledFilters,
    /// Lines of history per container; `None` means everything
    pub tail_lines: Option<i64>,
    pub since: Duration,
    pub follow: bool,
    pub timestamps: TimestampFormat,
    pub init_containers: bool,
    pub ephemeral_containers: bool,
    pub max_log_requests: usize,
    pub context: Option<String>,
}

impl TailConfig {
    /// Build the configuration for a session.
    ///
    /// `default_namespace` is the namespace of the resolved cluster context, if any.
    pub fn build(
        params: &SessionParams,
        filters: CompiledFilters,
        default_namespace: Option<&str>,
    ) -> Self {
        Self {
            namespaces: resolve_namespaces(params, default_namespace),
            filters,
            tail_lines: parse_tail(&params.tail),
            since: parse_since(&params.since),
            follow: params.no_follow != "true",
            timestamps: TimestampFormat::from(params.timestamps.as_str()),
            init_containers: params.init_containers != "false",
            ephemeral_containers: params.ephemeral_containers != "false",
            max_log_requests: parse_max_log_requests(&params.max_log_requests),
            context: params.context_name().map(str::to_string),
        }
    }

    /// Lookback in whole seconds, as the log API wants it. A lookback too
    /// long to express is no lookback at all.
    pub fn since_seconds(&self) -> Option<i64> {
        match self.since.as_secs() {
            0 => None,
            secs => i64::try_from(secs).ok(),
        }
    }
}

/// all-namespaces flag > explicit namespace > context default > "default"
fn resolve_namespaces(params: &SessionParams, default_namespace: Option<&str>) -> NamespaceScope {
    if params.all_namespaces == "true" {
        return NamespaceScope::All;
    }
    if !params.namespace.is_empty() {
        return NamespaceScope::Named(vec![params.namespace.clone()]);
    }
    let namespace = default_namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or(FALLBACK_NAMESPACE);
    NamespaceScope::Named(vec![namespace.to_string()])
}

fn parse_tail(tail: &str) -> Option<i64> {
    tail.trim().parse::<i64>().ok().filter(|n| *n >= 0)
}

fn parse_since(since: &str) -> Duration {
    let since = since.trim();
    if since.is_empty() {
        return DEFAULT_SINCE;
    }
    humantime::parse_duration(since).unwrap_or(DEFAULT_SINCE)
}

fn parse_max_log_requests(max: &str) -> usize {
    max.trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_LOG_REQUESTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(params: SessionParams, default_namespace: Option<&str>) -> TailConfig {
        let filters = CompiledFilters::compile(&params).unwrap();
        TailConfig::build(&params, filters, default_namespace)
    }

    #[test]
    fn test_basic_session() {
        let params = SessionParams {
            namespace: "default".into(),
            tail: "100".into(),
            ..SessionParams::with_query(".")
        };
        let config = build(params, Some("kube-system"));

        assert_eq!(config.namespaces, NamespaceScope::Named(vec!["default".into()]));
        assert_eq!(config.tail_lines, Some(100));
        assert!(config.follow);
        assert_eq!(config.since, DEFAULT_SINCE);
        assert_eq!(config.since_seconds(), Some(48 * 3600));
        assert_eq!(config.max_log_requests, 50);
        assert!(config.init_containers);
        assert!(config.ephemeral_containers);
        assert_eq!(config.timestamps, TimestampFormat::Off);
        assert_eq!(config.context, None);
    }

    #[test]
    fn test_all_namespaces_wins() {
        let params = SessionParams {
            namespace: "default".into(),
            all_namespaces: "true".into(),
            ..SessionParams::with_query(".")
        };
        let config = build(params, Some("team-a"));
        assert!(config.namespaces.is_all());
        assert_eq!(config.namespaces.names(), None);
    }

    #[test]
    fn test_namespace_precedence() {
        let explicit = SessionParams {
            namespace: "prod".into(),
            all_namespaces: "false".into(),
            ..SessionParams::with_query(".")
        };
        assert_eq!(
            build(explicit, Some("team-a")).namespaces,
            NamespaceScope::Named(vec!["prod".into()])
        );

        assert_eq!(
            build(SessionParams::with_query("."), Some("team-a")).namespaces,
            NamespaceScope::Named(vec!["team-a".into()])
        );
        assert_eq!(
            build(SessionParams::with_query("."), None).namespaces,
            NamespaceScope::Named(vec!["default".into()])
        );
        assert_eq!(
            build(SessionParams::with_query("."), Some("")).namespaces,
            NamespaceScope::Named(vec!["default".into()])
        );
    }

    #[test]
    fn test_oversized_since_is_unbounded() {
        let mut config = build(SessionParams::with_query("."), None);
        config.since = Duration::from_secs(u64::MAX);
        assert_eq!(config.since_seconds(), None);

        config.since = Duration::from_secs(i64::MAX as u64);
        assert_eq!(config.since_seconds(), Some(i64::MAX));
    }

    #[test]
    fn test_malformed_numbers_fall_back() {
        for (tail, since, max) in [
            ("abc", "forever", "lots"),
            ("", "", ""),
            ("-1", "10x", "0"),
            ("1.5", "-3h", "-2"),
        ] {
            let params = SessionParams {
                tail: tail.into(),
                since: since.into(),
                max_log_requests: max.into(),
                ..SessionParams::with_query(".")
            };
            let config = build(params, None);
            assert_eq!(config.tail_lines, None, "tail={tail}");
            assert_eq!(config.since, DEFAULT_SINCE, "since={since}");
            assert_eq!(config.max_log_requests, DEFAULT_MAX_LOG_REQUESTS, "max={max}");
        }
    }

    #[test]
    fn test_numbers_parse() {
        let params = SessionParams {
            tail: "0".into(),
            since: "1h 30m".into(),
            max_log_requests: "5".into(),
            ..SessionParams::with_query(".")
        };
        let config = build(params, None);
        assert_eq!(config.tail_lines, Some(0));
        assert_eq!(config.since, Duration::from_secs(90 * 60));
        assert_eq!(config.max_log_requests, 5);
    }

    #[test]
    fn test_behaviour_flags() {
        let params = SessionParams {
            no_follow: "true".into(),
            init_containers: "false".into(),
            ephemeral_containers: "false".into(),
            timestamps: "short".into(),
            context: "kind-dev".into(),
            ..SessionParams::with_query(".")
        };
        let config = build(params, None);
        assert!(!config.follow);
        assert!(!config.init_containers);
        assert!(!config.ephemeral_containers);
        assert_eq!(config.timestamps, TimestampFormat::Short);
        assert_eq!(config.context.as_deref(), Some("kind-dev"));

        let params = SessionParams {
            no_follow: "yes".into(),
            init_containers: "no".into(),
            ..SessionParams::with_query(".")
        };
        let config = build(params, None);
        assert!(config.follow);
        assert!(config.init_containers);
    }
}
