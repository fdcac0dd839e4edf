//! Multi-container log tailing
//!
//! The session layer only sees the [`TailEngine`] trait. [`KubeTailer`] is the
//! shipped implementation: it lists matching pods, opens one log stream per
//! selected container and, when following, keeps rediscovering targets so new
//! pods and restarted containers are picked up.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::Api;
use kube::api::{ListParams, LogParams};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kubestream_k8s::CredentialProvider;
use kubestream_types::{ContainerKind, ContainerState, LogRecord, NamespaceScope};

use crate::config::TailConfig;
use crate::parser::LogParser;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to list pods in {namespace}: {source}")]
    List {
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to open log stream for {target}: {source}")]
    Stream {
        target: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to read log stream for {target}: {source}")]
    Read {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "reached the maximum number of log requests ({0}), use maxLogRequests to increase the limit"
    )]
    TooManyRequests(usize),
    #[error("{0}")]
    Other(String),
}

/// Produces log records for a session until cancelled.
///
/// Implementations send records in the order they are observed, return
/// `Ok(())` on cancellation or (in snapshot mode) once every target is
/// drained, and must not return while any of their producers still hold a
/// clone of `sink`.
#[async_trait]
pub trait TailEngine: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    async fn run(
        &self,
        config: Arc<TailConfig>,
        credentials: Arc<CredentialProvider<Self::Client>>,
        sink: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;
}

/// One container whose log is being (or will be) followed
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub node: String,
    pub kind: ContainerKind,
    /// Part of the identity so a restarted container is tailed again
    pub restart_count: i32,
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

impl LogTarget {
    /// All selected containers of a pod
    pub fn from_pod(pod: &Pod, config: &TailConfig) -> Vec<LogTarget> {
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            return Vec::new();
        };
        let Some(spec) = &pod.spec else {
            return Vec::new();
        };
        if !config.filters.matches_pod(pod_name) {
            return Vec::new();
        }

        let mut containers: Vec<(&str, ContainerKind)> = spec
            .containers
            .iter()
            .map(|c| (c.name.as_str(), ContainerKind::Regular))
            .collect();
        if config.init_containers {
            containers.extend(
                spec.init_containers
                    .iter()
                    .flatten()
                    .map(|c| (c.name.as_str(), ContainerKind::Init)),
            );
        }
        if config.ephemeral_containers {
            containers.extend(
                spec.ephemeral_containers
                    .iter()
                    .flatten()
                    .map(|c| (c.name.as_str(), ContainerKind::Ephemeral)),
            );
        }

        containers
            .into_iter()
            .filter(|(name, _)| config.filters.matches_container(name))
            .filter_map(|(name, kind)| {
                let status = container_status(pod, name, kind);
                if !state_matches(status, &config.filters.container_states) {
                    return None;
                }
                Some(LogTarget {
                    namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                    pod: pod_name.to_string(),
                    container: name.to_string(),
                    node: spec.node_name.clone().unwrap_or_default(),
                    kind,
                    restart_count: status.map(|s| s.restart_count).unwrap_or(0),
                })
            })
            .collect()
    }

    /// Turn a raw line from this target into a record, or drop it
    pub fn record(&self, raw: &str, config: &TailConfig) -> Option<LogRecord> {
        let (timestamp, content) = LogParser::split_timestamp(raw);
        if !config.filters.accepts_line(content) {
            return None;
        }

        Some(LogRecord {
            namespace: self.namespace.clone(),
            pod_name: self.pod.clone(),
            container_name: self.container.clone(),
            node_name: self.node.clone(),
            message: LogParser::render(timestamp.as_ref(), content, config.timestamps),
            timestamp,
        })
    }
}

fn container_status<'a>(pod: &'a Pod, name: &str, kind: ContainerKind) -> Option<&'a ContainerStatus> {
    let status = pod.status.as_ref()?;
    let statuses = match kind {
        ContainerKind::Regular => status.container_statuses.as_ref(),
        ContainerKind::Init => status.init_container_statuses.as_ref(),
        ContainerKind::Ephemeral => status.ephemeral_container_statuses.as_ref(),
    }?;
    statuses.iter().find(|s| s.name == name)
}

fn state_matches(status: Option<&ContainerStatus>, wanted: &[ContainerState]) -> bool {
    let Some(state) = status.and_then(|s| s.state.as_ref()) else {
        return false;
    };
    wanted.iter().any(|w| match w {
        ContainerState::Running => state.running.is_some(),
        ContainerState::Waiting => state.waiting.is_some(),
        ContainerState::Terminated => state.terminated.is_some(),
        ContainerState::Other(_) => false,
    })
}

/// Tailing engine backed by the Kubernetes log API
pub struct KubeTailer {
    rediscovery_interval: Duration,
}

impl KubeTailer {
    pub fn new() -> Self {
        Self {
            rediscovery_interval: Duration::from_secs(10),
        }
    }

    /// How often follow mode looks for new pods and restarted containers
    pub fn with_rediscovery_interval(mut self, interval: Duration) -> Self {
        self.rediscovery_interval = interval;
        self
    }

    async fn follow(
        &self,
        config: Arc<TailConfig>,
        credentials: Arc<CredentialProvider<kube::Client>>,
        sink: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let scope = cancel.child_token();
        let mut tasks: JoinSet<(LogTarget, Result<(), EngineError>)> = JoinSet::new();
        // Targets already tailed; forgotten once their pod disappears
        let mut seen: HashSet<LogTarget> = HashSet::new();
        let mut running: HashSet<LogTarget> = HashSet::new();

        let mut ticker = tokio::time::interval(self.rediscovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = 'tail: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'tail Ok(()),

                _ = ticker.tick() => {
                    let current: HashSet<LogTarget> = match discover(&credentials, &config).await {
                        Ok(targets) => targets.into_iter().collect(),
                        Err(e) => break 'tail Err(e),
                    };
                    seen.retain(|t| current.contains(t) || running.contains(t));

                    for target in current {
                        if seen.contains(&target) {
                            continue;
                        }
                        if running.len() >= config.max_log_requests {
                            break 'tail Err(EngineError::TooManyRequests(config.max_log_requests));
                        }

                        tracing::debug!(%target, "following container");
                        seen.insert(target.clone());
                        running.insert(target.clone());

                        let client = credentials.client();
                        let config = Arc::clone(&config);
                        let sink = sink.clone();
                        let scope = scope.clone();
                        tasks.spawn(async move {
                            let result = stream_target(client, &target, config, sink, scope).await;
                            (target, result)
                        });
                    }
                }

                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok((target, Ok(()))) => {
                            tracing::debug!(%target, "log stream ended");
                            running.remove(&target);
                        }
                        Ok((target, Err(e))) => {
                            tracing::debug!(%target, error = %e, "log stream failed, retrying on next discovery");
                            running.remove(&target);
                            seen.remove(&target);
                        }
                        Err(e) => tracing::warn!(error = %e, "log stream task panicked"),
                    }
                }
            }
        };

        scope.cancel();
        while tasks.join_next().await.is_some() {}
        result
    }

    async fn snapshot(
        &self,
        config: Arc<TailConfig>,
        credentials: Arc<CredentialProvider<kube::Client>>,
        sink: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let targets = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            targets = discover(&credentials, &config) => targets?,
        };
        tracing::debug!(count = targets.len(), "fetching logs");

        let permits = Arc::new(Semaphore::new(config.max_log_requests));
        let mut tasks = JoinSet::new();

        for target in targets {
            let permits = Arc::clone(&permits);
            let credentials = Arc::clone(&credentials);
            let config = Arc::clone(&config);
            let sink = sink.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (target, Ok(())),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (target, Ok(())),
                    },
                };
                let result =
                    stream_target(credentials.client(), &target, config, sink, cancel).await;
                (target, result)
            });
        }

        // Every fetch runs to completion; the first failure is the session's error
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Err(e))) => {
                    tracing::debug!(%target, error = %e, "failed to fetch logs");
                    first_error.get_or_insert(e);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "log fetch task panicked");
                    first_error.get_or_insert(EngineError::Other(format!(
                        "log fetch task failed: {}",
                        e
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for KubeTailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TailEngine for KubeTailer {
    type Client = kube::Client;

    async fn run(
        &self,
        config: Arc<TailConfig>,
        credentials: Arc<CredentialProvider<kube::Client>>,
        sink: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        if config.follow {
            self.follow(config, credentials, sink, cancel).await
        } else {
            self.snapshot(config, credentials, sink, cancel).await
        }
    }
}

/// List pods in scope and select their containers
async fn discover(
    credentials: &CredentialProvider<kube::Client>,
    config: &TailConfig,
) -> Result<Vec<LogTarget>, EngineError> {
    let client = credentials.client();

    let mut params = ListParams::default();
    if let Some(selector) = &config.filters.label_selector {
        params = params.labels(selector.as_str());
    }
    if let Some(fields) = &config.filters.field_selector {
        params = params.fields(fields);
    }

    let apis: Vec<(String, Api<Pod>)> = match &config.namespaces {
        NamespaceScope::All => vec![("all namespaces".to_string(), Api::all(client))],
        NamespaceScope::Named(names) => names
            .iter()
            .map(|ns| (ns.clone(), Api::namespaced(client.clone(), ns)))
            .collect(),
    };

    let mut targets = Vec::new();
    for (namespace, api) in apis {
        let pods = api
            .list(&params)
            .await
            .map_err(|source| EngineError::List { namespace, source })?;
        for pod in &pods.items {
            targets.extend(LogTarget::from_pod(pod, config));
        }
    }
    Ok(targets)
}

/// Stream one container's log into the sink until it ends or the scope is cancelled
async fn stream_target(
    client: kube::Client,
    target: &LogTarget,
    config: Arc<TailConfig>,
    sink: mpsc::Sender<LogRecord>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let api: Api<Pod> = Api::namespaced(client, &target.namespace);
    let params = LogParams {
        follow: config.follow,
        container: Some(target.container.clone()),
        tail_lines: config.tail_lines,
        since_seconds: config.since_seconds(),
        // Always requested so the record can carry it; stripped from the message unless asked for
        timestamps: true,
        ..Default::default()
    };

    let opened = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        opened = api.log_stream(&target.pod, &params) => opened,
    };
    let stream = opened.map_err(|source| EngineError::Stream {
        target: target.to_string(),
        source,
    })?;
    let mut lines = stream.lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.try_next() => line,
        };

        match line {
            Ok(Some(raw)) => {
                let Some(record) = target.record(&raw, &config) else {
                    continue;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = sink.send(record) => {
                        if sent.is_err() {
                            // Receiver gone, the session is over
                            break;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(source) => {
                return Err(EngineError::Read {
                    target: target.to_string(),
                    source,
                });
            }
        }
    }

    Ok(())
}
