//! Cluster credentials for a session
//!
//! A session resolves its credentials once, up front, and then rebuilds the
//! client on a fixed cadence so that short-lived tokens handed out by exec
//! plugins (gcloud, aws, az) are picked up before they expire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Default cadence at which an active session rebuilds its cluster client
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(String),
    #[error("failed to create Kubernetes client: {0}")]
    Client(String),
}

/// A resolved cluster client together with the namespace its context defaults to
#[derive(Clone, Debug)]
pub struct Connection<C> {
    pub client: C,
    pub default_namespace: Option<String>,
}

/// Something that can turn a context name into an authenticated client
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    async fn connect(&self, context: Option<&str>)
    -> Result<Connection<Self::Client>, CredentialError>;
}

/// Connector backed by the local kubeconfig (or the in-cluster environment)
#[derive(Clone, Debug, Default)]
pub struct KubeConnector;

impl KubeConnector {
    pub fn new() -> Self {
        Self
    }

    /// Build a config for a named context. The kubeconfig is re-read on every
    /// call so credentials rotated on disk are picked up by a refresh.
    async fn config_for_context(context_name: &str) -> Result<kube::Config, CredentialError> {
        let kubeconfig =
            Kubeconfig::read().map_err(|e| CredentialError::Kubeconfig(e.to_string()))?;

        kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| {
            CredentialError::Kubeconfig(format!("context {}: {}", context_name, e))
        })
    }
}

#[async_trait]
impl Connector for KubeConnector {
    type Client = kube::Client;

    async fn connect(
        &self,
        context: Option<&str>,
    ) -> Result<Connection<kube::Client>, CredentialError> {
        let config = match context {
            Some(name) => Self::config_for_context(name).await?,
            None => kube::Config::infer()
                .await
                .map_err(|e| CredentialError::Kubeconfig(e.to_string()))?,
        };

        let default_namespace = Some(config.default_namespace.clone());
        let client =
            kube::Client::try_from(config).map_err(|e| CredentialError::Client(e.to_string()))?;

        Ok(Connection {
            client,
            default_namespace,
        })
    }
}

/// Shared, refreshable cluster client for one session.
///
/// The engine's request path reads the client and the refresh duty replaces
/// it; both go through the same lock, and the lock is never held across an
/// await.
pub struct CredentialProvider<C> {
    client: Mutex<C>,
    context: Option<String>,
}

impl<C: Clone + Send + Sync + 'static> CredentialProvider<C> {
    pub fn new(client: C, context: Option<String>) -> Self {
        Self {
            client: Mutex::new(client),
            context,
        }
    }

    /// Resolve credentials for a context. Failure here is fatal to the session.
    pub async fn resolve<K>(
        connector: &K,
        context: Option<&str>,
    ) -> Result<(Self, Option<String>), CredentialError>
    where
        K: Connector<Client = C> + ?Sized,
    {
        let connection = connector.connect(context).await?;
        let provider = Self::new(connection.client, context.map(str::to_string));
        Ok((provider, connection.default_namespace))
    }

    /// Current client
    pub fn client(&self) -> C {
        self.client.lock().clone()
    }

    /// Context this provider was resolved for
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Rebuild the client. On failure the previous client stays in place.
    pub async fn refresh<K>(&self, connector: &K) -> Result<(), CredentialError>
    where
        K: Connector<Client = C> + ?Sized,
    {
        let connection = connector.connect(self.context()).await?;
        *self.client.lock() = connection.client;
        Ok(())
    }

    /// Refresh on a fixed cadence until cancelled, including while a refresh
    /// is in flight. Errors are logged and the next tick simply tries again.
    pub async fn run_refresh<K>(
        self: Arc<Self>,
        connector: Arc<K>,
        period: Duration,
        cancel: CancellationToken,
    ) where
        K: Connector<Client = C> + ?Sized,
    {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // A hung exec plugin must not hold the session open
                    let refreshed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        refreshed = self.refresh(connector.as_ref()) => refreshed,
                    };
                    match refreshed {
                        Ok(()) => tracing::debug!(context = ?self.context(), "refreshed cluster credentials"),
                        Err(e) => tracing::warn!(context = ?self.context(), error = %e, "credential refresh failed, keeping previous client"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hands out increasing generation numbers, failing on request
    struct CountingConnector {
        generation: AtomicU32,
        fail_after: u32,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Client = u32;

        async fn connect(&self, _context: Option<&str>) -> Result<Connection<u32>, CredentialError> {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst);
            if generation >= self.fail_after {
                return Err(CredentialError::Client("token expired".to_string()));
            }
            Ok(Connection {
                client: generation,
                default_namespace: Some("team-a".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_resolve_reports_default_namespace() {
        let connector = CountingConnector {
            generation: AtomicU32::new(0),
            fail_after: 10,
        };
        let (provider, namespace) = CredentialProvider::resolve(&connector, Some("dev"))
            .await
            .unwrap();
        assert_eq!(provider.client(), 0);
        assert_eq!(provider.context(), Some("dev"));
        assert_eq!(namespace.as_deref(), Some("team-a"));
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        let connector = CountingConnector {
            generation: AtomicU32::new(0),
            fail_after: 0,
        };
        let result = CredentialProvider::resolve(&connector, None).await;
        assert!(matches!(result, Err(CredentialError::Client(_))));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_client() {
        let connector = CountingConnector {
            generation: AtomicU32::new(0),
            fail_after: 2,
        };
        let (provider, _) = CredentialProvider::resolve(&connector, None).await.unwrap();

        provider.refresh(&connector).await.unwrap();
        assert_eq!(provider.client(), 1);

        assert!(provider.refresh(&connector).await.is_err());
        assert_eq!(provider.client(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_runs_on_fixed_cadence() {
        let connector = Arc::new(CountingConnector {
            generation: AtomicU32::new(0),
            fail_after: 100,
        });
        let (provider, _) = CredentialProvider::resolve(connector.as_ref(), None)
            .await
            .unwrap();
        let provider = Arc::new(provider);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&provider).run_refresh(
            Arc::clone(&connector),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.client(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(provider.client(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.client(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    /// Connects once, then never answers again
    struct StallingConnector {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Connector for StallingConnector {
        type Client = u32;

        async fn connect(&self, _context: Option<&str>) -> Result<Connection<u32>, CredentialError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                std::future::pending::<()>().await;
            }
            Ok(Connection {
                client: 0,
                default_namespace: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stalled_refresh() {
        let connector = Arc::new(StallingConnector {
            calls: AtomicU32::new(0),
        });
        let (provider, _) = CredentialProvider::resolve(connector.as_ref(), None)
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::new(provider).run_refresh(
            Arc::clone(&connector),
            DEFAULT_REFRESH_INTERVAL,
            cancel.clone(),
        ));

        tokio::time::sleep(DEFAULT_REFRESH_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let exited = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(exited.is_ok(), "refresh duty ignored cancellation");
    }
}
