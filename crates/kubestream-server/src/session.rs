//! Session supervision
//!
//! A session moves through `Starting -> Active -> Closing -> Closed`. Filters
//! are compiled in [`SessionSupervisor::prepare`], before the HTTP upgrade, so
//! a bad pattern is rejected without ever touching the cluster. Everything
//! after that happens in [`PreparedSession::run`]:
//!
//! 1. resolve credentials and build the tailing configuration
//! 2. start the engine, the three bridge duties and the credential refresh
//!    under one cancellation scope
//! 3. on the first terminating signal, cancel the scope and join every duty
//! 4. send at most one error frame and one close, then report the outcome

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::{FutureExt, Sink, Stream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};
use tracing::{Instrument, debug, info, warn};

use kubestream_k8s::{Connector, CredentialProvider};
use kubestream_logs::{CompiledFilters, EngineError, TailConfig, TailEngine};
use kubestream_types::{ErrorFrame, SessionParams, SessionState};

use crate::bridge::Bridge;
use crate::config::SessionTimings;
use crate::error::{SessionError, TransportError};
use crate::transport::WireMessage;

/// Records buffered between the engine and the relay duty
const RECORD_BUFFER: usize = 256;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// How a session ended
#[derive(Debug)]
pub enum Termination {
    /// Snapshot mode: every record was relayed
    Completed,
    /// The client closed the connection
    ClientClosed,
    /// The server is shutting down
    Shutdown,
    Failed(SessionError),
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientClosed => "client closed",
            Self::Shutdown => "shutdown",
            Self::Failed(_) => "failed",
        }
    }
}

/// Starts sessions. Shared by every connection the server accepts.
pub struct SessionSupervisor<E, K> {
    engine: Arc<E>,
    connector: Arc<K>,
    timings: SessionTimings,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl<E, K> SessionSupervisor<E, K>
where
    E: TailEngine,
    K: Connector<Client = E::Client>,
{
    pub fn new(engine: E, connector: K, timings: SessionTimings) -> Self {
        Self {
            engine: Arc::new(engine),
            connector: Arc::new(connector),
            timings,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Sessions are cancelled when `shutdown` is
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Validate a request. Nothing is started if this fails.
    pub fn prepare(&self, params: SessionParams) -> Result<PreparedSession<E, K>, SessionError> {
        let filters = CompiledFilters::compile(&params)?;
        let (state, _) = watch::channel(SessionState::Starting);

        Ok(PreparedSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            params,
            filters,
            engine: Arc::clone(&self.engine),
            connector: Arc::clone(&self.connector),
            timings: self.timings,
            shutdown: self.shutdown.child_token(),
            state,
            tracked: self.sessions.token(),
        })
    }

    /// Wait until every session prepared so far has been run (or dropped).
    /// Used on shutdown so each open session gets to send its close frame.
    pub async fn wait_closed(&self) {
        self.sessions.close();
        self.sessions.wait().await;
    }

    /// Sessions prepared and not yet finished
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// A validated session waiting for its connection
pub struct PreparedSession<E, K> {
    id: u64,
    params: SessionParams,
    filters: CompiledFilters,
    engine: Arc<E>,
    connector: Arc<K>,
    timings: SessionTimings,
    shutdown: CancellationToken,
    state: watch::Sender<SessionState>,
    tracked: TaskTrackerToken,
}

/// Exit of one duty running inside the session scope
enum Duty {
    Engine(Result<(), EngineError>),
    Relay(Result<(), TransportError>),
    Liveness(Result<(), TransportError>),
    Drain(Result<(), TransportError>),
    Refresh,
}

impl<E, K> PreparedSession<E, K>
where
    E: TailEngine,
    K: Connector<Client = E::Client>,
{
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Watch the session's lifecycle
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the session on an established connection until it ends
    pub async fn run<S, R>(self, sink: S, inbound: R) -> Termination
    where
        S: Sink<WireMessage, Error = TransportError> + Send + Unpin + 'static,
        R: Stream<Item = Result<WireMessage, TransportError>> + Send + Unpin + 'static,
    {
        let span = tracing::info_span!("session", id = self.id);
        self.supervise(sink, inbound).instrument(span).await
    }

    async fn supervise<S, R>(self, sink: S, inbound: R) -> Termination
    where
        S: Sink<WireMessage, Error = TransportError> + Send + Unpin + 'static,
        R: Stream<Item = Result<WireMessage, TransportError>> + Send + Unpin + 'static,
    {
        let Self {
            params,
            filters,
            engine,
            connector,
            timings,
            shutdown,
            state,
            tracked: _tracked,
            ..
        } = self;

        let started = Instant::now();
        let bridge = Bridge::new(sink, timings);
        info!(query = %params.query, context = ?params.context_name(), "session opened");

        let resolved = CredentialProvider::resolve(connector.as_ref(), params.context_name()).await;
        let (credentials, default_namespace) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                let termination = Termination::Failed(SessionError::AuthenticationFailure(e));
                return finish(&bridge, &state, termination, started).await;
            }
        };
        let credentials = Arc::new(credentials);
        let config = Arc::new(TailConfig::build(&params, filters, default_namespace.as_deref()));
        debug!(
            namespaces = ?config.namespaces,
            follow = config.follow,
            since = ?config.since,
            tail = ?config.tail_lines,
            "tailing configuration built"
        );

        let cancel = shutdown.child_token();
        let (records_tx, records_rx) = mpsc::channel(RECORD_BUFFER);
        let mut duties = JoinSet::new();

        duties.spawn(
            {
                let engine = Arc::clone(&engine);
                let config = Arc::clone(&config);
                let credentials = Arc::clone(&credentials);
                let cancel = cancel.clone();
                async move { engine.run(config, credentials, records_tx, cancel).await }
            }
            .map(Duty::Engine)
            .in_current_span(),
        );
        duties.spawn(bridge.relay(records_rx, cancel.clone()).map(Duty::Relay).in_current_span());
        duties.spawn(bridge.liveness(cancel.clone()).map(Duty::Liveness).in_current_span());
        duties.spawn(bridge.drain(inbound, cancel.clone()).map(Duty::Drain).in_current_span());
        duties.spawn(
            Arc::clone(&credentials)
                .run_refresh(Arc::clone(&connector), timings.credential_refresh, cancel.clone())
                .map(|()| Duty::Refresh)
                .in_current_span(),
        );

        transition(&state, SessionState::Active);

        let mut outcome: Option<Termination> = None;
        let mut engine_result: Option<Result<(), EngineError>> = None;
        let mut relay_drained = false;

        while let Some(joined) = duties.join_next().await {
            let duty = match joined {
                Ok(duty) => duty,
                Err(e) => {
                    warn!(error = %e, "session duty aborted");
                    if outcome.is_none() {
                        let error = EngineError::Other(format!("session task failed: {}", e));
                        outcome = Some(Termination::Failed(error.into()));
                    }
                    begin_closing(&state, &cancel);
                    continue;
                }
            };

            match duty {
                Duty::Engine(result) => {
                    match &result {
                        Ok(()) => debug!("tailing engine stopped"),
                        Err(e) => debug!(error = %e, "tailing engine failed"),
                    }
                    engine_result = Some(result);
                    if !cancel.is_cancelled() {
                        // Remaining records still drain through the relay
                        transition(&state, SessionState::Closing);
                    }
                }
                Duty::Relay(Ok(())) => {
                    if !cancel.is_cancelled() {
                        relay_drained = true;
                    }
                }
                Duty::Relay(Err(e)) | Duty::Liveness(Err(e)) | Duty::Drain(Err(e)) => {
                    if outcome.is_none() {
                        debug!(error = %e, "transport ended");
                        outcome = Some(match e {
                            TransportError::Closed => Termination::ClientClosed,
                            e => Termination::Failed(e.into()),
                        });
                    }
                    begin_closing(&state, &cancel);
                }
                Duty::Liveness(Ok(())) | Duty::Drain(Ok(())) | Duty::Refresh => {}
            }

            // The engine has finished and everything it produced is on the wire
            if outcome.is_none() && relay_drained {
                if let Some(result) = engine_result.take() {
                    outcome = Some(match result {
                        Ok(()) => Termination::Completed,
                        Err(e) => Termination::Failed(e.into()),
                    });
                    begin_closing(&state, &cancel);
                }
            }
        }

        let termination = outcome.unwrap_or(if shutdown.is_cancelled() {
            Termination::Shutdown
        } else {
            Termination::Completed
        });
        finish(&bridge, &state, termination, started).await
    }
}

fn transition(state: &watch::Sender<SessionState>, next: SessionState) {
    let previous = state.send_replace(next);
    if previous != next {
        debug!(from = previous.as_str(), to = next.as_str(), "session state");
    }
}

fn begin_closing(state: &watch::Sender<SessionState>, cancel: &CancellationToken) {
    transition(state, SessionState::Closing);
    cancel.cancel();
}

/// The single exit path of a session. Runs once every duty has been joined.
async fn finish<S>(
    bridge: &Bridge<S>,
    state: &watch::Sender<SessionState>,
    termination: Termination,
    started: Instant,
) -> Termination
where
    S: Sink<WireMessage, Error = TransportError> + Send + Unpin + 'static,
{
    transition(state, SessionState::Closing);

    if let Termination::Failed(error) = &termination {
        if error.notifies_client() {
            if let Err(e) = bridge.send_error(&ErrorFrame::new(error.to_string())).await {
                debug!(error = %e, "could not deliver error frame");
            }
        }
    }

    if let Err(e) = bridge.close().await {
        debug!(error = %e, "close frame not delivered");
    }

    transition(state, SessionState::Closed);

    match &termination {
        Termination::Failed(error) => info!(
            outcome = termination.as_str(),
            error = %error,
            records = bridge.relayed(),
            elapsed = ?started.elapsed(),
            "session closed"
        ),
        _ => info!(
            outcome = termination.as_str(),
            records = bridge.relayed(),
            elapsed = ?started.elapsed(),
            "session closed"
        ),
    }

    termination
}
