use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beep_core::peer::PeerConnector;
use beep_core::{
    ClockConfig, ClockError, NegotiationEngine, Role, SampleClock, SessionOptions, SignalRouter,
    Sink, SinkRegistry, StartError,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::Endpoints;
use crate::consumer::ConsumerSink;
use crate::http::{HttpSignaler, signaling_router};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid clock configuration: {0}")]
    Clock(#[from] ClockError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error("signaling server failed: {0}")]
    Server(String),
}

#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub endpoints: Endpoints,
    pub clock: ClockConfig,
    pub signal_retry: Duration,
}

/// Everything one side of the demo owns while it runs.
///
/// Built once at startup; [`Session::shutdown`] stops the server and the
/// clock, then closes the peer connection.
pub struct Session {
    role: Role,
    local_addr: SocketAddr,
    engine: NegotiationEngine,
    source: Option<Arc<SinkRegistry>>,
    consumer: Option<Arc<ConsumerSink>>,
    shutdown: CancellationToken,
    clock: Option<JoinHandle<u64>>,
    server: JoinHandle<std::io::Result<()>>,
}

impl Session {
    pub async fn start(plan: SessionPlan, connector: &dyn PeerConnector) -> Result<Self, SessionError> {
        let addr = plan.endpoints.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SessionError::Bind { addr, source })?;
        Self::start_on(listener, plan, connector).await
    }

    /// Like [`Session::start`] but serves on an already bound listener.
    pub async fn start_on(
        listener: TcpListener,
        plan: SessionPlan,
        connector: &dyn PeerConnector,
    ) -> Result<Self, SessionError> {
        let local_addr = listener.local_addr().map_err(|source| SessionError::Bind {
            addr: plan.endpoints.listen,
            source,
        })?;
        let role = plan.endpoints.role;
        let shutdown = CancellationToken::new();
        let signaler = Arc::new(HttpSignaler::new(
            plan.endpoints.peer.clone(),
            plan.signal_retry,
            shutdown.clone(),
        )?);

        let mut source = None;
        let mut consumer = None;
        let mut clock = None;
        let options = match role {
            Role::Instigator => {
                let registry = Arc::new(SinkRegistry::new());
                clock = Some(SampleClock::new(plan.clock, registry.clone())?);
                source = Some(registry.clone());
                SessionOptions::instigator(signaler, registry)
            }
            Role::Responder => {
                let sink = Arc::new(ConsumerSink::new());
                consumer = Some(sink.clone());
                let sink: Arc<dyn Sink> = sink;
                SessionOptions::responder(
                    signaler,
                    Box::new(move |track: Arc<SinkRegistry>| {
                        track.add(&sink);
                    }),
                )
            }
        };

        let engine = NegotiationEngine::start(connector, options).await?;
        let app = signaling_router(plan.endpoints.path, SignalRouter::new(engine.clone()));
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
        });
        let clock = clock.map(|clock| clock.spawn(shutdown.clone()));

        info!(
            role = ?role,
            listen = %local_addr,
            path = plan.endpoints.path,
            peer = %plan.endpoints.peer,
            "session started"
        );
        Ok(Self {
            role,
            local_addr,
            engine,
            source,
            consumer,
            shutdown,
            clock,
            server,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    /// Alice's tone fan-out.
    pub fn source(&self) -> Option<&Arc<SinkRegistry>> {
        self.source.as_ref()
    }

    /// Bob's receiver.
    pub fn consumer(&self) -> Option<&Arc<ConsumerSink>> {
        self.consumer.as_ref()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until `signal` resolves or the shutdown token is cancelled
    /// elsewhere, then shuts down.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> Result<(), SessionError> {
        tokio::select! {
            _ = signal => info!("interrupt received"),
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown().await
    }

    pub async fn shutdown(self) -> Result<(), SessionError> {
        self.shutdown.cancel();
        if let Some(clock) = self.clock {
            match clock.await {
                Ok(ticks) => debug!(ticks, "sample clock joined"),
                Err(err) => warn!(error = %err, "sample clock task failed"),
            }
        }
        self.engine.close().await;
        let served = self.server.await;
        info!(role = ?self.role, "session stopped");
        match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SessionError::Server(err.to_string())),
            Err(err) => Err(SessionError::Server(err.to_string())),
        }
    }
}
