//! Server assembly: configuration, the gRPC services, and the bootstrap that
//! wraps them in the interceptor pipeline.

/// gRPC service implementations.
pub mod service;

/// Server configuration.
pub mod config;

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tonic_health::server::{health_reporter, HealthReporter};
use tower::layer::util::{Identity, Stack};

pub use config::{ServerConfig, DEFAULT_ALLOW_LIST};
pub use service::{
    AccountServiceImpl, DirectoryServiceImpl, ADMIN_ROLE, MEMBER_ROLE, SERVED_METHODS,
};

use crate::identity::{TokenIssuer, TokenVerifier};
use crate::limiter::Admission;
use crate::pipeline::Pipeline;
use crate::proto::account_service_server::AccountServiceServer;
use crate::proto::directory_service_server::DirectoryServiceServer;
use crate::session::SessionManager;
use crate::telemetry::SharedMetrics;
use crate::{Error, Result};

/// Builds the pipeline described by `config`.
///
/// # Errors
/// Returns [`Error::Startup`] if the pipeline cannot be assembled.
pub fn build_pipeline(
    config: &ServerConfig,
    admission: Arc<dyn Admission>,
    metrics: SharedMetrics,
) -> Result<Pipeline> {
    Pipeline::builder()
        .service_name(&config.service_name)
        .environment(&config.environment)
        .call_timeout(config.call_timeout())
        .allow_list(config.allow_list.iter().cloned())
        .known_methods(SERVED_METHODS)
        .verifier(TokenVerifier::new(config.token.secret.as_bytes()))
        .admission(admission, config.rate_limit.scope)
        .metrics(metrics)
        .build()
}

/// A bound, ready-to-serve server.
pub struct Bootstrap {
    router: Router<Stack<Pipeline, Identity>>,
    listener: TcpListener,
    local_addr: SocketAddr,
    health: HealthReporter,
}

impl Bootstrap {
    /// Binds the listener and registers every service behind the pipeline.
    ///
    /// Pass port 0 in `config` to bind an ephemeral port; [`Bootstrap::local_addr`]
    /// reports the one chosen.
    ///
    /// # Errors
    /// Returns [`Error::Startup`] if the address cannot be bound or the pipeline
    /// cannot be built.
    pub async fn bind(
        config: &ServerConfig,
        sessions: SessionManager,
        admission: Arc<dyn Admission>,
        metrics: SharedMetrics,
        directory: DirectoryServiceImpl,
    ) -> Result<Self> {
        let pipeline = build_pipeline(config, admission, metrics)?;

        let addr = config.addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Startup(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Startup(format!("failed to read bound address: {e}")))?;

        let issuer = TokenIssuer::new(config.token.secret.as_bytes(), config.token.ttl());
        let admins: HashSet<String> = config.admins.iter().cloned().collect();
        let account = AccountServiceImpl::new(sessions, issuer, admins);

        let (mut health, health_service) = health_reporter();
        health
            .set_serving::<AccountServiceServer<AccountServiceImpl>>()
            .await;
        health
            .set_serving::<DirectoryServiceServer<DirectoryServiceImpl>>()
            .await;

        let router = Server::builder()
            .layer(pipeline)
            .add_service(health_service)
            .add_service(AccountServiceServer::new(account))
            .add_service(DirectoryServiceServer::new(directory));

        tracing::info!(%local_addr, service = %config.service_name, "server bound");

        Ok(Self {
            router,
            listener,
            local_addr,
            health,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Health reporter for the registered services.
    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    /// Serves until `signal` completes, then drains in-flight calls.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the transport fails.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.router
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), signal)
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))
    }

    /// Serves until the process ends.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the transport fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }
}

/// Marks every registered service as not serving.
pub async fn set_not_serving(health: &mut HealthReporter) {
    health
        .set_not_serving::<AccountServiceServer<AccountServiceImpl>>()
        .await;
    health
        .set_not_serving::<DirectoryServiceServer<DirectoryServiceImpl>>()
        .await;
}
