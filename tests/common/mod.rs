//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use callguard::identity::TokenIssuer;
use callguard::server::{Bootstrap, DirectoryServiceImpl, ServerConfig};
use callguard::session::{MemoryCredentialStore, MemorySessionStore, SessionManager};
use callguard::telemetry::{CallMetrics, SharedMetrics};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::Request;

/// Signing secret used by every test server.
pub const SECRET: &str = "integration-test-secret-that-is-long-enough";

/// Identifier registered with role `admin` on test servers.
pub const ADMIN_IDENTIFIER: &str = "root";

/// Initialize test tracing (call once at the beginning of tests).
///
/// Subsequent calls are safe and will be ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new("callguard=debug");

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// Configuration for an ephemeral-port server with a generous rate limit.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.port = 0;
    config.environment = "test".to_string();
    config.token.secret = SECRET.to_string();
    config.admins = vec![ADMIN_IDENTIFIER.to_string()];
    config.rate_limit.capacity = 1_000;
    config.rate_limit.refill_per_second = 1_000.0;
    config
}

/// A running server and handles into its state.
pub struct TestServer {
    pub url: String,
    pub store: MemorySessionStore,
    pub metrics: SharedMetrics,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Starts a server for `config` on an ephemeral port.
pub async fn start_test_server(config: ServerConfig) -> TestServer {
    init_tracing();

    let store = MemorySessionStore::new();
    let sessions = SessionManager::new(
        Arc::new(store.clone()),
        Arc::new(MemoryCredentialStore::new()),
        config.session.ttl(),
    );
    let metrics: SharedMetrics = Arc::new(CallMetrics::new().unwrap());

    let bootstrap = Bootstrap::bind(
        &config,
        sessions,
        config.rate_limit.build_admission(),
        metrics.clone(),
        DirectoryServiceImpl::default(),
    )
    .await
    .expect("server should bind");

    let url = format!("http://{}", bootstrap.local_addr());
    let handle = tokio::spawn(async move {
        bootstrap.serve().await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    TestServer {
        url,
        store,
        metrics,
        handle,
    }
}

/// Signs a credential with the test secret.
pub fn token_for(subject_id: &str, role: &str) -> String {
    TokenIssuer::new(SECRET.as_bytes(), Duration::from_secs(300))
        .issue(subject_id, role)
        .unwrap()
        .token
}

/// Wraps `message` with a raw (unprefixed) bearer credential.
pub fn authorized<T>(message: T, token: &str) -> Request<T> {
    let mut request = Request::new(message);
    let value: MetadataValue<Ascii> = token.parse().unwrap();
    request.metadata_mut().insert("authorization", value);
    request
}
