use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limiter::{Admission, KeyedRateLimiter, RateLimiter};
use crate::pipeline::RateLimitScope;
use crate::{Error, Result};

/// Methods reachable without a bearer credential unless configured otherwise.
pub const DEFAULT_ALLOW_LIST: [&str; 5] = [
    "callguard.v1.AccountService/Register",
    "callguard.v1.AccountService/SignIn",
    "callguard.v1.DirectoryService/ListRegions",
    "grpc.health.v1.Health/Check",
    "grpc.health.v1.Health/Watch",
];

const MIN_SECRET_LEN: usize = 32;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname or IP address to bind to.
    pub host: String,
    /// Port number to listen on.
    pub port: u16,
    /// `service.name` attached to every span.
    pub service_name: String,
    /// `deployment.environment` attached to every span.
    pub environment: String,
    /// Upper bound on any call's deadline, in seconds.
    pub call_timeout_secs: u64,
    /// Methods, as `<service>/<method>`, that skip identity resolution.
    pub allow_list: Vec<String>,
    /// Identifiers granted role `admin` when they register.
    pub admins: Vec<String>,
    /// Rate limiting configuration.
    pub rate_limit: RateLimitSettings,
    /// Session lifetime and cleanup.
    pub session: SessionSettings,
    /// Bearer credential signing.
    pub token: TokenSettings,
    /// Metrics exporter configuration.
    pub metrics: MetricsSettings,
}

impl ServerConfig {
    /// Converts host and port into a socket address.
    ///
    /// # Errors
    /// Returns [`Error::Startup`] if host and port do not form a socket address.
    pub fn addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.port)
    }

    /// Upper bound on any call's deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Rate limiting settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Bucket capacity (burst size).
    pub capacity: u32,
    /// Tokens replenished per second.
    pub refill_per_second: f64,
    /// One shared bucket or one per caller.
    pub scope: RateLimitScope,
}

impl RateLimitSettings {
    /// Creates the admission gate these settings describe.
    pub fn build_admission(&self) -> Arc<dyn Admission> {
        match self.scope {
            RateLimitScope::Global => {
                Arc::new(RateLimiter::new(self.capacity, self.refill_per_second))
            }
            RateLimitScope::PerCaller => {
                Arc::new(KeyedRateLimiter::new(self.capacity, self.refill_per_second))
            }
        }
    }
}

/// Session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Lifetime of a session from sign-in, in seconds.
    pub ttl_secs: u64,
    /// Interval between expired-session sweeps, in seconds.
    pub cleanup_interval_secs: u64,
}

impl SessionSettings {
    /// Session lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Bearer credential settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSettings {
    /// HMAC secret shared by issuer and verifier.
    pub secret: String,
    /// Lifetime of an issued credential, in seconds.
    pub ttl_secs: u64,
}

impl TokenSettings {
    /// Credential lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl std::fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSettings")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

/// Metrics exporter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Whether metrics export is enabled.
    pub enabled: bool,
    /// Hostname or IP address for metrics server.
    pub host: String,
    /// Port number for metrics server.
    pub port: u16,
}

impl MetricsSettings {
    /// Converts host and port into a socket address for metrics server.
    ///
    /// # Errors
    /// Returns [`Error::Startup`] if host and port do not form a socket address.
    pub fn addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.port)
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Startup(format!("invalid address (host: {host}, port: {port}): {e}")))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50051,
            service_name: env!("CARGO_PKG_NAME").to_string(),
            environment: "development".to_string(),
            call_timeout_secs: 30,
            allow_list: DEFAULT_ALLOW_LIST.iter().map(|m| m.to_string()).collect(),
            admins: Vec::new(),
            rate_limit: RateLimitSettings {
                capacity: 20,
                refill_per_second: 10.0,
                scope: RateLimitScope::Global,
            },
            session: SessionSettings {
                ttl_secs: 24 * 60 * 60,
                cleanup_interval_secs: 60,
            },
            token: TokenSettings {
                secret: String::new(),
                ttl_secs: 15 * 60,
            },
            metrics: MetricsSettings {
                enabled: false,
                host: "127.0.0.1".to_string(),
                port: 9090,
            },
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `.env` file, TOML file, and environment variables.
    ///
    /// Configuration priority (highest to lowest):
    /// 1. Environment variables with `SERVER_` prefix
    /// 2. TOML configuration file (if exists)
    /// 3. `.env` file (if exists)
    /// 4. Built-in defaults
    ///
    /// The TOML file path can be set via `SERVER_CONFIG_PATH`. If not set, defaults
    /// to `./config/server.toml`; a missing file is skipped.
    ///
    /// Nested keys are separated by a double underscore:
    /// ```bash
    /// SERVER_PORT=8080
    /// SERVER_CALL_TIMEOUT_SECS=10
    /// SERVER_RATE_LIMIT__CAPACITY=50
    /// SERVER_RATE_LIMIT__SCOPE=per_caller
    /// SERVER_TOKEN__SECRET=...
    /// ```
    ///
    /// # Errors
    /// Returns an error if the configuration is malformed or contains invalid values.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> figment::error::Result<Self> {
        use figment::providers::{Env, Format, Serialized, Toml};
        use figment::Figment;

        // Attempt to load .env file (silently ignore if it doesn't exist)
        let _ = dotenvy::dotenv();

        let config_path = std::env::var("SERVER_CONFIG_PATH")
            .unwrap_or_else(|_| "config/server.toml".to_string());

        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(
                Env::prefixed("SERVER_")
                    .ignore(&["CONFIG_PATH"])
                    .split("__"),
            )
            .extract()
    }

    /// Validates the configuration before the server is built.
    ///
    /// # Errors
    /// Returns an error message naming the first invalid setting.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.call_timeout_secs == 0 {
            return Err("call_timeout_secs cannot be zero".to_string());
        }

        if self.rate_limit.capacity == 0 {
            return Err("Rate limit capacity cannot be zero".to_string());
        }

        let refill = self.rate_limit.refill_per_second;
        if !(refill > 0.0 && refill.is_finite()) {
            return Err("Rate limit refill_per_second must be a positive number".to_string());
        }

        if self.session.ttl_secs == 0 {
            return Err("Session ttl_secs cannot be zero".to_string());
        }

        if self.session.cleanup_interval_secs == 0 {
            return Err("Session cleanup_interval_secs cannot be zero".to_string());
        }

        if self.token.ttl_secs == 0 {
            return Err("Token ttl_secs cannot be zero".to_string());
        }

        if self.token.secret.len() < MIN_SECRET_LEN {
            return Err(format!(
                "Token secret must be at least {MIN_SECRET_LEN} bytes"
            ));
        }

        self.addr().map_err(|e| e.to_string())?;
        if self.metrics.enabled {
            self.metrics.addr().map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}
