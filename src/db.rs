use std::fmt::{Debug, Formatter};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use log::LevelFilter;
use sqlx::any::{install_default_drivers, AnyConnectOptions, AnyPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, ConnectOptions};
use tracing::{event, Level};
use url::Url;

use crate::retry::{AttemptFailure, RetryError, RetryExecutor};

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    /// prepared statements cached per connection
    pub max_statements: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            max_statements: 180,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub database_url: Url,
    pub credentials: Option<Credentials>,
    pub pool: PoolSettings,
}

impl ConnectionSettings {
    /// The database url with credentials and the statement cache size applied.
    pub fn connection_url(&self) -> anyhow::Result<Url> {
        let mut url = self.database_url.clone();

        if let Some(credentials) = &self.credentials {
            url.set_username(&credentials.username)
                .and_then(|_| url.set_password(Some(&credentials.password)))
                .map_err(|_| anyhow!("database url '{}' cannot carry credentials", self.database_url))?;
        }

        // only the network drivers understand this parameter
        if matches!(url.scheme(), "mysql" | "mariadb" | "postgres" | "postgresql") {
            url.query_pairs_mut()
                .append_pair("statement-cache-capacity", &self.pool.max_statements.to_string());
        }

        Ok(url)
    }

    fn connect_options(&self) -> anyhow::Result<AnyConnectOptions> {
        let url = self.connection_url()?;
        let options = AnyConnectOptions::from_str(url.as_str())
            .with_context(|| format!("invalid database url '{}'", self.database_url))?
            .log_slow_statements(LevelFilter::Warn, Duration::from_secs(1));

        Ok(options)
    }
}

/// The process-wide pool of database connections.
///
/// Built once by [`ConnectionPool::initialize`] and shared by reference
/// afterwards. Connections handed out by [`ConnectionPool::acquire`] go back
/// to the pool when they are dropped.
pub struct ConnectionPool {
    pool: AnyPool,
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .finish()
    }
}

impl ConnectionPool {
    pub async fn initialize(settings: &ConnectionSettings, retry: &RetryExecutor) -> Result<Self, RetryError> {
        install_default_drivers();

        event!(
            Level::INFO,
            "Creating connection pool for '{}' (min {}, max {}, statement cache {})",
            redacted(&settings.database_url),
            settings.pool.min_size,
            settings.pool.max_size,
            settings.pool.max_statements
        );

        let pool = retry.run("Database initialization", || Self::connect(settings)).await?;

        event!(Level::INFO, "Connection pool ready");
        Ok(pool)
    }

    async fn connect(settings: &ConnectionSettings) -> Result<Self, AttemptFailure> {
        let options = settings.connect_options().map_err(AttemptFailure::Permanent)?;

        let pool = AnyPoolOptions::new()
            .min_connections(settings.pool.min_size)
            .max_connections(settings.pool.max_size)
            .acquire_timeout(settings.pool.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify_sqlx_error)?;

        // a pool that cannot hand out a connection counts as a failed attempt
        match pool.acquire().await {
            Ok(probe) => drop(probe),
            Err(e) => {
                pool.close().await;
                return Err(classify_sqlx_error(e));
            }
        }

        Ok(Self { pool })
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Any>, sqlx::Error> {
        self.pool.acquire().await
    }

    pub fn size(&self) -> u32 {
        self.pool.size()
    }

    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}

/// Connectivity problems are worth another attempt, everything the database
/// itself rejects is not.
pub fn classify_sqlx_error(error: sqlx::Error) -> AttemptFailure {
    let transient = match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_error) => db_error
            .code()
            .map(|code| is_transient_database_code(&code))
            .unwrap_or(false),
        _ => false,
    };

    if transient {
        AttemptFailure::transient(error)
    } else {
        AttemptFailure::permanent(error)
    }
}

/// lock wait timeout, deadlock, serialization failure, server gone away
fn is_transient_database_code(code: &str) -> bool {
    matches!(code, "1205" | "1213" | "40001" | "2006" | "2013")
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url.to_string()
}
