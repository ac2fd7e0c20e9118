use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use crate::cli_args::Cli;
use crate::db::{ConnectionSettings, Credentials, PoolSettings};
use crate::retry::{RetryPolicy, RetryPolicyError};

pub const CART_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid retry policy: {0}")]
    RetryPolicy(#[from] RetryPolicyError),
    #[error("invalid url '{url}': {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("pool min size {min} exceeds max size {max}")]
    PoolBounds { min: u32, max: u32 },
}

#[derive(Clone, Debug)]
pub struct ShippingConfiguration {
    pub cart_url: Url,
    pub listen_addr: SocketAddr,
    pub retry_policy: RetryPolicy,
    pub connection: ConnectionSettings,
    pub cart_connect_timeout: Duration,
}

impl ShippingConfiguration {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigurationError> {
        let retry_policy = RetryPolicy::new(cli.retry_max_attempts, Duration::from_millis(cli.retry_delay_ms))?;

        if cli.pool_min_size > cli.pool_max_size {
            return Err(ConfigurationError::PoolBounds {
                min: cli.pool_min_size,
                max: cli.pool_max_size,
            });
        }

        Ok(Self {
            cart_url: cart_url(&cli.cart_endpoint)?,
            listen_addr: cli.listen_addr,
            retry_policy,
            connection: ConnectionSettings {
                database_url: database_url(&cli.db_host)?,
                credentials: Some(Credentials {
                    username: cli.db_user,
                    password: cli.db_password,
                }),
                pool: PoolSettings {
                    min_size: cli.pool_min_size,
                    max_size: cli.pool_max_size,
                    max_statements: cli.pool_max_statements,
                    ..PoolSettings::default()
                },
            },
            cart_connect_timeout: CART_CONNECT_TIMEOUT,
        })
    }
}

/// `http://{endpoint}/shipping/`; the cart id is appended per call
pub fn cart_url(cart_endpoint: &str) -> Result<Url, ConfigurationError> {
    parse_url(format!("http://{}/shipping/", cart_endpoint))
}

pub fn database_url(db_host: &str) -> Result<Url, ConfigurationError> {
    parse_url(format!("mysql://{}/cities?ssl-mode=disabled", db_host))
}

fn parse_url(url: String) -> Result<Url, ConfigurationError> {
    Url::parse(&url).map_err(|source| ConfigurationError::Url { url, source })
}
