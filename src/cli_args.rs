use std::net::SocketAddr;

use clap::Parser;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// host[:port] of the cart service
    #[arg(long, env("CART_ENDPOINT"), default_value = "cart")]
    pub cart_endpoint: String,

    /// host[:port] of the cities database
    #[arg(long, env("DB_HOST"), default_value = "mysql")]
    pub db_host: String,

    #[arg(long, env("DB_USER"), default_value = "shipping")]
    pub db_user: String,

    #[arg(long, env("DB_PASSWORD"), default_value = "secret", hide_env_values = true)]
    pub db_password: String,

    #[arg(long, env("LISTEN_ADDR"), default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    #[arg(long, env("RETRY_MAX_ATTEMPTS"), default_value_t = 3)]
    pub retry_max_attempts: u32,

    #[arg(long, env("RETRY_DELAY_MS"), default_value_t = 1000)]
    pub retry_delay_ms: u64,

    #[arg(long, env("POOL_MIN_SIZE"), default_value_t = 5)]
    pub pool_min_size: u32,

    #[arg(long, env("POOL_MAX_SIZE"), default_value_t = 20)]
    pub pool_max_size: u32,

    /// prepared statements cached per connection
    #[arg(long, env("POOL_MAX_STATEMENTS"), default_value_t = 180)]
    pub pool_max_statements: usize,
}
