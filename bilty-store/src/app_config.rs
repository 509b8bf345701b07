use bilty_core::GrSeries;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// Without a database the service runs on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub auth: AuthConfig,
    pub reservations: ReservationRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReservationRules {
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(default = "default_max_range")]
    pub max_range: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default)]
    pub series: Vec<GrSeries>,
}

fn default_ttl_seconds() -> i64 { 180 }
fn default_max_range() -> u32 { 100 }
fn default_sweep_interval() -> u64 { 30 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 { 600 }

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 { 5 }
fn default_true() -> bool { true }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // BILTY__SERVER__PORT=8080 etc.
            .add_source(config::Environment::with_prefix("BILTY").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn series(&self) -> Result<Vec<GrSeries>, bilty_core::ReservationError> {
        for s in &self.reservations.series {
            s.validate()?;
        }
        Ok(self.reservations.series.clone())
    }
}
