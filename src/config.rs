//! Process configuration from the environment.

use crate::classify::ClassifierConfig;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_WS_PORT: u16 = 3001;

#[derive(Debug, Clone)]
pub struct Config {
    /// Plain HTTP API port.
    pub port: u16,
    /// Streaming observer port.
    pub ws_port: u16,
    /// Key-value store URL; unset selects the in-process backend.
    pub store_url: Option<String>,
    /// Flow database path; unset selects in-memory SQLite.
    pub db_path: Option<String>,
    pub classifier: ClassifierConfig,
    /// Exact allowed CORS origin; unset is permissive (development).
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_port("SWITCHBOARD_PORT", DEFAULT_PORT),
            ws_port: env_port("SWITCHBOARD_WS_PORT", DEFAULT_WS_PORT),
            store_url: std::env::var("SWITCHBOARD_STORE_URL").ok(),
            db_path: std::env::var("SWITCHBOARD_DB_PATH").ok(),
            classifier: ClassifierConfig::from_env(),
            cors_origin: std::env::var("SWITCHBOARD_CORS_ORIGIN").ok(),
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(default)
}
