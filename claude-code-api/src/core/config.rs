//! Layered configuration: built-in defaults, `config/{RUN_MODE}`,
//! `config/local`, then `CLAUDE_CODE__`-prefixed environment variables.

use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub claude: ClaudeConfig,
    pub auth: AuthConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClaudeConfig {
    pub command: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
}

/// Every recognized tuning knob of the request dispatch engine (spec §6).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispatchConfig {
    pub worker_concurrency: usize,
    pub max_queue_size: usize,
    pub request_timeout_millis: u64,
    pub queue_timeout_millis: u64,
    pub session_ttl_millis: u64,
    pub max_sessions_per_key: usize,
    pub session_cleanup_interval_millis: u64,
    pub task_cleanup_interval_millis: u64,
    pub task_retention_millis: u64,
    pub session_db_path: String,
    pub task_db_path: String,
    pub default_model: Option<String>,
    pub default_workspace_dir: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("claude.command", "claude")?
            .set_default("auth.enabled", false)?
            .set_default("dispatch.worker_concurrency", 2)?
            .set_default("dispatch.max_queue_size", 100)?
            .set_default("dispatch.request_timeout_millis", 300_000)?
            .set_default("dispatch.queue_timeout_millis", 60_000)?
            .set_default("dispatch.session_ttl_millis", 3_600_000)?
            .set_default("dispatch.max_sessions_per_key", 10)?
            .set_default("dispatch.session_cleanup_interval_millis", 60_000)?
            .set_default("dispatch.task_cleanup_interval_millis", 60_000)?
            .set_default("dispatch.task_retention_millis", 3_600_000)?
            .set_default("dispatch.session_db_path", "data/sessions.db")?
            .set_default("dispatch.task_db_path", "data/tasks.db")?
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("CLAUDE_CODE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
