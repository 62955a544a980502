use crate::{ConductorError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub planner: PlannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for persisted jobs, messages, audit entries and
    /// evidence blobs.
    pub data_dir: String,
    /// Path to the YAML agent roster.
    pub roster_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub default_timeout_secs: u64,
    pub task_max_attempts: u32,
    pub no_agent_attempts: u32,
    pub job_max_retries: u32,
    /// Optional wall-clock bound applied to every job unless the submit
    /// overrides it.
    pub job_deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Capability tag of the agent consulted when no rule matches.
    pub planning_capability: String,
    pub planning_timeout_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("No .env file loaded: {}", e),
        }

        let api_key = env::var("CONDUCTOR_API_KEY").ok();
        if let Some(key) = &api_key {
            if key.trim().is_empty() {
                return Err(ConductorError::Configuration(
                    "CONDUCTOR_API_KEY is set but blank".to_string(),
                ));
            }
            if key.len() < 32 {
                return Err(ConductorError::Configuration(
                    "CONDUCTOR_API_KEY must be at least 32 characters".to_string(),
                ));
            }
        } else {
            tracing::warn!("CONDUCTOR_API_KEY not set; intake API runs unauthenticated");
        }

        let allowed_origins = env_or("ALLOWED_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env_or("CONDUCTOR_HOST", "127.0.0.1"),
            port: env_parse("CONDUCTOR_PORT", 8080),
            api_key,
            allowed_origins,
        };

        let store = StoreConfig {
            data_dir: env_or("CONDUCTOR_DATA_DIR", "./data"),
            roster_path: env_or("CONDUCTOR_ROSTER_PATH", "./agents.yaml"),
        };

        let dispatch = DispatchConfig {
            default_timeout_secs: env_parse("TASK_DEFAULT_TIMEOUT", 30),
            task_max_attempts: env_parse("TASK_MAX_ATTEMPTS", 3),
            no_agent_attempts: env_parse("NO_AGENT_ATTEMPTS", 3),
            job_max_retries: env_parse("JOB_MAX_RETRIES", 3),
            job_deadline_secs: env::var("JOB_DEADLINE_SECS").ok().and_then(|v| v.parse().ok()),
        };

        let planner = PlannerConfig {
            planning_capability: env_or("PLANNING_CAPABILITY", "planning"),
            planning_timeout_secs: env_parse("PLANNING_TIMEOUT", 60),
        };

        Ok(Config {
            api,
            store,
            dispatch,
            planner,
        })
    }
}

/// Fixture config used across the crate's test suites.
#[cfg(test)]
pub fn test_config(data_dir: &str) -> Config {
    Config {
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_key: None,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        store: StoreConfig {
            data_dir: data_dir.to_string(),
            roster_path: format!("{data_dir}/agents.yaml"),
        },
        dispatch: DispatchConfig {
            default_timeout_secs: 5,
            task_max_attempts: 2,
            no_agent_attempts: 2,
            job_max_retries: 3,
            job_deadline_secs: None,
        },
        planner: PlannerConfig {
            planning_capability: "planning".to_string(),
            planning_timeout_secs: 5,
        },
    }
}
