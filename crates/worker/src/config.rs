// Worker process configuration
// Decision: DATABASE_URL is the only required setting; everything else has a default
// Decision: Scheduler tuning stays in TASK_QUEUE_* variables owned by the task-queue crate

use shelfsync_task_queue::{ConfigError, SchedulerConfig};

/// Deployment environment that disables the debug queue
pub const PRODUCTION: &str = "production";

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
    /// Deployment environment (e.g., "development", "production")
    pub environment: String,
    /// Apply pending migrations on startup
    pub run_migrations: bool,
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
}

impl WorkerConfig {
    /// Create configuration from the process environment
    ///
    /// The binary loads `.env` before calling this.
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string (required)
    /// - `DATABASE_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `ENVIRONMENT`: Deployment environment (default: "development")
    /// - `RUN_MIGRATIONS`: Apply migrations on startup (default: true)
    /// - `TASK_QUEUE_*`: see [`SchedulerConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingSetting("DATABASE_URL".to_string()))?;

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidSetting {
                    name: "DATABASE_MAX_CONNECTIONS".to_string(),
                    value: raw.clone(),
                    reason: "expected a positive integer".to_string(),
                })?,
            None => 10,
        };

        let run_migrations = match lookup("RUN_MIGRATIONS") {
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidSetting {
                        name: "RUN_MIGRATIONS".to_string(),
                        value: raw,
                        reason: "expected true or false".to_string(),
                    })
                }
            },
            None => true,
        };

        Ok(Self {
            database_url,
            max_connections,
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            run_migrations,
            scheduler: SchedulerConfig::from_lookup(&lookup)?,
        })
    }

    /// Whether this is a production deployment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case(PRODUCTION)
    }
}
