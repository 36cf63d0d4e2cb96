//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via `-f` flag or `BLOBRELAY_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `BLOBRELAY_`
//!    override YAML values; nested fields use double underscores
//!    (e.g. `BLOBRELAY_WORKER__POLL_INTERVAL_SECS=2`)
//! 3. **Storage variables** - `AZURE_STORAGE_CONNECTION_STRING`,
//!    `AZURE_STORAGE_QUEUE_NAME` and `CONTAINER_NAME` are accepted unprefixed,
//!    matching how deployments of this workflow conventionally set them.
//!
//! Both binaries (`blobrelay-upload`, `blobrelay-worker`) share this one
//! configuration type; fields a given process does not use are ignored by it.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "BLOBRELAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Local scratch directory for uploaded files. Created at startup;
    /// files written here are never cleaned up.
    pub uploads_dir: PathBuf,
    /// Azure Storage connection string. Required by the upload service;
    /// without it the worker serves HTTP but never starts its poll loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Target blob container for uploads. Required by the upload service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Queue the worker drains for blob-created notifications
    pub queue_name: String,
    /// Notification poll loop tuning
    pub worker: WorkerConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// Notification poll loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Messages requested per fetch (the queue service caps this at 32)
    pub max_batch_size: u32,
    /// Sleep between polls after a batch, empty or not (seconds)
    pub poll_interval_secs: u64,
    /// Sleep after a failed fetch before retrying (seconds)
    pub error_backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            poll_interval_secs: 10,
            error_backoff_secs: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            uploads_dir: PathBuf::from("uploads"),
            connection_string: None,
            container_name: None,
            queue_name: "documentcreated".to_string(),
            worker: WorkerConfig::default(),
            enable_otel_export: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("BLOBRELAY_").split("__"))
            // Conventional storage variable names, accepted unprefixed
            .merge(
                Env::raw()
                    .only(&["AZURE_STORAGE_CONNECTION_STRING"])
                    .map(|_| "connection_string".into()),
            )
            .merge(Env::raw().only(&["AZURE_STORAGE_QUEUE_NAME"]).map(|_| "queue_name".into()))
            .merge(Env::raw().only(&["CONTAINER_NAME"]).map(|_| "container_name".into()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.worker.max_batch_size == 0 || self.worker.max_batch_size > 32 {
            anyhow::bail!(
                "Config validation: worker.max_batch_size ({}) must be between 1 and 32",
                self.worker.max_batch_size
            );
        }
        if self.queue_name.is_empty() {
            anyhow::bail!("Config validation: queue_name cannot be empty");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn test_args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
        }
    }

    #[test]
    fn defaults_without_config_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&test_args("missing.yaml"))?;
            assert_eq!(config.port, 5000);
            assert_eq!(config.queue_name, "documentcreated");
            assert_eq!(config.uploads_dir, PathBuf::from("uploads"));
            assert_eq!(config.worker.max_batch_size, 10);
            assert_eq!(config.worker.poll_interval_secs, 10);
            assert_eq!(config.worker.error_backoff_secs, 5);
            assert!(config.connection_string.is_none());
            assert!(config.container_name.is_none());
            Ok(())
        });
    }

    #[test]
    fn storage_env_vars_map_to_fields() {
        Jail::expect_with(|jail| {
            jail.set_env(
                "AZURE_STORAGE_CONNECTION_STRING",
                "AccountName=demoacct;AccountKey=a2V5",
            );
            jail.set_env("AZURE_STORAGE_QUEUE_NAME", "filescreated");
            jail.set_env("CONTAINER_NAME", "docs");

            let config = Config::load(&test_args("missing.yaml"))?;
            assert_eq!(
                config.connection_string.as_deref(),
                Some("AccountName=demoacct;AccountKey=a2V5")
            );
            assert_eq!(config.queue_name, "filescreated");
            assert_eq!(config.container_name.as_deref(), Some("docs"));
            Ok(())
        });
    }

    #[test]
    fn yaml_file_with_nested_worker_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 8080
container_name: docs
worker:
  poll_interval_secs: 1
  error_backoff_secs: 2
"#,
            )?;

            let config = Config::load(&test_args("test.yaml"))?;
            assert_eq!(config.port, 8080);
            assert_eq!(config.container_name.as_deref(), Some("docs"));
            assert_eq!(config.worker.poll_interval_secs, 1);
            assert_eq!(config.worker.error_backoff_secs, 2);
            // Untouched nested field keeps its default
            assert_eq!(config.worker.max_batch_size, 10);
            Ok(())
        });
    }

    #[test]
    fn prefixed_env_overrides_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "port: 8080\n")?;
            jail.set_env("BLOBRELAY_PORT", "9090");
            jail.set_env("BLOBRELAY_WORKER__MAX_BATCH_SIZE", "32");

            let config = Config::load(&test_args("test.yaml"))?;
            assert_eq!(config.port, 9090);
            assert_eq!(config.worker.max_batch_size, 32);
            Ok(())
        });
    }

    #[test]
    fn batch_size_out_of_range_fails_validation() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
worker:
  max_batch_size: 33
"#,
            )?;
            assert!(Config::load(&test_args("test.yaml")).is_err());
            Ok(())
        });
    }
}
