// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a reconciler
//! configuration

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::time::Duration;
use thiserror::Error;

/// Configuration for a cluster reconciler
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Process-wide logging configuration.
    #[serde(default = "default_log")]
    pub log: ConfigLogging,
    /// Identity of the cluster, used as its name in bootstrap documents and
    /// for the admin credentials.
    pub cluster_id: String,
    /// Registry the control-plane images are pulled from.
    #[serde(default = "default_image_repository")]
    pub image_repository: String,
    /// Directory on nodes receiving network add-on manifests.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: Utf8PathBuf,
    /// Where the bootstrap document is written on a node.
    #[serde(default = "default_bootstrap_config_path")]
    pub bootstrap_config_path: Utf8PathBuf,
    #[serde(default)]
    pub file_write_retry: RetryConfig,
    /// Upper bound of concurrent teardown commands.
    #[serde(default = "default_teardown_parallelism")]
    pub teardown_parallelism: usize,
}

/// A flat, bounded retry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RetryConfig {
    pub interval_secs: u64,
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { interval_secs: 2, max_elapsed_secs: 7 }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }
}

fn default_log() -> ConfigLogging {
    ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
}

fn default_image_repository() -> String {
    "k8s.gcr.io".to_string()
}

fn default_remote_dir() -> Utf8PathBuf {
    "/var/lib/fleet".into()
}

fn default_bootstrap_config_path() -> Utf8PathBuf {
    "/etc/kubeadm/config.yaml".into()
}

fn default_teardown_parallelism() -> usize {
    fleet_common::fanout::DEFAULT_MAX_PARALLELISM
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }

    /// A configuration with every default and the given cluster identity.
    pub fn new(cluster_id: impl Into<String>) -> Config {
        Config {
            log: default_log(),
            cluster_id: cluster_id.into(),
            image_repository: default_image_repository(),
            remote_dir: default_remote_dir(),
            bootstrap_config_path: default_bootstrap_config_path(),
            file_write_retry: RetryConfig::default(),
            teardown_parallelism: default_teardown_parallelism(),
        }
    }

    /// Builds the root logger described by the `log` section.
    pub fn logger(&self) -> Result<Logger, ConfigError> {
        self.log
            .to_logger("cluster-reconciler")
            .map_err(|error| ConfigError::Logger { error })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to set up logging")]
    Logger {
        #[source]
        error: std::io::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::NamedUtf8TempFile;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(r#"cluster_id = "prod""#).unwrap();
        assert_eq!(config, Config::new("prod"));
        assert_eq!(config.image_repository, "k8s.gcr.io");
        assert_eq!(config.remote_dir, "/var/lib/fleet");
        assert_eq!(config.bootstrap_config_path, "/etc/kubeadm/config.yaml");
        assert_eq!(config.file_write_retry.interval(), Duration::from_secs(2));
        assert_eq!(
            config.file_write_retry.max_elapsed(),
            Duration::from_secs(7)
        );
        assert_eq!(config.teardown_parallelism, 16);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedUtf8TempFile::new().unwrap();
        writeln!(
            file,
            r#"
cluster_id = "prod"
image_repository = "registry.example.com"
teardown_parallelism = 4

[log]
mode = "stderr-terminal"
level = "debug"

[file_write_retry]
interval_secs = 1
max_elapsed_secs = 3
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_id, "prod");
        assert_eq!(config.image_repository, "registry.example.com");
        assert_eq!(config.teardown_parallelism, 4);
        assert_eq!(config.file_write_retry.max_elapsed_secs, 3);
        assert!(matches!(
            config.log,
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Debug }
        ));
        let log = config.logger().expect("terminal logger builds");
        slog::debug!(log, "logger built"; "cluster" => &config.cluster_id);
    }

    #[test]
    fn test_errors_name_the_path() {
        let err = Config::from_file("/nonexistent/reconciler.toml")
            .expect_err("file does not exist");
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/reconciler.toml"));

        let mut file = NamedUtf8TempFile::new().unwrap();
        writeln!(file, "cluster_id = [").unwrap();
        let err = Config::from_file(file.path()).expect_err("bad toml");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
