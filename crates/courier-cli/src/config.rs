//! `courier.toml` loading with environment and flag overrides.

use anyhow::Context;
use courier_broker::ConnectionConfig;
use courier_orchestrator::PipelineConfig;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Everything the binary can be configured with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourierConfig {
    /// `[broker]`: where and how to connect.
    #[serde(default)]
    pub broker: ConnectionConfig,
    /// `[pipeline]`: the stage queues `queues` and `drain` look at.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl CourierConfig {
    /// Parse `path`. A missing file yields the defaults; a malformed one is an error.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            }
        };
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;
        info!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Apply `COURIER_BROKER_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("COURIER_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("COURIER_BROKER_PORT") {
            self.broker.port = port
                .parse()
                .with_context(|| format!("COURIER_BROKER_PORT is not a port: {port}"))?;
        }
        if let Some(vhost) = lookup("COURIER_BROKER_VHOST") {
            self.broker.virtual_host = vhost;
        }
        if let Some(username) = lookup("COURIER_BROKER_USERNAME") {
            self.broker.username = username;
        }
        if let Some(password) = lookup("COURIER_BROKER_PASSWORD") {
            self.broker.password = password;
        }
        Ok(())
    }

    /// Apply command-line overrides.
    pub fn apply_flags(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.broker.host = host;
        }
        if let Some(port) = port {
            self.broker.port = port;
        }
    }

    /// Check broker settings and the stage list.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.broker.validate()?;
        self.pipeline.stage_queues()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
host = "rabbit.internal"
connection_attempts = 5

[pipeline]
stages = ["research", "draft"]
"#
        )
        .unwrap();

        let config = CourierConfig::load(file.path()).await.unwrap();
        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.connection_attempts, 5);
        assert_eq!(config.pipeline.stages, vec!["research", "draft"]);
        assert_eq!(config.pipeline.stall_timeout_secs, 300);
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CourierConfig::load(&dir.path().join("courier.toml"))
            .await
            .unwrap();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.pipeline.stages.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker\nhost = ").unwrap();
        assert!(CourierConfig::load(file.path()).await.is_err());
    }

    #[test]
    fn test_env_then_flags_override() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("COURIER_BROKER_HOST", "from-env"),
            ("COURIER_BROKER_PORT", "5673"),
            ("COURIER_BROKER_PASSWORD", "s3cret"),
        ]);
        let mut config = CourierConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.broker.host, "from-env");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.broker.password, "s3cret");

        config.apply_flags(Some("from-flag".into()), None);
        assert_eq!(config.broker.host, "from-flag");
        assert_eq!(config.broker.port, 5673);
    }

    #[test]
    fn test_bad_port_in_env_is_an_error() {
        let mut config = CourierConfig::default();
        let result = config.apply_env(|key| {
            (key == "COURIER_BROKER_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_stage_list_fails_validation() {
        let mut config = CourierConfig::default();
        config.pipeline.stages.clear();
        assert!(config.validate().is_err());
    }
}
