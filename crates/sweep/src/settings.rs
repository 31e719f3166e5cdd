//! Sweep settings

use std::path::PathBuf;
use std::time::Duration;

use bitcoin::Network;
use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use sweep_common::{AccountId, ConfirmationTarget, Environment, MAX_TAPS};
use url::Url;

/// Co-signing server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    /// Environment name
    pub name: String,
    /// Base url of the co-signing API
    pub url: String,
    /// Account to sweep
    pub account_id: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            name: "production".to_string(),
            url: "http://127.0.0.1:8080".to_string(),
            account_id: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Esplora backend used for broadcast and fee estimates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Esplora {
    /// Base url of the Esplora API
    pub url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for Esplora {
    fn default() -> Self {
        Self {
            url: "https://blockstream.info/api".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Sweep tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Confirmation target in blocks used for fee estimation
    pub confirmation_target_blocks: u16,
    /// Hardware taps allowed per signing request
    pub max_hardware_taps: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            confirmation_target_blocks: 3,
            max_hardware_taps: MAX_TAPS,
        }
    }
}

/// Sweep settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bitcoin network destinations must belong to
    pub network: Network,
    /// Log filter passed to [`crate::logging::init_logging`]
    pub log_level: String,
    /// Co-signing server
    pub server: Server,
    /// Esplora backend
    pub esplora: Esplora,
    /// Sweep tuning
    pub sweep: SweepConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            log_level: "info".to_string(),
            server: Server::default(),
            esplora: Esplora::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the optional TOML file, then
    /// `SWEEP_` prefixed environment variables (`SWEEP_SERVER__URL`)
    pub fn load<P>(config_file: Option<P>) -> Result<Self, ConfigError>
    where
        P: Into<PathBuf>,
    {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = config_file {
            let path: PathBuf = path.into();
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("SWEEP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;

        tracing::debug!(
            "Loaded settings for account {} on {}",
            settings.server.account_id,
            settings.network
        );

        Ok(settings)
    }

    /// Check values the types alone do not constrain
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep.confirmation_target_blocks < 1 {
            return Err(ConfigError::Message(
                "sweep.confirmation_target_blocks must be at least 1".to_string(),
            ));
        }
        if self.sweep.max_hardware_taps < 1 {
            return Err(ConfigError::Message(
                "sweep.max_hardware_taps must be at least 1".to_string(),
            ));
        }
        if self.server.account_id.trim().is_empty() {
            return Err(ConfigError::Message(
                "server.account_id must be set".to_string(),
            ));
        }
        parse_url("server.url", &self.server.url)?;
        parse_url("esplora.url", &self.esplora.url)?;

        Ok(())
    }

    /// Co-signing environment
    pub fn environment(&self) -> Result<Environment, ConfigError> {
        Ok(Environment::new(
            self.server.name.clone(),
            parse_url("server.url", &self.server.url)?,
        ))
    }

    /// Esplora base url
    pub fn esplora_url(&self) -> Result<Url, ConfigError> {
        parse_url("esplora.url", &self.esplora.url)
    }

    /// Account to sweep
    pub fn account_id(&self) -> AccountId {
        AccountId::new(self.server.account_id.clone())
    }

    /// Fee estimation target
    pub fn confirmation_target(&self) -> ConfirmationTarget {
        ConfirmationTarget::new(self.sweep.confirmation_target_blocks)
    }

    /// Co-signing request timeout
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    /// Esplora request timeout
    pub fn esplora_timeout(&self) -> Duration {
        Duration::from_secs(self.esplora.timeout_secs)
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Message(format!("{field} is not a valid url: {e}")))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
network = "signet"

[server]
name = "staging"
url = "https://staging.example.com/v1"
account_id = "acct-1"

[sweep]
confirmation_target_blocks = 6
"#,
        );

        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.network, Network::Signet);
        assert_eq!(settings.account_id(), AccountId::new("acct-1"));
        assert_eq!(settings.confirmation_target().blocks(), 6);
        assert_eq!(settings.sweep.max_hardware_taps, MAX_TAPS);

        let environment = settings.environment().unwrap();
        assert_eq!(environment.name, "staging");
        assert_eq!(
            environment.base_url.as_str(),
            "https://staging.example.com/v1"
        );
    }

    #[test]
    fn test_zero_confirmation_target_rejected() {
        let file = write_config(
            r#"
[server]
account_id = "acct-1"

[sweep]
confirmation_target_blocks = 0
"#,
        );

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Message(_)));
    }

    #[test]
    fn test_missing_account_rejected() {
        let file = write_config("network = \"regtest\"\n");
        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let settings = Settings {
            server: Server {
                account_id: "acct-1".to_string(),
                url: "not a url".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        assert!(settings.environment().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load(Some("/nonexistent/sweep.toml")).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(
            r#"
[server]
account_id = "acct-1"

[esplora]
timeout_secs = 10
"#,
        );
        std::env::set_var("SWEEP_ESPLORA__TIMEOUT_SECS", "45");

        let settings = Settings::load(Some(file.path()));
        std::env::remove_var("SWEEP_ESPLORA__TIMEOUT_SECS");

        assert_eq!(
            settings.unwrap().esplora_timeout(),
            Duration::from_secs(45)
        );
    }
}
