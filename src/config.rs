//! Controller and evaluation settings, loaded from a TOML file.
use crate::eval::EvaluationOptions;
use crate::remoting::ChannelKind;
use crate::{muted_error, weak_error};
use log::error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::PathBuf;
use std::time::Duration;

/// Supervisor settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Kind of the process-wide remoting channel.
    pub channel: ChannelKind,
    /// How long to wait for a child debugger server to register itself.
    pub launch_timeout_ms: u64,
    /// How long to wait for a stopped child to exit before killing it.
    pub stop_timeout_ms: u64,
    /// How long a cooperative exit may take before escalation to a forced stop.
    pub exit_timeout_ms: u64,
    /// Explicit path to the `rdbg-server` executable.
    pub server_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelKind::Tcp,
            launch_timeout_ms: 15_000,
            stop_timeout_ms: 2_000,
            exit_timeout_ms: 3_000,
            server_path: None,
        }
    }
}

impl ControllerConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}

/// Default evaluation settings for new sessions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationConfig {
    pub timeout_ms: u64,
    pub abort_timeout_ms: u64,
    pub allow_target_invoke: bool,
    pub evaluate_properties: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        let opts = EvaluationOptions::default();
        Self {
            timeout_ms: opts.timeout_ms,
            abort_timeout_ms: opts.abort_timeout_ms,
            allow_target_invoke: opts.allow_target_invoke,
            evaluate_properties: opts.evaluate_properties,
        }
    }
}

impl From<&EvaluationConfig> for EvaluationOptions {
    fn from(cfg: &EvaluationConfig) -> Self {
        EvaluationOptions {
            timeout_ms: cfg.timeout_ms,
            abort_timeout_ms: cfg.abort_timeout_ms,
            allow_target_invoke: cfg.allow_target_invoke,
            evaluate_properties: cfg.evaluate_properties,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub evaluation: EvaluationConfig,
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/rdbg/config.toml";

    /// Load configuration from file. Falls back to defaults if a file is missing or broken.
    pub fn from_file(path: Option<&str>) -> Self {
        let data = match path {
            None => {
                let Some(home) = home::home_dir() else {
                    return Self::default();
                };
                match muted_error!(read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Self::default(),
                }
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!(target: "rdbg", "Error while load config file: {err}");
                    return Self::default();
                }
            },
        };

        weak_error!(Self::parse(&data), "config parsing:").unwrap_or_default()
    }

    pub fn parse(data: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(data)
    }

    pub fn evaluation_options(&self) -> EvaluationOptions {
        EvaluationOptions::from(&self.evaluation)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.controller.launch_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.controller.stop_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.controller.exit_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.controller.channel, ChannelKind::Tcp);
        assert!(cfg.evaluation.allow_target_invoke);
    }

    #[test]
    fn test_partial_file() {
        let cfg = Config::parse(
            r#"
            [controller]
            channel = "unix"
            stop_timeout_ms = 500

            [evaluation]
            allow_target_invoke = false
            "#,
        )
        .unwrap();

        assert_eq!(cfg.controller.channel, ChannelKind::Unix);
        assert_eq!(cfg.controller.stop_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.controller.launch_timeout(), Duration::from_secs(15));
        assert!(!cfg.evaluation.allow_target_invoke);
        assert!(cfg.evaluation.evaluate_properties);
        assert!(cfg.controller.server_path.is_none());
    }

    #[test]
    fn test_missing_file_fallback() {
        let cfg = Config::from_file(Some("/definitely/not/here/rdbg.toml"));
        assert_eq!(cfg, Config::default());
    }
}
