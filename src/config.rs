use crate::docker::ContainerName;
use crate::fleet::HealthWait;
use crate::rotation::RotationSettings;
use crate::runner::LoopIntervals;
use crate::telemetry::TelemetrySettings;
use figment2::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "SHIFTER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment2::Error>),
    #[error("no managed containers configured, set `containers` or `replicas`")]
    NoContainers,
    #[error("container {0} is listed more than once")]
    DuplicateContainer(ContainerName),
    #[error("`{0}` must be greater than zero")]
    ZeroInterval(&'static str),
}

fn default_replica_prefix() -> String {
    "app".to_string()
}
fn default_rotation_interval() -> u64 {
    300
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_sweep_every_ticks() -> u64 {
    30
}
fn default_health_check_interval_ms() -> u64 {
    1000
}
fn default_health_log_interval() -> u64 {
    10
}
fn default_health_timeout() -> u64 {
    300
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_state_ttl_ms() -> u64 {
    1000
}
fn default_failed_rotation_retry() -> u64 {
    30
}
fn default_snapshot_refresh_interval() -> u64 {
    2
}
fn default_metrics_poll_interval() -> u64 {
    1
}
fn default_metrics_retention() -> u64 {
    60
}
fn default_container_history_interval() -> u64 {
    5
}
fn default_container_history_retention() -> u64 {
    300
}
fn default_security_cache_ttl() -> u64 {
    30
}
fn default_proxy_url() -> String {
    "http://docker-proxy:2375".to_string()
}
fn default_proxy_timeout() -> u64 {
    30
}
fn default_replica_url() -> String {
    "http://{container}".to_string()
}
fn default_prepare_timeout() -> u64 {
    300
}
fn default_metrics_timeout() -> u64 {
    10
}
fn default_listen_port() -> u16 {
    8090
}

/// Durations are plain numbers: seconds unless the key ends in `_ms`.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Comma separated.
    pub containers: Option<String>,
    pub replicas: Option<usize>,
    #[serde(default = "default_replica_prefix")]
    pub replica_prefix: String,
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_sweep_every_ticks")]
    pub sweep_every_ticks: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_log_interval")]
    pub health_log_interval: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default = "default_state_ttl_ms")]
    pub state_ttl_ms: u64,
    #[serde(default = "default_failed_rotation_retry")]
    pub failed_rotation_retry: u64,
    #[serde(default = "default_snapshot_refresh_interval")]
    pub snapshot_refresh_interval: u64,
    #[serde(default = "default_metrics_poll_interval")]
    pub metrics_poll_interval: u64,
    #[serde(default = "default_metrics_retention")]
    pub metrics_retention: u64,
    #[serde(default = "default_container_history_interval")]
    pub container_history_interval: u64,
    #[serde(default = "default_container_history_retention")]
    pub container_history_retention: u64,
    #[serde(default = "default_security_cache_ttl")]
    pub security_cache_ttl: u64,
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    pub proxy_token: Option<String>,
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout: u64,
    #[serde(default = "default_replica_url")]
    pub replica_url: String,
    pub replica_token: Option<String>,
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout: u64,
    #[serde(default = "default_metrics_timeout")]
    pub metrics_timeout: u64,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub api_secret: Option<String>,
}

impl Config {
    /// Loop periods of zero would spin, a zero rotation interval would
    /// rotate on every tick.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("rotation_interval", self.rotation_interval),
            ("tick_interval_ms", self.tick_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("metrics_poll_interval", self.metrics_poll_interval),
            ("container_history_interval", self.container_history_interval),
            ("snapshot_refresh_interval", self.snapshot_refresh_interval),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(key));
            }
        }
        Ok(())
    }

    /// Explicit names win over a replica count.
    pub fn container_names(&self) -> Result<Vec<ContainerName>, ConfigError> {
        let names: Vec<ContainerName> = match (&self.containers, self.replicas) {
            (Some(list), _) if !list.trim().is_empty() => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            (_, Some(count)) => (1..=count)
                .map(|i| format!("{}-{i}", self.replica_prefix))
                .collect(),
            _ => Vec::new(),
        };
        if names.is_empty() {
            return Err(ConfigError::NoContainers);
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(ConfigError::DuplicateContainer(name.clone()));
            }
        }
        Ok(names)
    }

    pub fn rotation_settings(&self) -> RotationSettings {
        RotationSettings {
            interval: Duration::from_secs(self.rotation_interval),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            sweep_every_ticks: self.sweep_every_ticks,
            health: HealthWait {
                check_interval: Duration::from_millis(self.health_check_interval_ms),
                log_interval: Duration::from_secs(self.health_log_interval),
                timeout: Duration::from_secs(self.health_timeout),
            },
            stop_timeout: Duration::from_secs(self.stop_timeout),
            state_ttl: Duration::from_millis(self.state_ttl_ms),
            failed_rotation_retry: Duration::from_secs(self.failed_rotation_retry),
        }
    }

    pub fn telemetry_settings(&self) -> TelemetrySettings {
        TelemetrySettings {
            metrics_interval: Duration::from_secs(self.metrics_poll_interval),
            metrics_retention: Duration::from_secs(self.metrics_retention),
            container_interval: Duration::from_secs(self.container_history_interval),
            container_retention: Duration::from_secs(self.container_history_retention),
            snapshot_interval: Duration::from_secs(self.snapshot_refresh_interval),
        }
    }

    pub fn loop_intervals(&self) -> LoopIntervals {
        LoopIntervals {
            metrics: Duration::from_secs(self.metrics_poll_interval),
            container_history: Duration::from_secs(self.container_history_interval),
            snapshot: Duration::from_secs(self.snapshot_refresh_interval),
        }
    }
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut figment = Figment::new();
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    let config = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract::<Config>()
        .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment2::Jail;

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail: &mut Jail| {
            jail.create_file(
                "shifter.toml",
                r#"
                containers = "web-1, web-2,web-3"
                rotation_interval = 120
                api_secret = "from-file"
                "#,
            )?;
            jail.set_env("SHIFTER_ROTATION_INTERVAL", "60");
            jail.set_env("SHIFTER_PROXY_TOKEN", "proxy-secret");

            let config = load_config(Some(Path::new("shifter.toml"))).unwrap();
            assert_eq!(
                config.container_names().unwrap(),
                vec!["web-1", "web-2", "web-3"]
            );
            assert_eq!(config.rotation_interval, 60);
            assert_eq!(config.proxy_token.as_deref(), Some("proxy-secret"));
            assert_eq!(config.api_secret.as_deref(), Some("from-file"));
            assert_eq!(config.listen_port, 8090);
            assert_eq!(
                config.rotation_settings().interval,
                Duration::from_secs(60)
            );
            Ok(())
        });
    }

    #[test]
    fn names_derived_from_replica_count() {
        Jail::expect_with(|jail: &mut Jail| {
            jail.set_env("SHIFTER_REPLICAS", "3");
            jail.set_env("SHIFTER_REPLICA_PREFIX", "web");
            let config = load_config(None).unwrap();
            assert_eq!(
                config.container_names().unwrap(),
                vec!["web-1", "web-2", "web-3"]
            );
            Ok(())
        });
    }

    #[test]
    fn defaults_apply_without_any_source() {
        Jail::expect_with(|_jail: &mut Jail| {
            let config = load_config(None).unwrap();
            assert!(matches!(
                config.container_names(),
                Err(ConfigError::NoContainers)
            ));
            let settings = config.rotation_settings();
            assert_eq!(settings.interval, Duration::from_secs(300));
            assert_eq!(settings.tick_interval, Duration::from_secs(1));
            assert_eq!(settings.sweep_every_ticks, 30);
            assert_eq!(settings.health.timeout, Duration::from_secs(300));
            assert_eq!(config.replica_url, "http://{container}");
            assert_eq!(
                config.telemetry_settings().snapshot_interval,
                Duration::from_secs(2)
            );
            Ok(())
        });
    }

    #[test]
    fn duplicate_names_are_rejected() {
        Jail::expect_with(|jail: &mut Jail| {
            jail.set_env("SHIFTER_CONTAINERS", "web-1,web-2,web-1");
            let config = load_config(None).unwrap();
            assert!(matches!(
                config.container_names(),
                Err(ConfigError::DuplicateContainer(name)) if name == "web-1"
            ));
            Ok(())
        });
    }

    #[test]
    fn zero_intervals_are_rejected() {
        Jail::expect_with(|jail: &mut Jail| {
            jail.set_env("SHIFTER_CONTAINERS", "web-1,web-2");
            jail.set_env("SHIFTER_TICK_INTERVAL_MS", "0");
            assert!(matches!(
                load_config(None),
                Err(ConfigError::ZeroInterval("tick_interval_ms"))
            ));

            jail.set_env("SHIFTER_TICK_INTERVAL_MS", "500");
            jail.set_env("SHIFTER_ROTATION_INTERVAL", "0");
            assert!(matches!(
                load_config(None),
                Err(ConfigError::ZeroInterval("rotation_interval"))
            ));

            jail.set_env("SHIFTER_ROTATION_INTERVAL", "60");
            jail.set_env("SHIFTER_SNAPSHOT_REFRESH_INTERVAL", "0");
            assert!(matches!(
                load_config(None),
                Err(ConfigError::ZeroInterval("snapshot_refresh_interval"))
            ));
            Ok(())
        });
    }
}
