//! Configuration for the backend client and the driver.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

fn default_endpoint() -> Url {
    Url::parse("http://127.0.0.1:8188").expect("static endpoint")
}

fn default_timeout() -> Duration {
    // Generations can run for a long time; per-request timeouts stay generous
    // and the session deadline is enforced separately.
    Duration::from_secs(600)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Configuration for the HTTP/WebSocket backend client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// A managed sub-directory with a byte budget, in MiB.
#[derive(Debug, Clone, Deserialize)]
pub struct DirManagerConfig {
    pub sub_dir: String,
    #[serde(default)]
    pub max_mb: u64,
}

fn default_max_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_retry_times() -> u32 {
    3
}

fn default_ram_free_threshold() -> f64 {
    0.1
}

fn default_vram_free_threshold() -> f64 {
    0.2
}

fn default_torch_vram_free_threshold() -> f64 {
    0.1
}

/// Driver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub client: ClientConfig,

    /// Local base directory of the backend installation; managed cache
    /// directories are created below it.
    pub base_dir: String,

    #[serde(default)]
    pub dir_managers: Vec<DirManagerConfig>,

    /// Deadline for a whole submission.
    #[serde(default = "default_max_timeout", with = "duration_secs")]
    pub max_timeout: Duration,

    /// Upload retry count for artifact saves.
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    #[serde(default = "default_ram_free_threshold")]
    pub ram_free_threshold: f64,
    #[serde(default = "default_vram_free_threshold")]
    pub vram_free_threshold: f64,
    #[serde(default = "default_torch_vram_free_threshold")]
    pub torch_vram_free_threshold: f64,

    /// Skip the liveness gate during construction.
    #[serde(default)]
    pub disable_health_check: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            base_dir: ".".to_string(),
            dir_managers: Vec::new(),
            max_timeout: default_max_timeout(),
            retry_times: default_retry_times(),
            ram_free_threshold: default_ram_free_threshold(),
            vram_free_threshold: default_vram_free_threshold(),
            torch_vram_free_threshold: default_torch_vram_free_threshold(),
            disable_health_check: false,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DriverConfig::default();
        assert_eq!(config.max_timeout, Duration::from_secs(1800));
        assert_eq!(config.retry_times, 3);
        assert_eq!(config.ram_free_threshold, 0.1);
        assert_eq!(config.vram_free_threshold, 0.2);
        assert_eq!(config.torch_vram_free_threshold, 0.1);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: DriverConfig = serde_json::from_str(
            r#"{
                "base_dir": "/srv/comfy",
                "dir_managers": [{"sub_dir": "models/checkpoints", "max_mb": 20480}],
                "max_timeout": 600
            }"#,
        )
        .unwrap();
        assert_eq!(config.base_dir, "/srv/comfy");
        assert_eq!(config.dir_managers[0].sub_dir, "models/checkpoints");
        assert_eq!(config.max_timeout, Duration::from_secs(600));
        assert_eq!(config.client.endpoint.as_str(), "http://127.0.0.1:8188/");
    }
}
