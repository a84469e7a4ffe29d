use crate::io::ByteOrder;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default)]
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ListenerSettings {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_interface() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4444
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Steps per mutator before moving on; 0 runs every mutator to
    /// completion.
    #[serde(default = "default_max_steps_per_mutator")]
    pub max_steps_per_mutator: u64,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_findings_dir")]
    pub findings_dir: PathBuf,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_io_timeout_ms() -> u64 {
    2000
}

fn default_exit_timeout_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_max_steps_per_mutator() -> u64 {
    4096
}

pub fn default_findings_dir() -> PathBuf {
    PathBuf::from("./.weft_findings")
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            exit_timeout_ms: default_exit_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_steps_per_mutator: default_max_steps_per_mutator(),
            byte_order: ByteOrder::default(),
            findings_dir: default_findings_dir(),
        }
    }
}

impl CampaignConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_steps(&self) -> Option<u64> {
        (self.max_steps_per_mutator > 0).then_some(self.max_steps_per_mutator)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FileFuzzSettings {
    /// Arguments passed to the target; `{}` becomes the payload path.
    #[serde(default = "default_argument_template")]
    pub argument_template: String,
    #[serde(default = "default_file_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_argument_template() -> String {
    "{}".to_string()
}

fn default_file_timeout_ms() -> u64 {
    2000
}

impl Default for FileFuzzSettings {
    fn default() -> Self {
        Self {
            argument_template: default_argument_template(),
            timeout_ms: default_file_timeout_ms(),
        }
    }
}

impl FileFuzzSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WeftConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub files: FileFuzzSettings,
}

impl WeftConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: WeftConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
