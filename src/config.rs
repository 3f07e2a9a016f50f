//! Server configuration: a YAML document with per-section defaults, built once at startup and
//! passed down by reference.

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::storage::InitOptions;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub ssh: SshConfig,
    pub logger: LoggerConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Reads and parses a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Config::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Config> {
        // An empty document is the all-defaults config.
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.storage.default_branch.trim().is_empty(),
            "storage.default_branch must not be empty"
        );
        anyhow::ensure!(self.ssh.buffer_bytes > 0, "ssh.buffer_bytes must be positive");
        if self.storage.storage_type == StorageType::S3 {
            anyhow::ensure!(
                !self.storage.s3.bucket.is_empty(),
                "storage.s3.bucket is required when storage.type is s3"
            );
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// One log event per request.
    pub logs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            logs: true,
        }
    }
}

impl HttpConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid http listen address {}:{}", self.host, self.port))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// ed25519 host key; generated on first start when missing.
    pub host_key_path: PathBuf,
    pub idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Read and write buffer size of each channel adapter.
    #[serde(deserialize_with = "byte_size")]
    pub buffer_bytes: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 2222,
            host_key_path: PathBuf::from("./ssh_host_key"),
            idle_timeout_secs: 1800,
            keepalive_interval_secs: 10,
            buffer_bytes: 1024 * 1024,
        }
    }
}

impl SshConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid ssh listen address {}:{}", self.host, self.port))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Human-readable output instead of JSON lines.
    pub pretty: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            pretty: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    S3,
    /// Process-local blob store; contents vanish on exit.
    Memory,
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StorageType::Local),
            "s3" => Ok(StorageType::S3),
            "memory" => Ok(StorageType::Memory),
            other => Err(format!("unknown storage type `{other}` (expected local, s3 or memory)")),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::Local => "local",
            StorageType::S3 => "s3",
            StorageType::Memory => "memory",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub default_branch: String,
    pub initial_commit: bool,
    pub local: LocalConfig,
    pub s3: S3Config,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            default_branch: "main".to_string(),
            initial_commit: true,
            local: LocalConfig::default(),
            s3: S3Config::default(),
        }
    }
}

impl StorageConfig {
    pub fn init_options(&self) -> InitOptions {
        InitOptions {
            default_branch: self.default_branch.clone(),
            initial_commit: self.initial_commit,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LocalConfig {
    pub path: PathBuf,
    /// Budget of the decoded-object cache.
    #[serde(deserialize_with = "byte_size")]
    pub cache_bytes: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./repositories"),
            cache_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    /// Custom endpoint for S3-compatible services (MinIO, Ceph, ...).
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
            force_path_style: false,
        }
    }
}

/// Parses `4096`, `512K`, `64M`, `1G` (optionally `KB`/`KiB` style suffixes); units are
/// powers of 1024.
pub fn parse_byte_size(raw: &str) -> Result<usize, String> {
    let text = raw.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| format!("invalid byte size `{raw}`"))?;
    let multiplier: usize = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        _ => return Err(format!("invalid byte size unit in `{raw}`")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size `{raw}` overflows"))
}

fn byte_size<'deserialize, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrUSize {
        String(String),
        USize(usize),
    }

    match StringOrUSize::deserialize(deserializer)? {
        StringOrUSize::String(v) => parse_byte_size(&v).map_err(serde::de::Error::custom),
        StringOrUSize::USize(v) => Ok(v),
    }
}
