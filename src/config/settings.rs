use crate::error::{HarnessError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_KEY: &str = "RELAY_HARNESS_CONFIG";

const ENV_PREFIX: &str = "RELAY_HARNESS_";

/// Regtest magic bytes
const DEFAULT_NETWORK_MAGIC: u32 = 0xDAB5_BFFA;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Magic prefix of every wire frame
    pub network_magic: u32,
    /// Required leading zero bits of a block hash
    pub difficulty: u32,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Bound for `wait_until` style waits on harness peers
    pub wait_timeout_ms: u64,
    /// Bound for RPC height/tip convergence checks
    pub sync_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Blocks the scenario builds by hand before the RPC-generated one
    pub manual_blocks: u64,
    /// Host the regtest nodes bind their wire listeners on
    pub bind_host: String,
    pub user_agent: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            network_magic: DEFAULT_NETWORK_MAGIC,
            difficulty: 1,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            wait_timeout_ms: 5_000,
            sync_timeout_ms: 60_000,
            poll_interval_ms: 50,
            manual_blocks: 10,
            bind_host: "127.0.0.1".to_string(),
            user_agent: format!("/relay-harness:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HarnessConfig {
    /// Defaults, then the file named by `RELAY_HARNESS_CONFIG`, then env overrides
    pub fn load() -> Result<HarnessConfig> {
        let mut config = match env::var(CONFIG_FILE_KEY) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => HarnessConfig::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<HarnessConfig> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&contents)?;
        info!("Loaded harness configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<HarnessConfig> {
        let config: HarnessConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELAY_HARNESS_<FIELD>` overrides through the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("NETWORK_MAGIC") {
            self.network_magic = parse_number(&v, "NETWORK_MAGIC")?;
        }
        if let Some(v) = get("DIFFICULTY") {
            self.difficulty = parse_number(&v, "DIFFICULTY")?;
        }
        if let Some(v) = get("CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_number(&v, "CONNECT_TIMEOUT_MS")?;
        }
        if let Some(v) = get("HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = parse_number(&v, "HANDSHAKE_TIMEOUT_MS")?;
        }
        if let Some(v) = get("WAIT_TIMEOUT_MS") {
            self.wait_timeout_ms = parse_number(&v, "WAIT_TIMEOUT_MS")?;
        }
        if let Some(v) = get("SYNC_TIMEOUT_MS") {
            self.sync_timeout_ms = parse_number(&v, "SYNC_TIMEOUT_MS")?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_number(&v, "POLL_INTERVAL_MS")?;
        }
        if let Some(v) = get("MANUAL_BLOCKS") {
            self.manual_blocks = parse_number(&v, "MANUAL_BLOCKS")?;
        }
        if let Some(v) = get("BIND_HOST") {
            self.bind_host = v;
        }
        if let Some(v) = get("USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.difficulty == 0 || self.difficulty > 255 {
            return Err(HarnessError::Config(format!(
                "difficulty must be between 1 and 255, got {}",
                self.difficulty
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(HarnessError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(HarnessError::Config(
                "connect and handshake timeouts must be positive".to_string(),
            ));
        }
        if self.wait_timeout_ms == 0 || self.sync_timeout_ms == 0 {
            return Err(HarnessError::Config(
                "timeouts must be positive, unbounded waits are not allowed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|n| n.to_string().parse::<T>().ok()),
        None => trimmed.parse::<T>().ok(),
    };
    parsed.ok_or_else(|| HarnessError::Config(format!("Invalid value for {ENV_PREFIX}{key}: {value}")))
}
