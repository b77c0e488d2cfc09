use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "effect-bridge.toml";
const ENV_PREFIX: &str = "EFFECT_BRIDGE_";
const MIN_FRAME_BYTES: usize = 64;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
    /// Receive idle time after which a keep-alive is sent.
    pub poll_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 51337,
            connect_timeout_ms: 10_000,
            retry_delay_ms: 5_000,
            max_attempts: 3,
            poll_interval_ms: 5_000,
            keepalive_interval_ms: 2_000,
            max_frame_bytes: crate::codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub tick_rate_hz: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { tick_rate_hz: 60 }
    }
}

impl HostConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file")
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let conn = &mut self.connection;
        if let Ok(val) = env::var(format!("{}HOST", ENV_PREFIX)) {
            conn.host = val;
        }
        override_parsed("PORT", &mut conn.port);
        override_parsed("CONNECT_TIMEOUT_MS", &mut conn.connect_timeout_ms);
        override_parsed("RETRY_DELAY_MS", &mut conn.retry_delay_ms);
        override_parsed("MAX_ATTEMPTS", &mut conn.max_attempts);
        override_parsed("POLL_INTERVAL_MS", &mut conn.poll_interval_ms);
        override_parsed("KEEPALIVE_INTERVAL_MS", &mut conn.keepalive_interval_ms);
        override_parsed("MAX_FRAME_BYTES", &mut conn.max_frame_bytes);

        override_parsed("TICK_RATE_HZ", &mut self.host.tick_rate_hz);
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let conn = &self.connection;
        if conn.host.trim().is_empty() {
            return Err("connection.host must be set".into());
        }
        if conn.port == 0 {
            return Err("connection.port must be non-zero".into());
        }
        if conn.max_attempts == 0 {
            return Err("connection.max_attempts must be >= 1".into());
        }
        if conn.connect_timeout_ms == 0 {
            return Err("connection.connect_timeout_ms must be non-zero".into());
        }
        if conn.poll_interval_ms == 0 {
            return Err("connection.poll_interval_ms must be non-zero".into());
        }
        if conn.keepalive_interval_ms == 0 {
            return Err("connection.keepalive_interval_ms must be non-zero".into());
        }
        if conn.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(format!("connection.max_frame_bytes must be >= {MIN_FRAME_BYTES}").into());
        }
        if self.host.tick_rate_hz == 0 {
            return Err("host.tick_rate_hz must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{CONFIG_FILE} already exists").into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn override_parsed<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = env::var(format!("{ENV_PREFIX}{name}")) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = %format!("{ENV_PREFIX}{name}"), value = %val, "ignoring unparsable override"),
        }
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("APPDATA")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join("effect-bridge").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
