use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenvault_auth::AuthConfig;
use tokenvault_storage::StorageConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Token, session, rate limit and audit configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn addr(&self) -> SocketAddr {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.host.parse::<IpAddr>().is_err() {
            return Err(format!("server.host '{}' is not an IP address", self.server.host));
        }
        if self.server.purge_interval.is_zero() {
            return Err("server.purge_interval must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        self.storage.validate()?;
        self.auth.validate().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// How often expired entries are swept from the store.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    64 * 1024
}
fn default_purge_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            purge_interval: default_purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File, FileFormat};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "tokenvault.toml";

    /// Loads the TOML file (if present), then applies environment overrides,
    /// e.g. `TOKENVAULT__SERVER__PORT=9090`.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        let mut builder = Config::builder();
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("TOKENVAULT")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokenvault_storage::BackendKind;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.addr().port(), 8080);
        assert_eq!(cfg.storage.backend, BackendKind::Memory);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));

        let mut cfg = AppConfig::default();
        cfg.storage.backend = BackendKind::Redis;
        assert!(cfg.validate().unwrap_err().contains("storage.url"));

        let mut cfg = AppConfig::default();
        cfg.auth.sessions.max_sessions_per_user = 0;
        assert!(cfg.validate().unwrap_err().contains("max_sessions_per_user"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9191
purge_interval = "1m"

[storage]
backend = "postgres"
url = "postgres://localhost/tokenvault"

[auth.sessions]
idle_timeout = "15m"
max_sessions_per_user = 3

[auth.upstream]
token_endpoint = "https://idp.example.com/oauth/token"
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cfg = loader::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.server.port, 9191);
        assert_eq!(cfg.server.purge_interval, Duration::from_secs(60));
        assert_eq!(cfg.storage.backend, BackendKind::Postgres);
        assert_eq!(cfg.auth.sessions.idle_timeout, Duration::from_secs(900));
        assert_eq!(cfg.auth.sessions.max_sessions_per_user, 3);
        assert_eq!(
            cfg.auth.upstream.token_endpoint.as_deref(),
            Some("https://idp.example.com/oauth/token")
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = loader::load_config(Some("/nonexistent/tokenvault.toml")).unwrap();
        assert_eq!(cfg.server.port, 8080);
    }
}
