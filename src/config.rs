//! Configuration module for the multikv server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Command-line arguments for the cache server
#[derive(Parser, Debug)]
#[command(name = "multikv")]
#[command(author = "multikv authors")]
#[command(version)]
#[command(about = "A Redis-compatible cache server with pluggable storage backends", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:6379)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Storage backend: mem | postgres,<dsn> | crdb,<dsn> | sqlite,<path> | redis,<url>
    #[arg(short = 's', long)]
    pub storage: Option<String>,

    /// Enable multi-tenant authentication
    #[arg(long)]
    pub auth: bool,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// PEM certificate chain; serve TLS together with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Connections served at once; further accepts wait for a free slot
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// PEM certificate chain; TLS is served when set with `tls_key`
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// `[storage]` as written in the file; `mode` is parsed on resolve
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Seconds; 0 keeps pooled connections forever
    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime: u64,
    /// Seconds before the first expiry sweep
    #[serde(default = "default_sweep_delay")]
    pub sweep_delay: u64,
    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            pool_size: default_pool_size(),
            conn_max_lifetime: default_conn_max_lifetime(),
            sweep_delay: default_sweep_delay(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// `[auth]` as written in the file
#[derive(Debug, Deserialize, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub enabled: bool,
    /// `storage` or `postgres,<dsn>`
    #[serde(default)]
    pub source: Option<String>,
    /// `plain` or `argon2`
    #[serde(default)]
    pub password_hashing: Option<String>,
    /// Seconds a looked-up secret stays cached; 0 = for the process lifetime
    #[serde(default)]
    pub cache_ttl: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_mode() -> String {
    "mem".to_string()
}

fn default_pool_size() -> usize {
    200
}

fn default_conn_max_lifetime() -> u64 {
    3600 // one hour
}

fn default_sweep_delay() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    600 // ten minutes
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which storage engine to run, with its connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    Memory,
    Postgres(String),
    Sqlite(String),
    Redis(String),
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    /// Parse `mode[,connection]`, e.g. `sqlite,/var/lib/multikv.db`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, conn) = match s.split_once(',') {
            Some((mode, conn)) => (mode, Some(conn)),
            None => (s, None),
        };

        let required = |conn: Option<&str>| match conn {
            Some(c) if !c.is_empty() => Ok(c.to_string()),
            _ => Err(ConfigError::MissingConnection(mode.to_string())),
        };

        match mode.to_ascii_lowercase().as_str() {
            "mem" | "memory" => Ok(StorageMode::Memory),
            "postgres" | "crdb" => Ok(StorageMode::Postgres(required(conn)?)),
            "sqlite" => Ok(StorageMode::Sqlite(required(conn)?)),
            "redis" => Ok(StorageMode::Redis(required(conn)?)),
            _ => Err(ConfigError::UnknownMode(mode.to_string())),
        }
    }
}

/// How stored secrets are compared with the password a client sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretPolicy {
    /// Secret stored as is, compared in constant time
    #[default]
    Plain,
    /// Secret stored as an Argon2 PHC string
    Argon2,
}

impl FromStr for SecretPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "none" => Ok(SecretPolicy::Plain),
            "argon2" => Ok(SecretPolicy::Argon2),
            _ => Err(ConfigError::UnknownHashing(s.to_string())),
        }
    }
}

/// Where user secrets are looked up
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthSource {
    /// `:users:<name>` keys in the active storage engine
    #[default]
    Storage,
    /// A `users(username, password)` table
    Postgres(String),
}

impl FromStr for AuthSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(',') {
            None if s.eq_ignore_ascii_case("storage") => Ok(AuthSource::Storage),
            Some((mode, dsn)) if matches!(mode, "postgres" | "crdb") && !dsn.is_empty() => {
                Ok(AuthSource::Postgres(dsn.to_string()))
            }
            _ => Err(ConfigError::UnknownAuthSource(s.to_string())),
        }
    }
}

/// Resolved storage settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub pool_size: usize,
    pub conn_max_lifetime: u64,
    pub sweep_delay: u64,
    pub sweep_interval: u64,
}

/// Resolved authentication settings
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub source: AuthSource,
    pub policy: SecretPolicy,
    pub cache_ttl: u64,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over a parsed file (CLI takes precedence)
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let mode = cli.storage.unwrap_or(file.storage.mode);

        let tls_cert = cli.tls_cert.or(file.server.tls_cert);
        let tls_key = cli.tls_key.or(file.server.tls_key);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }

        let auth = AuthConfig {
            enabled: cli.auth || file.auth.enabled,
            source: file
                .auth
                .source
                .as_deref()
                .map(str::parse::<AuthSource>)
                .transpose()?
                .unwrap_or_default(),
            policy: file
                .auth
                .password_hashing
                .as_deref()
                .map(str::parse::<SecretPolicy>)
                .transpose()?
                .unwrap_or_default(),
            cache_ttl: file.auth.cache_ttl,
        };

        Ok(Config {
            server: ServerConfig {
                listen: cli.listen.unwrap_or(file.server.listen),
                workers: cli.workers.or(file.server.workers),
                max_connections: file.server.max_connections.max(1),
                tls_cert,
                tls_key,
            },
            storage: StorageConfig {
                mode: mode.parse()?,
                pool_size: file.storage.pool_size,
                conn_max_lifetime: file.storage.conn_max_lifetime,
                sweep_delay: file.storage.sweep_delay,
                sweep_interval: file.storage.sweep_interval.max(1),
            },
            auth,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("unknown storage mode '{0}'")]
    UnknownMode(String),

    #[error("storage mode '{0}' needs a connection string, e.g. '{0},<dsn>'")]
    MissingConnection(String),

    #[error("unknown password hashing '{0}', expected 'plain' or 'argon2'")]
    UnknownHashing(String),

    #[error("unknown auth source '{0}', expected 'storage' or 'postgres,<dsn>'")]
    UnknownAuthSource(String),

    #[error("TLS needs both a certificate and a private key")]
    IncompleteTls,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("multikv").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:6379");
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.storage.mode, "mem");
        assert_eq!(config.storage.pool_size, 200);
        assert_eq!(config.storage.conn_max_lifetime, 3600);
        assert_eq!(config.storage.sweep_delay, 60);
        assert_eq!(config.storage.sweep_interval, 600);
        assert!(!config.auth.enabled);
        assert_eq!(config.auth.cache_ttl, 0);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:6380"
            workers = 4
            max_connections = 64

            [storage]
            mode = "sqlite,/tmp/kv.db"
            sweep_interval = 30

            [auth]
            enabled = true
            source = "postgres,postgres://localhost/users"
            password_hashing = "argon2"
            cache_ttl = 300

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:6380");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.storage.mode, StorageMode::Sqlite("/tmp/kv.db".into()));
        assert_eq!(config.storage.sweep_interval, 30);
        assert_eq!(config.storage.pool_size, 200);
        assert!(config.auth.enabled);
        assert_eq!(
            config.auth.source,
            AuthSource::Postgres("postgres://localhost/users".into())
        );
        assert_eq!(config.auth.policy, SecretPolicy::Argon2);
        assert_eq!(config.auth.cache_ttl, 300);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7000"
            [storage]
            mode = "mem"
            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let args = cli(&["-l", "127.0.0.1:7001", "-s", "redis,redis://cache:6379", "--auth", "--log-level", "trace"]);
        let config = Config::merge(args, file).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:7001");
        assert_eq!(config.storage.mode, StorageMode::Redis("redis://cache:6379".into()));
        assert!(config.auth.enabled);
        assert_eq!(config.auth.source, AuthSource::Storage);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_tls_paths() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            tls_cert = "/etc/multikv/cert.pem"
            tls_key = "/etc/multikv/key.pem"
            "#,
        )
        .unwrap();
        let config = Config::merge(cli(&["--tls-key", "/run/key.pem"]), file).unwrap();
        assert_eq!(config.server.tls_cert, Some(PathBuf::from("/etc/multikv/cert.pem")));
        assert_eq!(config.server.tls_key, Some(PathBuf::from("/run/key.pem")));

        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert!(config.server.tls_cert.is_none());

        assert!(matches!(
            Config::merge(cli(&["--tls-cert", "cert.pem"]), TomlConfig::default()),
            Err(ConfigError::IncompleteTls)
        ));
    }

    #[test]
    fn test_storage_mode_parsing() {
        assert_eq!("mem".parse::<StorageMode>().unwrap(), StorageMode::Memory);
        assert_eq!(
            "crdb,postgres://root@localhost:26257/kv".parse::<StorageMode>().unwrap(),
            StorageMode::Postgres("postgres://root@localhost:26257/kv".into())
        );
        assert_eq!(
            "sqlite,:memory:".parse::<StorageMode>().unwrap(),
            StorageMode::Sqlite(":memory:".into())
        );
        // Only the first comma separates mode from connection string
        assert_eq!(
            "postgres,host=a,b".parse::<StorageMode>().unwrap(),
            StorageMode::Postgres("host=a,b".into())
        );
        assert!(matches!(
            "postgres".parse::<StorageMode>(),
            Err(ConfigError::MissingConnection(_))
        ));
        assert!(matches!(
            "mysql,dsn".parse::<StorageMode>(),
            Err(ConfigError::UnknownMode(_))
        ));
    }

    #[test]
    fn test_auth_options_parsing() {
        assert_eq!("storage".parse::<AuthSource>().unwrap(), AuthSource::Storage);
        assert!("postgres".parse::<AuthSource>().is_err());
        assert_eq!("PLAIN".parse::<SecretPolicy>().unwrap(), SecretPolicy::Plain);
        assert!("bcrypt".parse::<SecretPolicy>().is_err());
    }
}
