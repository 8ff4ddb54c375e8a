//! Loading and validation of the node settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! `VANTAGE6_` prefix, nested keys being separated by `__` (e.g. `VANTAGE6_SERVER__URL`).

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use config::{Config, ConfigError, Environment, File, FileFormat, Source};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::filter::EnvFilter;
use url::Url;
use validator::{Validate, ValidationError, ValidationErrors};
use vantage6_client::ClientSettings;
use vantage6_core::DEFAULT_DATABASE;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    /// The API key the node authenticates with.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// api_key = "0f2e...c4"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VANTAGE6_API_KEY=0f2e...c4
    /// ```
    #[validate(length(min = 1))]
    pub api_key: String,
    #[validate]
    pub server: ServerSettings,
    #[serde(default)]
    pub encryption: EncryptionSettings,
    /// The databases tasks can run against, by label. A `default` database is
    /// required.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [databases]
    /// default = "/data/default.csv"
    /// omop = "postgresql://omop:5432/omop"
    /// ```
    #[validate(custom = "validate_databases")]
    pub databases: HashMap<String, String>,
    #[serde(default)]
    #[validate]
    pub socket: SocketSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings = Self::load(File::from(path.as_ref()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(file: impl Source + Send + Sync + 'static) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("VANTAGE6")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// The URI of the database labelled `label`. Unknown labels fall back to
    /// the `default` database.
    pub fn database_uri(&self, label: &str) -> Option<&str> {
        resolve_database(&self.databases, label)
    }

    /// The websocket URL of the event channel.
    pub fn socket_url(&self) -> Result<Url, SettingsError> {
        let mut url = Url::parse(&format!(
            "{}:{}{}",
            self.server.url.trim_end_matches('/'),
            self.server.port,
            self.socket.path
        ))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // switching between special schemes can't fail
        let _ = url.set_scheme(scheme);
        Ok(url)
    }
}

impl FromStr for Settings {
    type Err = SettingsError;

    /// Loads and validates settings from a TOML string.
    fn from_str(toml: &str) -> Result<Self, Self::Err> {
        let settings = Self::load(File::from_str(toml, FileFormat::Toml))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// The URI of the database labelled `label` in `databases`, or of the
/// `default` database if there's no such label.
pub fn resolve_database<'a>(databases: &'a HashMap<String, String>, label: &str) -> Option<&'a str> {
    if let Some(uri) = databases.get(label) {
        return Some(uri);
    }
    warn!(
        "database {} is not configured: using the {} database instead",
        label, DEFAULT_DATABASE
    );
    databases.get(DEFAULT_DATABASE).map(String::as_str)
}

fn validate_databases(databases: &HashMap<String, String>) -> Result<(), ValidationError> {
    if databases.contains_key(DEFAULT_DATABASE) {
        Ok(())
    } else {
        Err(ValidationError::new("missing default database"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The settings of the connection to the central server.
pub struct ServerSettings {
    /// The URL of the server, without port and path.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [server]
    /// url = "https://petronas.vantage6.ai"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VANTAGE6_SERVER__URL=https://petronas.vantage6.ai
    /// ```
    #[validate(url)]
    pub url: String,
    pub port: u16,
    /// The path of the API root.
    #[serde(default = "default_api_path")]
    pub api_path: String,
    /// The deadline of a single HTTP request, in seconds. Requests don't time
    /// out when this is left out.
    #[serde(default)]
    pub request_timeout: Option<u64>,
    /// How often a request is attempted while the server can't be reached.
    /// Leave this out to retry forever.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub attempts_on_timeout: Option<u32>,
    /// The delay between two connection attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// The delay between two authentication attempts at startup, in seconds.
    #[serde(default = "default_auth_retry_delay")]
    pub auth_retry_delay: u64,
}

fn default_api_path() -> String {
    "/api".to_string()
}

fn default_retry_delay() -> u64 {
    1
}

fn default_auth_retry_delay() -> u64 {
    10
}

impl ServerSettings {
    pub fn api_url(&self) -> String {
        format!(
            "{}:{}{}",
            self.url.trim_end_matches('/'),
            self.port,
            self.api_path
        )
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout.map(Duration::from_secs)
    }

    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_secs(self.auth_retry_delay)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            api_url: self.api_url(),
            attempts_on_timeout: self.attempts_on_timeout,
            retry_delay: Duration::from_secs(self.retry_delay),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// The end-to-end encryption settings.
pub struct EncryptionSettings {
    /// Whether encryption is disabled at this node. A node with encryption
    /// disabled refuses to join an encrypted collaboration.
    #[serde(default)]
    pub disabled: bool,
    /// The path of the base64 encoded private key. A new key is generated
    /// there if the file doesn't exist.
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
    /// Whether task inputs that fail to decrypt are processed as unencrypted
    /// inputs.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [encryption]
    /// allow_unencrypted_fallback = false
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VANTAGE6_ENCRYPTION__ALLOW_UNENCRYPTED_FALLBACK=false
    /// ```
    #[serde(default = "default_true")]
    pub allow_unencrypted_fallback: bool,
}

fn default_private_key() -> PathBuf {
    PathBuf::from("private_key.b64")
}

fn default_true() -> bool {
    true
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            private_key: default_private_key(),
            allow_unencrypted_fallback: true,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The settings of the event channel.
pub struct SocketSettings {
    /// The path of the event channel on the server.
    #[serde(default = "default_socket_path")]
    pub path: String,
    /// The interval between two pings, in seconds.
    #[serde(default = "default_ping_interval")]
    #[validate(range(min = 1))]
    pub ping_interval: u64,
    /// How often the node checks for a pong after a ping.
    #[serde(default = "default_pong_attempts")]
    #[validate(range(min = 1))]
    pub pong_attempts: u32,
    /// The delay between two pong checks, in seconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait: u64,
    /// The delay before connecting again after the channel was closed, in
    /// seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
}

fn default_socket_path() -> String {
    "/tasks".to_string()
}

fn default_ping_interval() -> u64 {
    60
}

fn default_pong_attempts() -> u32 {
    5
}

fn default_pong_wait() -> u64 {
    1
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            ping_interval: default_ping_interval(),
            pong_attempts: default_pong_attempts(),
            pong_wait: default_pong_wait(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl SocketSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    /// How long the node waits for a pong after a ping.
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_wait) * self.pong_attempts
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }
}

#[derive(Debug, Deserialize, Clone)]
/// The settings of the proxy server algorithm containers talk to.
pub struct ProxySettings {
    /// The address the proxy server binds to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [proxy]
    /// bind_address = "0.0.0.0:7654"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VANTAGE6_PROXY__BIND_ADDRESS=0.0.0.0:7654
    /// ```
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    /// The URL of the proxy server as seen from the containers.
    #[serde(default = "default_proxy_host")]
    pub host: String,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7654))
}

fn default_proxy_host() -> String {
    "http://vantage6-proxy:7654".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            host: default_proxy_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// The settings of the docker container backend.
pub struct DockerSettings {
    /// The directory holding the files of each run.
    #[serde(default = "default_task_dir")]
    pub task_dir: PathBuf,
    /// The isolated network the algorithm containers are attached to.
    #[serde(default = "default_network")]
    pub network: String,
    /// The docker executable.
    #[serde(default = "default_docker")]
    pub docker: PathBuf,
}

fn default_task_dir() -> PathBuf {
    PathBuf::from("tasks")
}

fn default_network() -> String {
    "vantage6-isolated".to_string()
}

fn default_docker() -> PathBuf {
    PathBuf::from("docker")
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            task_dir: default_task_dir(),
            network: default_network(),
            docker: default_docker(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info,vantage6_node=debug"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VANTAGE6_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use super::*;

    pub const MINIMAL: &str = r#"
        api_key = "secret"

        [server]
        url = "http://localhost"
        port = 5000

        [databases]
        default = "/data/default.csv"
        omop = "postgresql://omop:5432/omop"
    "#;

    #[test]
    fn test_defaults() {
        let settings: Settings = MINIMAL.parse().unwrap();
        assert_eq!(settings.server.api_url(), "http://localhost:5000/api");
        assert_eq!(settings.server.auth_retry_delay(), Duration::from_secs(10));
        assert!(settings.server.request_timeout().is_none());
        assert!(!settings.encryption.disabled);
        assert!(settings.encryption.allow_unencrypted_fallback);
        assert_eq!(settings.socket.ping_interval(), Duration::from_secs(60));
        assert_eq!(settings.docker.network, "vantage6-isolated");

        let client = settings.server.client_settings();
        assert_eq!(client.retry_delay, Duration::from_secs(1));
        assert!(client.attempts_on_timeout.is_none());
    }

    #[test]
    fn test_settings_new() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        assert!(Settings::new(file.path()).is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_pong_timeout_from_environment() {
        std::env::set_var("VANTAGE6_SOCKET__PONG_ATTEMPTS", "7");
        let settings: Settings = MINIMAL.parse().unwrap();
        std::env::remove_var("VANTAGE6_SOCKET__PONG_ATTEMPTS");
        assert_eq!(settings.socket.pong_attempts, 7);
        assert_eq!(settings.socket.pong_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_default_database_is_required() {
        let toml = MINIMAL.replace("default = \"/data/default.csv\"", "");
        assert!(matches!(
            toml.parse::<Settings>(),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_log_filter() {
        let toml = format!("{}\n[log]\nfilter = \"[[[\"\n", MINIMAL);
        assert!(matches!(
            toml.parse::<Settings>(),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    fn test_database_fallback() {
        let settings: Settings = MINIMAL.parse().unwrap();
        assert_eq!(settings.database_uri("omop"), Some("postgresql://omop:5432/omop"));
        assert_eq!(settings.database_uri("unknown"), Some("/data/default.csv"));
    }

    #[test]
    fn test_socket_url() {
        let settings: Settings = MINIMAL.parse().unwrap();
        assert_eq!(settings.socket_url().unwrap().as_str(), "ws://localhost:5000/tasks");

        let toml = MINIMAL.replace("http://localhost", "https://server.example");
        let settings: Settings = toml.parse().unwrap();
        assert_eq!(settings.socket_url().unwrap().as_str(), "wss://server.example:5000/tasks");
    }
}
