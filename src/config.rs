use serde::Deserialize;
use std::convert::TryFrom;
use std::time::Duration;

/// Configuration for the HTTP server.
///
/// Every field has a default, so an empty environment yields a usable
/// configuration. Values can come from an `evhttp` config file or from
/// environment variables with the "EVHTTP_" prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on. Defaults to "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on. Defaults to 8080; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads, each running its own reactor. Defaults to
    /// the CPU count.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Per-phase inactivity timeout in seconds; 0 disables timeouts.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound on the request line and on each header block. Defaults to 8kb.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Bound on a request body. Defaults to 16mb.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Idle workers woken for each accepted connection.
    #[serde(default = "default_wake_fanout")]
    pub wake_fanout: usize,
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Loads the configuration from the environment.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load an "evhttp" config file (toml, yaml, json...) if one exists
    /// 3. Override with environment variables prefixed with "EVHTTP_"
    ///
    /// # Errors
    /// Returns a ConfigError if a source cannot be read or a value does not
    /// parse.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        config::Config::builder()
            .add_source(config::File::with_name("evhttp").required(false))
            .add_source(config::Environment::with_prefix("EVHTTP"))
            .build()?
            .try_into()
    }

    /// The per-phase timeout; zero means none.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `host:port` as given, for binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    8192
}

fn default_max_body_size() -> u64 {
    16 * 1024 * 1024
}

fn default_keep_alive() -> bool {
    true
}

fn default_wake_fanout() -> usize {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            threads: default_threads(),
            timeout_secs: default_timeout_secs(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            keep_alive: default_keep_alive(),
            wake_fanout: default_wake_fanout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.threads, num_cpus::get());
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_empty_source_uses_defaults() {
        let config = ServerConfig::try_from(config::Config::default()).unwrap();
        assert_eq!(config.max_header_size, 8192);
        assert_eq!(config.max_body_size, 16 * 1024 * 1024);
        assert!(config.keep_alive);
        assert_eq!(config.wake_fanout, 2);
    }

    /// Values from "EVHTTP_"-prefixed variables override the defaults.
    #[test]
    fn test_config_from_env() {
        env::set_var("EVHTTP_PORT", "9000");
        env::set_var("EVHTTP_THREADS", "4");
        env::set_var("EVHTTP_TIMEOUT_SECS", "0");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.threads, 4);
        assert!(config.timeout().is_zero());

        env::remove_var("EVHTTP_PORT");
        env::remove_var("EVHTTP_THREADS");
        env::remove_var("EVHTTP_TIMEOUT_SECS");
    }
}
