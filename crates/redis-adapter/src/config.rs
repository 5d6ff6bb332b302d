//! Connection options and the environment-variable convenience loader.

use std::time::Duration;

use crate::error::AdapterError;

/// Connection options consumed when building the driver facade. A Unix
/// socket path, when present, always takes precedence over `host`/`port`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Options {
    pub path: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub pool_size: usize,
}

mod duration_millis {
    use std::time::Duration;
    use serde::Deserialize;

    pub fn serialize<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            path: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            user: "default".to_string(),
            password: None,
            timeout: Duration::from_millis(500),
            pool_size: 5,
        }
    }
}

impl Options {
    /// Build from the `REDIS_ADAPTER_*` environment variables, falling back
    /// to [`Options::default`] for anything unset. This is a convenience for
    /// embedders that want zero boilerplate; nothing in this crate reads the
    /// environment on its own initiative outside this constructor.
    pub fn from_env() -> Self {
        let defaults = Options::default();
        Options {
            path: std::env::var("REDIS_ADAPTER_UNIX_SOCKET").ok(),
            host: std::env::var("REDIS_ADAPTER_HOST").unwrap_or(defaults.host),
            port: std::env::var("REDIS_ADAPTER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            user: std::env::var("REDIS_ADAPTER_USER").unwrap_or(defaults.user),
            password: std::env::var("REDIS_ADAPTER_PASSWORD").ok(),
            timeout: std::env::var("REDIS_ADAPTER_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            pool_size: std::env::var("REDIS_ADAPTER_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.pool_size),
        }
    }

    /// Reject options that can never produce a usable connection: no worker
    /// would ever run with a zero pool size, and an empty `host` with no
    /// Unix socket path leaves the driver nothing to dial.
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.pool_size == 0 {
            return Err(AdapterError::InvalidOptions("pool_size must be at least 1".to_string()));
        }
        if self.path.is_none() && self.host.is_empty() {
            return Err(AdapterError::InvalidOptions("host must not be empty when no unix socket path is set".to_string()));
        }
        Ok(())
    }

    /// The connection string(s) used for a single-node client, in the
    /// `redis[s]://[user[:password]@]host:port` form, or a `redis+unix://`
    /// form when a Unix socket path is configured.
    pub fn single_node_url(&self) -> String {
        if let Some(path) = &self.path {
            let mut url = format!("redis+unix://{path}");
            if let Some(password) = &self.password {
                url = format!("redis+unix://{}:{}@{}", self.user, password, path);
                let _ = &url;
            }
            url
        } else if let Some(password) = &self.password {
            format!("redis://{}:{}@{}:{}", self.user, password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_socket_path_takes_precedence_in_the_url() {
        let opts = Options { path: Some("/tmp/redis.sock".to_string()), ..Options::default() };
        assert!(opts.single_node_url().starts_with("redis+unix://"));
    }

    #[test]
    fn host_port_used_when_no_socket_configured() {
        let opts = Options::default();
        assert_eq!(opts.single_node_url(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn partial_json_config_falls_back_to_defaults_for_missing_fields() {
        let opts: Options = serde_json::from_str(r#"{"host": "redis.internal"}"#).unwrap();
        assert_eq!(opts.host, "redis.internal");
        assert_eq!(opts.port, Options::default().port);
        assert_eq!(opts.timeout, Options::default().timeout);
    }

    #[test]
    fn default_options_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let opts = Options { pool_size: 0, ..Options::default() };
        assert!(matches!(opts.validate(), Err(AdapterError::InvalidOptions(_))));
    }

    #[test]
    fn empty_host_without_a_socket_path_is_rejected() {
        let opts = Options { host: String::new(), path: None, ..Options::default() };
        assert!(matches!(opts.validate(), Err(AdapterError::InvalidOptions(_))));
    }

    #[test]
    fn empty_host_is_fine_when_a_socket_path_is_set() {
        let opts = Options { host: String::new(), path: Some("/tmp/redis.sock".to_string()), ..Options::default() };
        assert!(opts.validate().is_ok());
    }
}
