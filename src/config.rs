//! Defaults and overrides shared by the connection factories.
//!
//! Values are read from a [`config::Config`] with optional namespacing: a
//! lookup for `key` under the name `client` tries `client.key` first, then
//! `key`, then falls back to a hard-coded default.

use crate::error::Error;
use ::config::Config;
use std::time::Duration;

const DEFAULT_THREAD_POOL_SIZE: usize = 4;
const DEFAULT_POLL_CAPACITY: usize = 256;
const DEFAULT_MAX_READ_SIZE: usize = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

// Missing keys mean "use the default"; a present key with a bad value is an
// error the caller should see.
fn optional<T>(result: Result<T, config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Runtime defaults and overrides applied by the connection factories.
///
/// # Configuration Keys
///
/// - `override_timeout`: forced endpoint timeout in milliseconds
/// - `override_connect_timeout`: forced connect timeout in milliseconds
/// - `override_compress`: forced compression flag
/// - `default_timeout`: connect and validation timeout in milliseconds for
///   endpoints without one (default 60000)
/// - `warn_connections`: log a warning for accept and start failures
/// - `trace_retry`: retry trace level (2 or more logs every failed route)
/// - `thread_pool_size`: number of workers in a [`ThreadPool`](crate::ThreadPool)
/// - `poll_capacity`: capacity of the mio events buffer
/// - `max_read_size`: size of a single socket read
///
/// # Example
///
/// ```toml
/// override_timeout = 5000
///
/// [client]
/// override_compress = false
/// trace_retry = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub override_timeout: Option<Duration>,
    pub override_connect_timeout: Option<Duration>,
    pub override_compress: Option<bool>,
    pub default_timeout: Duration,
    pub warn_connections: bool,
    pub trace_retry: usize,
    pub thread_pool_size: usize,
    pub poll_capacity: usize,
    pub max_read_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            override_timeout: None,
            override_connect_timeout: None,
            override_compress: None,
            default_timeout: DEFAULT_TIMEOUT,
            warn_connections: false,
            trace_retry: 0,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

impl Settings {
    /// Loads settings from configuration without a namespace.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Loads settings with configuration namespacing.
    ///
    /// Lookup priority is `{name}.{key}`, then `{key}`, then the default.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();
        let millis = |key: &str| -> Result<Option<Duration>, Error> {
            Ok(optional(get_namespaced_usize(config, name, key))?
                .map(|ms| Duration::from_millis(ms as u64)))
        };

        Ok(Self {
            override_timeout: millis("override_timeout")?,
            override_connect_timeout: millis("override_connect_timeout")?,
            override_compress: optional(get_namespaced_bool(config, name, "override_compress"))?,
            default_timeout: millis("default_timeout")?
                .filter(|timeout| !timeout.is_zero())
                .unwrap_or(defaults.default_timeout),
            warn_connections: optional(get_namespaced_bool(config, name, "warn_connections"))?
                .unwrap_or(defaults.warn_connections),
            trace_retry: optional(get_namespaced_usize(config, name, "trace_retry"))?
                .unwrap_or(defaults.trace_retry),
            thread_pool_size: optional(get_namespaced_usize(config, name, "thread_pool_size"))?
                .unwrap_or(defaults.thread_pool_size)
                .max(1),
            poll_capacity: optional(get_namespaced_usize(config, name, "poll_capacity"))?
                .unwrap_or(defaults.poll_capacity),
            max_read_size: optional(get_namespaced_usize(config, name, "max_read_size"))?
                .unwrap_or(defaults.max_read_size),
        })
    }

    /// Compression flag for a connection to `endpoint`: the override if set,
    /// else the endpoint's own flag.
    /// Timeout for connecting and validating: the endpoint's own if set,
    /// else [`Self::default_timeout`].
    pub(crate) fn timeout_for(&self, endpoint_timeout: Option<Duration>) -> Duration {
        endpoint_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.default_timeout)
    }

    pub(crate) fn compress_for(&self, endpoint_compress: bool) -> bool {
        self.override_compress.unwrap_or(endpoint_compress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(&str, &str)]) -> Config {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_default(*key, *value).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn defaults_when_empty() {
        let settings = Settings::new(&build(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn namespaced_value_wins_over_global() {
        let config = build(&[
            ("override_timeout", "1000"),
            ("client.override_timeout", "250"),
            ("trace_retry", "2"),
        ]);
        let settings = Settings::new_named(&config, "client").unwrap();
        assert_eq!(settings.override_timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.trace_retry, 2);

        let settings = Settings::new_named(&config, "server").unwrap();
        assert_eq!(settings.override_timeout, Some(Duration::from_millis(1000)));
    }

    #[test]
    fn compress_override() {
        let config = build(&[("override_compress", "true")]);
        let settings = Settings::new(&config).unwrap();
        assert!(settings.compress_for(false));
        assert!(!Settings::default().compress_for(false));
        assert!(Settings::default().compress_for(true));
    }

    #[test]
    fn bad_value_is_an_error() {
        let config = build(&[("thread_pool_size", "many")]);
        assert!(matches!(Settings::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn endpoints_without_timeout_get_the_default() {
        let settings = Settings::new(&build(&[("default_timeout", "1500")])).unwrap();
        assert_eq!(settings.timeout_for(None), Duration::from_millis(1500));
        assert_eq!(settings.timeout_for(Some(Duration::ZERO)), Duration::from_millis(1500));
        assert_eq!(settings.timeout_for(Some(Duration::from_millis(20))), Duration::from_millis(20));
        assert_eq!(Settings::default().timeout_for(None), Duration::from_secs(60));
    }
}
