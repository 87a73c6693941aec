use std::{sync::Arc, time::Duration};

use xmp_protocol::{Registry, frame::DEFAULT_MAX_PAYLOAD};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub connect_timeout: Duration,
    /// Idle time after which a keepalive is sent. `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,
    /// Largest payload accepted from the tester.
    pub max_payload: usize,
    /// Commands known to this client, used to route pushed notifications.
    pub registry: Arc<Registry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(10)),
            max_payload: DEFAULT_MAX_PAYLOAD,
            registry: Registry::builtin(),
        }
    }
}

/// Builder to create a [Config] and modify individual options
///
/// # Example
///
/// ```
/// use xmp_client::Builder;
/// use std::time::Duration;
///
/// let config = Builder::new()
///     .connect_timeout(Duration::from_secs(2))
///     .keepalive(None)
///     .build();
/// assert!(config.keepalive_interval.is_none());
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set how long establishing the TCP connection may take.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the idle interval after which a keepalive is sent, or disable keepalives.
    pub fn keepalive(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the highest payload size this client is expected to receive.
    pub fn max_payload(mut self, size: usize) -> Self {
        self.config.max_payload = size;
        self
    }

    /// Use a custom command registry instead of the built-in catalogue.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.config.registry = registry;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
