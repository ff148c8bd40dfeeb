use std::time::Duration;

/// In-memory provider configuration
///
/// Builder-style, or parsed from a `memory://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Database name (used in logs and URLs only)
    pub database: String,

    /// Maximum number of concurrently checked-out sessions
    pub max_connections: usize,

    /// How long `create_session` waits for a free slot
    pub connect_timeout: Duration,

    /// How long a row lock request waits before failing with a lock wait timeout
    pub lock_timeout: Duration,

    /// Poll interval while waiting for a slot or a row lock
    pub lock_poll_interval: Duration,
}

impl ConnectionConfig {
    /// Create a new configuration for the named database
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(5),
        }
    }

    /// Set the database name
    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set row lock wait timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set lock/slot poll interval
    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Parse from connection string
    ///
    /// Format: `memory://database[?max_connections=N&connect_timeout_ms=N&lock_timeout_ms=N]`
    ///
    /// # Examples
    ///
    /// ```
    /// use txcoord::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::from_url("memory://billing?max_connections=4").unwrap();
    /// assert_eq!(config.database, "billing");
    /// assert_eq!(config.max_connections, 4);
    /// ```
    pub fn from_url(url: &str) -> Result<Self, String> {
        let Some(rest) = url.strip_prefix("memory://") else {
            return Err("URL must start with 'memory://'".to_string());
        };

        let (database, query) = match rest.split_once('?') {
            Some((database, query)) => (database, Some(query)),
            None => (rest, None),
        };

        if database.is_empty() || database.contains('/') {
            return Err("Invalid database name".to_string());
        }

        let mut config = Self::new(database);

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Invalid parameter '{}'", pair))?;
            let number: u64 = value
                .parse()
                .map_err(|_| format!("Invalid value for '{}': {}", key, value))?;

            match key {
                "max_connections" => config.max_connections = number as usize,
                "connect_timeout_ms" => config.connect_timeout = Duration::from_millis(number),
                "lock_timeout_ms" => config.lock_timeout = Duration::from_millis(number),
                "lock_poll_interval_ms" => {
                    config.lock_poll_interval = Duration::from_millis(number)
                }
                other => return Err(format!("Unknown parameter '{}'", other)),
            }
        }

        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        format!(
            "memory://{}?max_connections={}&connect_timeout_ms={}&lock_timeout_ms={}&lock_poll_interval_ms={}",
            self.database,
            self.max_connections,
            self.connect_timeout.as_millis(),
            self.lock_timeout.as_millis(),
            self.lock_poll_interval.as_millis()
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.database.is_empty() {
            return Err("Database name cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.lock_poll_interval.is_zero() {
            return Err("lock_poll_interval must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("txcoord")
    }
}
