//! Client configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default login timeout applied when neither the session nor the connection
/// string supplies one.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for connecting to the warehouse service.
///
/// The raw connection string is kept alongside the parsed fields; it is the
/// key under which idle sessions are pooled.
#[derive(Clone)]
pub struct Config {
    /// Connection string this configuration was parsed from.
    pub descriptor: String,

    /// Account identifier.
    pub account: String,

    /// Service host. Derived from the account when not given.
    pub host: Option<String>,

    /// Service port (default: 443).
    pub port: u16,

    /// Login name.
    pub user: Option<String>,

    /// Login password.
    pub password: Option<String>,

    /// Initial database.
    pub database: Option<String>,

    /// Initial schema.
    pub schema: Option<String>,

    /// Initial warehouse.
    pub warehouse: Option<String>,

    /// Initial role.
    pub role: Option<String>,

    /// Application name reported to the service.
    pub application: String,

    /// Login timeout.
    pub connection_timeout: Duration,

    /// Whether sessions may be taken from and returned to the pool.
    pub pooling: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            descriptor: String::new(),
            account: String::new(),
            host: None,
            port: 443,
            user: None,
            password: None,
            database: None,
            schema: None,
            warehouse: None,
            role: None,
            application: "whdb-client".to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            pooling: true,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("account", &self.account)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .field("application", &self.application)
            .field("connection_timeout", &self.connection_timeout)
            .field("pooling", &self.pooling)
            .finish()
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string into configuration.
    ///
    /// ```text
    /// account=xy12345;user=loader;password=secret;db=SALES;warehouse=LOAD_WH;
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut config = Self {
            descriptor: conn_str.to_string(),
            ..Self::default()
        };

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "account" => config.account = value.to_string(),
                "host" => config.host = Some(value.to_string()),
                "port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid port: {value}")))?;
                }
                "user" | "uid" => config.user = Some(value.to_string()),
                "password" | "pwd" => config.password = Some(value.to_string()),
                "db" | "database" => config.database = Some(value.to_string()),
                "schema" => config.schema = Some(value.to_string()),
                "warehouse" => config.warehouse = Some(value.to_string()),
                "role" => config.role = Some(value.to_string()),
                "application" => config.application = value.to_string(),
                "connection_timeout" | "connect timeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid timeout: {value}")))?;
                    config.connection_timeout = Duration::from_secs(secs);
                }
                "pooling" => config.pooling = parse_bool(value)?,
                _ => {
                    // Ignore unknown options for forward compatibility
                    tracing::debug!(key = key, "ignoring unknown connection string option");
                }
            }
        }

        if config.account.is_empty() && config.host.is_none() {
            return Err(Error::Config(
                "connection string must specify an account or a host".into(),
            ));
        }

        Ok(config)
    }

    /// Host the session connects to.
    #[must_use]
    pub fn effective_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => format!("{}.warehouse.example.com", self.account),
        }
    }

    /// Set the account.
    #[must_use]
    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the login timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Enable or disable pooling.
    #[must_use]
    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(Error::Config(format!("invalid boolean: {value}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_parsing() {
        let config = Config::from_connection_string(
            "account=xy12345;user=loader;password=secret;db=SALES;warehouse=LOAD_WH;",
        )
        .unwrap();

        assert_eq!(config.account, "xy12345");
        assert_eq!(config.user.as_deref(), Some("loader"));
        assert_eq!(config.database.as_deref(), Some("SALES"));
        assert_eq!(config.warehouse.as_deref(), Some("LOAD_WH"));
        assert!(config.pooling);
        assert_eq!(config.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        assert_eq!(config.effective_host(), "xy12345.warehouse.example.com");
    }

    #[test]
    fn test_descriptor_is_retained() {
        let descriptor = "account=a1;db=X";
        let config = Config::from_connection_string(descriptor).unwrap();
        assert_eq!(config.descriptor, descriptor);
    }

    #[test]
    fn test_timeout_and_pooling() {
        let config =
            Config::from_connection_string("ACCOUNT=a1;connection_timeout=15;pooling=false")
                .unwrap();
        assert_eq!(config.connection_timeout, Duration::from_secs(15));
        assert!(!config.pooling);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_connection_string("account=a1;port=abc").is_err());
        assert!(Config::from_connection_string("account=a1;pooling=maybe").is_err());
        assert!(Config::from_connection_string("account").is_err());
        assert!(Config::from_connection_string("db=SALES").is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let config = Config::from_connection_string("account=a1;password=hunter2").unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
    }
}
