//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rendezvous server address (`host:port`)
    pub server_addr: String,
    /// Run identifier registered with the server; generated when absent
    #[serde(default)]
    pub run_id: Option<String>,
    /// Visitor configuration
    pub visitor: VisitorConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Visitor configuration, immutable after load. Field names follow the
/// wire convention, so TOML and JSON sources use camelCase keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitorConfig {
    /// Address the external listener binds to
    pub bind_addr: String,
    /// Listener port; zero or negative means internal-only
    pub bind_port: i32,
    /// Name of the target proxy registered on the rendezvous server
    pub server_name: String,
    /// Pre-shared secret, also held by the origin-side half
    pub secret_key: String,
    /// Layer a stream cipher over the tunnel
    pub use_encryption: bool,
    /// Layer compression over the tunnel
    pub use_compression: bool,
    /// Client-facing credentials for HTTP Basic and SOCKS user/password
    pub users: HashMap<String, String>,
}

impl Default for VisitorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            server_name: String::new(),
            secret_key: String::new(),
            use_encryption: false,
            use_compression: false,
            users: HashMap::new(),
        }
    }
}

impl VisitorConfig {
    /// Fill in defaults the way the wider client does before handing the
    /// config over.
    pub fn complete(&mut self) {
        if self.bind_addr.is_empty() {
            self.bind_addr = "127.0.0.1".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.server_name.is_empty() {
            return Err(crate::Error::Config("serverName is required".into()));
        }
        if self.bind_port > u16::MAX as i32 {
            return Err(crate::Error::Config(format!(
                "bindPort {} out of range",
                self.bind_port
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_config_camel_case() {
        let toml = r#"
            bindAddr = "0.0.0.0"
            bindPort = 9000
            serverName = "secret-web"
            secretKey = "abcdef"
            useEncryption = true
            useCompression = false

            [users]
            alice = "wonder"
        "#;
        let cfg: VisitorConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0");
        assert_eq!(cfg.bind_port, 9000);
        assert_eq!(cfg.server_name, "secret-web");
        assert!(cfg.use_encryption);
        assert_eq!(cfg.users.get("alice").map(String::as_str), Some("wonder"));
    }

    #[test]
    fn test_complete_fills_bind_addr() {
        let mut cfg = VisitorConfig {
            bind_addr: String::new(),
            server_name: "x".into(),
            ..VisitorConfig::default()
        };
        cfg.complete();
        assert_eq!(cfg.bind_addr, "127.0.0.1");
    }

    #[test]
    fn test_validate_requires_server_name() {
        let cfg = VisitorConfig::default();
        assert!(cfg.validate().is_err());

        let cfg = VisitorConfig {
            server_name: "secret-web".into(),
            ..VisitorConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_negative_bind_port_means_internal_only() {
        let cfg = VisitorConfig {
            server_name: "x".into(),
            bind_port: -1,
            ..VisitorConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
