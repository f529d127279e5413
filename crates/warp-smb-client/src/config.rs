//! SMB client configuration
//!
//! Configuration types for the connection lifecycle manager.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::AccessMode;
use crate::error::{ConnError, ConnResult};

/// SMB dialect versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
#[derive(Default)]
pub enum SmbDialect {
    /// SMB 2.0.2
    Smb202 = 0x0202,
    /// SMB 2.1
    Smb210 = 0x0210,
    /// SMB 3.0
    Smb300 = 0x0300,
    /// SMB 3.0.2
    Smb302 = 0x0302,
    /// SMB 3.1.1
    #[default]
    Smb311 = 0x0311,
}

/// Minimum authentication level a circuit accepts during session setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    /// Anonymous / share-level
    None,
    /// LAN Manager
    Lm,
    /// NTLMv1
    Ntlm,
    /// NTLMv2
    #[default]
    Ntlmv2,
    /// Kerberos
    Kerberos,
}

impl std::str::FromStr for AuthLevel {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lm" => Ok(Self::Lm),
            "ntlm" => Ok(Self::Ntlm),
            "ntlmv2" => Ok(Self::Ntlmv2),
            "kerberos" => Ok(Self::Kerberos),
            other => Err(ConnError::Config(format!("unknown auth level: {other}"))),
        }
    }
}

/// SMB client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dialects offered during negotiate
    pub dialects: Vec<SmbDialect>,
    /// Minimum authentication level for new circuits
    pub min_auth_level: AuthLevel,
    /// Per-request timeout handed to the exchange (seconds)
    pub timeout_secs: u64,
    /// Transmit buffer size recorded on each circuit
    pub max_tx_size: u32,
    /// Rights used when a spec does not carry any
    pub default_mode: AccessMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dialects: vec![
                SmbDialect::Smb210,
                SmbDialect::Smb300,
                SmbDialect::Smb302,
                SmbDialect::Smb311,
            ],
            min_auth_level: AuthLevel::Ntlmv2,
            timeout_secs: 15,
            max_tx_size: 64 * 1024,
            default_mode: AccessMode::new(0o700),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set offered dialects
    pub fn dialects(mut self, dialects: Vec<SmbDialect>) -> Self {
        self.dialects = dialects;
        self
    }

    /// Set minimum authentication level
    pub fn min_auth_level(mut self, level: AuthLevel) -> Self {
        self.min_auth_level = level;
        self
    }

    /// Set request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Set transmit buffer size
    pub fn max_tx_size(mut self, size: u32) -> Self {
        self.max_tx_size = size;
        self
    }

    /// Get the request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the highest offered dialect
    pub fn max_dialect(&self) -> SmbDialect {
        self.dialects
            .iter()
            .max()
            .copied()
            .unwrap_or(SmbDialect::Smb311)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> ConnResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConnError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConnResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConnError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Apply `<PREFIX>_*` environment variable overrides
    pub fn with_env_overrides(mut self, prefix: &str) -> ConnResult<Self> {
        if let Ok(val) = std::env::var(format!("{prefix}_TIMEOUT_SECS")) {
            self.timeout_secs = val
                .parse()
                .map_err(|_| ConnError::Config(format!("invalid timeout_secs value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MAX_TX_SIZE")) {
            self.max_tx_size = val
                .parse()
                .map_err(|_| ConnError::Config(format!("invalid max_tx_size value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MIN_AUTH_LEVEL")) {
            self.min_auth_level = val.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations no circuit could be built from
    pub fn validate(&self) -> ConnResult<()> {
        if self.dialects.is_empty() {
            return Err(ConnError::Config("no dialects offered".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(ConnError::Config("timeout_secs must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_ordering() {
        assert!(SmbDialect::Smb311 > SmbDialect::Smb302);
        assert!(SmbDialect::Smb302 > SmbDialect::Smb300);
        assert_eq!(SmbDialect::default(), SmbDialect::Smb311);
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .min_auth_level(AuthLevel::Kerberos)
            .timeout(Duration::from_secs(30))
            .dialects(vec![SmbDialect::Smb300]);

        assert_eq!(config.min_auth_level, AuthLevel::Kerberos);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_dialect(), SmbDialect::Smb300);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ClientConfig::from_toml_str(
            r#"
            min_auth_level = "ntlm"
            timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.min_auth_level, AuthLevel::Ntlm);
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.max_tx_size, ClientConfig::default().max_tx_size);
    }

    #[test]
    fn test_validate_rejects_empty_dialects() {
        let err = ClientConfig::from_toml_str("dialects = []").unwrap_err();
        assert!(matches!(err, ConnError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smbc.toml");
        std::fs::write(&path, "max_tx_size = 4096\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.max_tx_size, 4096);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SMBC_CFGTEST_TIMEOUT_SECS", "42");
        std::env::set_var("SMBC_CFGTEST_MIN_AUTH_LEVEL", "LM");

        let config = ClientConfig::new()
            .with_env_overrides("SMBC_CFGTEST")
            .unwrap();
        assert_eq!(config.timeout_secs, 42);
        assert_eq!(config.min_auth_level, AuthLevel::Lm);

        std::env::set_var("SMBC_CFGTEST_BAD_TIMEOUT_SECS", "soon");
        assert!(ClientConfig::new()
            .with_env_overrides("SMBC_CFGTEST_BAD")
            .is_err());
    }
}
