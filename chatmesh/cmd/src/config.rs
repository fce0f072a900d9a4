//! Node configuration file handling.
//!
//! Settings come from an optional YAML file; command-line flags take
//! precedence over everything in it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// Node settings loadable from a YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer id as up to 16 hex digits
    pub peer_id: Option<String>,
    /// Display name announced to peers
    pub nickname: Option<String>,
    /// Listen address for inbound links
    pub listen: Option<SocketAddr>,
    /// Addresses to dial for outbound links
    pub connect: Vec<SocketAddr>,
    /// Relay probability, 0.0-1.0
    pub relay_probability: Option<f64>,
}

impl NodeConfig {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file is missing.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let config = serde_yaml::from_str(&content)?;
                info!(path = ?path.as_ref(), "loaded configuration");
                Ok(config)
            }
            Err(_) => {
                warn!(path = ?path.as_ref(), "config file not found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
nickname: alice
listen: "0.0.0.0:9400"
connect:
  - "10.0.0.2:9400"
relay_probability: 0.8
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.nickname.as_deref(), Some("alice"));
        assert_eq!(config.connect.len(), 1);
        assert_eq!(config.relay_probability, Some(0.8));
        assert!(config.peer_id.is_none());
    }
}
