// Copyright 2025 the Portward authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::fs;
use tokio::net::TcpStream;

/// Default port for the administration service.
pub const DEFAULT_ADMIN_PORT: u16 = 8192;

const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Daemon configuration, loaded from a YAML file.
///
/// ```yaml
/// admin:
///   port: 8192
/// socket:
///   buffer_size: 32768
///   nodelay: true
/// service:
///   "11000": localhost:10000
///   "11001": "[::1]:10001"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub socket: SocketTuning,

    /// Static forwarding rules, keyed by local port. Keys stay strings so a
    /// malformed port is reported and skipped at startup instead of failing
    /// the whole file.
    #[serde(default)]
    pub service: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_ADMIN_PORT,
        }
    }
}

/// Socket options applied to every stream the daemon creates or accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketTuning {
    /// Send and receive buffer size for relayed sockets.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Disable Nagle's algorithm.
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Enable TCP keep-alive.
    #[serde(default)]
    pub keepalive: bool,
    /// Size of the scratch buffer each connection reads into.
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
            keepalive: false,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl SocketTuning {
    /// Apply these options to an established stream.
    pub fn apply(&self, stream: &TcpStream) -> Result<()> {
        stream
            .set_nodelay(self.nodelay)
            .context("failed to set TCP_NODELAY")?;
        let sock = SockRef::from(stream);
        sock.set_recv_buffer_size(self.buffer_size)
            .context("failed to set the socket receive buffer size")?;
        sock.set_send_buffer_size(self.buffer_size)
            .context("failed to set the socket send buffer size")?;
        sock.set_keepalive(self.keepalive)
            .context("failed to set SO_KEEPALIVE")?;
        Ok(())
    }
}

impl Config {
    /// Load the configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read configuration file at {path:?}"))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse configuration file at {path:?}"))
    }
}

fn default_admin_port() -> u16 {
    DEFAULT_ADMIN_PORT
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_nodelay() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.admin.port, DEFAULT_ADMIN_PORT);
        assert_eq!(config.socket.buffer_size, 32 * 1024);
        assert!(config.socket.nodelay);
        assert!(!config.socket.keepalive);
        assert!(config.service.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
admin:
  port: 9000
socket:
  buffer_size: 65536
  keepalive: true
service:
  "11000": localhost:10000
  "11001": "[::1]:10001"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.admin.port, 9000);
        assert_eq!(config.socket.buffer_size, 65536);
        // unspecified fields keep their defaults
        assert!(config.socket.nodelay);
        assert!(config.socket.keepalive);
        assert_eq!(config.service.len(), 2);
        assert_eq!(config.service["11000"], "localhost:10000");
        assert_eq!(config.service["11001"], "[::1]:10001");
    }

    #[tokio::test]
    async fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config.admin.port, DEFAULT_ADMIN_PORT);
    }

    #[tokio::test]
    async fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portward.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "admin:\n  port: 9100\nservice:\n  \"11000\": localhost:10000").unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.admin.port, 9100);
        assert_eq!(config.service["11000"], "localhost:10000");
    }

    #[tokio::test]
    async fn load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portward.yaml");
        std::fs::write(&path, "admin: [not, a, mapping]").unwrap();

        assert!(Config::load(&path).await.is_err());
    }
}
