//! # Client Configuration
//!
//! Plain settings struct with defaults matching a stock HandlerSocket
//! deployment. Deserializable so binaries can load it from a file; every field
//! is optional in the serialized form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hs_common::{DEFAULT_READ_PORT, DEFAULT_WRITE_PORT, MAX_LINE_LEN};

/// Configuration for the client and both of its connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host, used by binaries that connect from config alone.
    pub host: String,
    /// Port of the read-only listener.
    pub read_port: u16,
    /// Port of the read-write listener.
    pub write_port: u16,
    /// Optional TCP connect timeout (milliseconds).
    pub connect_timeout_ms: Option<u64>,
    /// Optional deadline for one request, from acquiring the connection to
    /// receiving the response (milliseconds).
    pub request_timeout_ms: Option<u64>,
    /// Longest response line accepted before the connection is dropped.
    pub max_line_len: usize,
    /// Capacity of each connection's outbound and inbound queues.
    pub queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            read_port: DEFAULT_READ_PORT,
            write_port: DEFAULT_WRITE_PORT,
            connect_timeout_ms: None,
            request_timeout_ms: None,
            max_line_len: MAX_LINE_LEN,
            queue_depth: 16,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"host":"db1","request_timeout_ms":250}"#).unwrap();
        assert_eq!(config.host, "db1");
        assert_eq!(config.read_port, 9998);
        assert_eq!(config.write_port, 9999);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.connect_timeout(), None);
    }
}
