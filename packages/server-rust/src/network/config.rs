//! Network and dispatch configuration types for the gateway.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Host name embedded in worker callback URLs. Falls back to `host`.
    pub advertise_host: Option<String>,
    /// Optional TLS configuration. Also switches callbacks to `https`/`wss`.
    pub tls: Option<TlsConfig>,
    /// Per worker-connection settings.
    pub connection: ConnectionConfig,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time a single-shot worker callback may take to be processed.
    pub callback_timeout: Duration,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            advertise_host: None,
            tls: None,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            callback_timeout: Duration::from_secs(30),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
}

/// Settings for worker streaming connections on `/res/ws`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for control messages to a worker socket.
    pub outbound_channel_capacity: usize,
    /// Maximum time a chunk may wait for room in a client's stream buffer
    /// before that stream is aborted.
    pub send_timeout: Duration,
    /// WebSocket write buffer size in bytes.
    pub ws_write_buffer_size: usize,
    /// Maximum WebSocket write buffer size in bytes.
    pub ws_max_write_buffer_size: usize,
    /// Maximum size of a single inbound worker message in bytes.
    pub ws_max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 8,
            send_timeout: Duration::from_secs(5),
            ws_write_buffer_size: 131_072,      // 128 KB
            ws_max_write_buffer_size: 524_288,  // 512 KB
            ws_max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Timing and buffering for the completions endpoint.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Deadline for a non-streaming result.
    pub result_timeout: Duration,
    /// Silence after which an SSE keep-alive comment is written.
    pub keepalive_interval: Duration,
    /// Time without a real chunk after which a stream is aborted. `None` disables.
    pub stream_idle_timeout: Option<Duration>,
    /// Total lifetime cap for a stream. `None` disables.
    pub stream_max_duration: Option<Duration>,
    /// Chunks buffered per stream between the worker socket and the client.
    pub stream_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            result_timeout: Duration::from_secs(5 * 60),
            keepalive_interval: Duration::from_secs(30),
            stream_idle_timeout: Some(Duration::from_secs(10 * 60)),
            stream_max_duration: Some(Duration::from_secs(60 * 60)),
            stream_buffer: 64,
        }
    }
}
