use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REPORT_PATH: &str = "report.txt";
pub const RELAY_BUFFER_SIZE: usize = 4096;
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Static settings for a [`crate::ProxyServer`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listener binds to. Default: `0.0.0.0:8080`
    pub listen_addr: SocketAddr,

    /// Where `generate_report` writes. Default: `report.txt`
    pub report_path: PathBuf,

    /// Bound on outbound connects (origins and CONNECT targets).
    /// Default: `None`, a connect may wait indefinitely.
    pub connect_timeout: Option<Duration>,

    /// Read size for each CONNECT relay direction.
    pub relay_buffer_size: usize,

    /// Largest accepted request or origin response head, in bytes.
    pub max_head_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            report_path: PathBuf::from(DEFAULT_REPORT_PATH),
            connect_timeout: None,
            relay_buffer_size: RELAY_BUFFER_SIZE,
            max_head_size: MAX_HEAD_SIZE,
        }
    }
}

impl ProxyConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = path.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
