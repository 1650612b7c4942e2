//! Forwarding HTTP/HTTPS proxy with a host blocklist and a conditional-GET
//! response cache.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ProxyServer (accept loop, one task per connection)
//!   |
//!   v
//! handler -- blocklist hit --> 401
//!   |
//!   +-- CONNECT ----------> tunnel (opaque byte relay)
//!   |
//!   +-- GET/HEAD/OPTIONS/POST --> forward --> origin
//!   |                               |
//!   |                               +-- cache (GET only)
//!   |
//!   +-- other ------------> 405
//!
//! request_log <-- every non-CONNECT request line + cache stores
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: start/stop, report generation, blocklist control
//! - [`Blocklist`]: exact-match host filter
//! - [`ResponseCache`]: URL -> body + `Last-Modified`
//! - [`RequestLog`]: deduplicated request lines, exported as a report
//!
//! # Usage
//!
//! ```ignore
//! use cacheproxy::{ProxyConfig, ProxyServer};
//!
//! let server = ProxyServer::new(ProxyConfig::default());
//! server.add_blocked_host("ads.example.com");
//! let addr = server.start().await?;
//! // ...
//! server.stop();
//! server.generate_report().await?;
//! ```

pub mod blocklist;
pub mod cache;
pub mod config;
pub mod console;
pub mod error;
pub mod forward;
pub mod handler;
pub mod request;
pub mod request_log;
pub mod server;
pub mod stats;
pub mod tunnel;

pub use blocklist::Blocklist;
pub use cache::{CacheEntry, ResponseCache};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use forward::ForwardOutcome;
pub use request_log::RequestLog;
pub use server::{ProxyServer, ServerContext};
pub use stats::{Stats, StatsSnapshot};
