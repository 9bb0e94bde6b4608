//! Shared HTTP connection pool for provider clients.
//!
//! All provider clients route through one lazily initialised
//! [`reqwest::Client`]. The single instance keeps TLS sessions and DNS
//! lookups warm, which significantly reduces latency when many concurrent
//! requests are issued to upstream providers.

use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual provider
/// clients and transports.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}
