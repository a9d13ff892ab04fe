//! Control-plane client abstraction.
//!
//! The MeridianDB Admin API is an external collaborator: embedding
//! applications inject an implementation of [`ControlPlaneClient`] and keep
//! transport concerns (endpoint, HTTP client, retries) on their side. The
//! connector only requires the two operations below, both of which may be
//! invoked concurrently for the same and for different instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::instance::InstanceUri;
use crate::refresh::EndpointKind;

/// Certificate duration requested from the control plane, fixed by the
/// server-side proxy contract.
pub const CERT_DURATION: Duration = Duration::from_secs(3600);

/// Connection metadata for a single instance.
#[derive(Debug, Clone)]
pub struct ConnectionInfoResponse {
    /// Addresses by endpoint kind. At least one entry must be present.
    pub ip_addrs: HashMap<EndpointKind, String>,
    /// Opaque unique identifier of the instance.
    pub instance_uid: String,
}

/// A freshly issued ephemeral client certificate.
#[derive(Debug, Clone)]
pub struct ClientCertificateResponse {
    /// PEM-encoded certificate chain, newly issued leaf first, followed by
    /// any intermediates.
    pub pem_certificate_chain: Vec<String>,
    /// PEM-encoded CA certificate used solely to verify the server.
    pub ca_cert: String,
}

/// Narrow interface to the MeridianDB Admin API.
///
/// Implementations must be safe for concurrent use and should tolerate the
/// returned futures being dropped mid-flight (caller cancellation).
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Look up the current network endpoints of an instance.
    async fn get_connection_info(&self, instance: &InstanceUri) -> Result<ConnectionInfoResponse>;

    /// Issue a short-lived client certificate for the given public key under
    /// the instance's parent cluster.
    async fn generate_client_certificate(
        &self,
        parent: &str,
        public_key_pem: &str,
        duration: Duration,
    ) -> Result<ClientCertificateResponse>;
}

/// Client-side token bucket guarding control-plane calls.
///
/// Refreshes are retried immediately on failure and can additionally be
/// forced by dial errors, so the refresher takes one token per refresh to
/// keep pathological loops from taxing the Admin API. Defaults: burst of 2,
/// one token every 30 seconds.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
    interval: Duration,
    burst: u32,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// Create a limiter that accumulates one token per `interval`, holding
    /// at most `burst` tokens.
    pub fn new(interval: Duration, burst: u32) -> Self {
        RateLimiter {
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst as f64,
                last: Instant::now(),
            })),
            interval,
            burst,
        }
    }

    /// The default control-plane limiter: burst 2, one token per 30s.
    pub fn default_control_plane() -> Self {
        RateLimiter::new(Duration::from_secs(30), 2)
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last);
                state.last = now;
                state.tokens = (state.tokens
                    + elapsed.as_secs_f64() / self.interval.as_secs_f64())
                .min(self.burst as f64);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) * self.interval.as_secs_f64())
            };
            tokio::time::sleep(wait).await;
        }
    }
}
