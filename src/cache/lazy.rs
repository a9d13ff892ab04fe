//! Lazy connection info cache.
//!
//! Refreshes only when a caller asks for connection info and the cached
//! record is stale (or a refresh was forced). Suited to environments where
//! no background task may run between connection attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::instance::InstanceUri;
use crate::refresh::ConnectionInfo;

use super::{ConnectionInfoCache, Refresh, REFRESH_BUFFER};

/// Cache that rotates credentials synchronously, on demand.
pub struct LazyRefreshCache {
    uri: InstanceUri,
    refresher: Arc<dyn Refresh>,
    /// Set by `force_refresh`, consumed by the next read. Kept outside the
    /// record mutex so forcing never blocks behind an in-flight refresh.
    needs_refresh: AtomicBool,
    cached: Mutex<Option<ConnectionInfo>>,
}

impl LazyRefreshCache {
    pub(crate) fn new(uri: InstanceUri, refresher: Arc<dyn Refresh>) -> Self {
        LazyRefreshCache {
            uri,
            refresher,
            needs_refresh: AtomicBool::new(false),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ConnectionInfoCache for LazyRefreshCache {
    /// Returns the cached record while it is comfortably inside its
    /// lifetime; otherwise refreshes synchronously. The record mutex is held
    /// across the refresh, which serializes refreshes per instance.
    async fn connection_info(&self) -> Result<ConnectionInfo> {
        let mut cached = self.cached.lock().await;
        let forced = self.needs_refresh.swap(false, Ordering::SeqCst);
        if !forced {
            if let Some(info) = &*cached {
                if Utc::now() < info.expiration - REFRESH_BUFFER {
                    debug!(instance = %self.uri, "connection info still valid, using cached record");
                    return Ok(info.clone());
                }
            }
        }

        debug!(instance = %self.uri, "connection info refresh started");
        match self.refresher.refresh(&self.uri).await {
            Ok(info) => {
                *cached = Some(info.clone());
                Ok(info)
            }
            Err(err) => {
                // The record is still due for rotation; make the next read
                // try again even if the old record looks fresh.
                self.needs_refresh.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn force_refresh(&self) {
        self.needs_refresh.store(true, Ordering::SeqCst);
        debug!(instance = %self.uri, "refresh forced");
    }

    fn close(&self) {
        // Nothing to stop; provided for a uniform cache interface.
    }
}
