//! Static connection info cache.
//!
//! Serves a single fixed record and never contacts the control plane.
//! Intended for development setups with pre-provisioned certificates: the
//! certificate will eventually expire and no refresh will rescue it.

use async_trait::async_trait;

use crate::error::Result;
use crate::refresh::ConnectionInfo;

use super::ConnectionInfoCache;

/// Degenerate cache around a pre-baked [`ConnectionInfo`].
pub struct StaticCache {
    info: ConnectionInfo,
}

impl StaticCache {
    pub(crate) fn new(info: ConnectionInfo) -> Self {
        StaticCache { info }
    }
}

#[async_trait]
impl ConnectionInfoCache for StaticCache {
    async fn connection_info(&self) -> Result<ConnectionInfo> {
        Ok(self.info.clone())
    }

    fn force_refresh(&self) {
        // There is nothing to refresh from.
    }

    fn close(&self) {}
}
