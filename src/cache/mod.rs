//! Per-instance connection info caches.
//!
//! Two interchangeable cache flavors satisfy the same contract: the
//! refresh-ahead cache rotates certificates on a timer before they expire,
//! while the lazy cache rotates synchronously when a caller observes a
//! near-expired record. A third, degenerate flavor serves a fixed record for
//! development setups.

mod lazy;
mod refresh_ahead;
mod static_info;

pub use lazy::LazyRefreshCache;
pub use refresh_ahead::RefreshAheadCache;
pub use static_info::StaticCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::instance::InstanceUri;
use crate::refresh::{ConnectionInfo, Refresher};

/// Time before expiration at which a record stops being served without a
/// refresh. Gives a caller plenty of room to finish a handshake on the
/// current certificate.
pub(crate) const REFRESH_BUFFER: chrono::Duration = chrono::Duration::minutes(4);

/// Contract shared by all cache flavors.
///
/// Implementations serialize refreshes: at most one refresh per instance is
/// in flight at any time.
#[async_trait]
pub trait ConnectionInfoCache: Send + Sync {
    /// Return the currently valid record, blocking on the first refresh or
    /// awaiting an in-flight refresh when the previous record is no longer
    /// serviceable.
    async fn connection_info(&self) -> Result<ConnectionInfo>;

    /// Invalidate any schedule so the next [`connection_info`] call observes
    /// a fresh record.
    ///
    /// [`connection_info`]: ConnectionInfoCache::connection_info
    fn force_refresh(&self);

    /// Stop background work. Idempotent.
    fn close(&self);
}

/// Internal seam between the caches and the refresher, so cache behavior is
/// testable without control-plane fixtures.
#[async_trait]
pub(crate) trait Refresh: Send + Sync + 'static {
    async fn refresh(&self, instance: &InstanceUri) -> Result<ConnectionInfo>;
}

#[async_trait]
impl Refresh for Refresher {
    async fn refresh(&self, instance: &InstanceUri) -> Result<ConnectionInfo> {
        Refresher::refresh(self, instance).await
    }
}

/// When to start the next refresh, given the freshly obtained record's
/// expiration.
///
/// Certificates normally live for an hour, so the common case is a refresh
/// at the halfway point. Records already inside the refresh buffer are
/// refreshed immediately; anything between gets a short fixed delay so a
/// slightly-early rotation does not hammer the control plane.
pub(crate) fn refresh_delay(now: DateTime<Utc>, expiration: DateTime<Utc>) -> Duration {
    let remaining = expiration - now;
    if remaining <= REFRESH_BUFFER {
        return Duration::ZERO;
    }
    if remaining < chrono::Duration::hours(1) {
        return Duration::from_secs(60);
    }
    (remaining / 2).to_std().unwrap_or(Duration::ZERO)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_refresh_delay_boundaries() {
        let now = Utc::now();
        let cases = [
            (ChronoDuration::hours(4), Duration::from_secs(2 * 3600)),
            (ChronoDuration::hours(1), Duration::from_secs(30 * 60)),
            (ChronoDuration::minutes(5), Duration::from_secs(60)),
            (ChronoDuration::minutes(3), Duration::ZERO),
            (ChronoDuration::zero(), Duration::ZERO),
        ];
        for (remaining, want) in cases {
            let got = refresh_delay(now, now + remaining);
            assert_eq!(got, want, "remaining = {remaining}");
        }
    }

    #[test]
    fn test_refresh_delay_expired_record() {
        let now = Utc::now();
        assert_eq!(
            refresh_delay(now, now - ChronoDuration::minutes(10)),
            Duration::ZERO
        );
    }
}
