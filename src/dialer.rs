//! The dialer.
//!
//! [`Dialer`] is the public entrypoint: it owns one connection info cache
//! per instance and runs the dial pipeline (resolve endpoints, TCP connect,
//! TLS 1.3 handshake, metadata exchange) to produce an authenticated byte
//! stream to the instance's server-side proxy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use uuid::Uuid;

use crate::admin::RateLimiter;
use crate::cache::{ConnectionInfoCache, LazyRefreshCache, RefreshAheadCache, StaticCache};
use crate::error::{Error, Result};
use crate::instance::InstanceUri;
use crate::keys::ClientKeys;
use crate::mdx::{metadata_exchange, pb, BufferPool};
use crate::metrics::{
    AuthKind, ConnectorMetrics, DialStatus, MetricRecorder, NullRecorder, RefreshKind,
};
use crate::options::{DialConfig, DialerBuilder, DEFAULT_TCP_KEEPALIVE};
use crate::refresh::{ConnectionInfo, EndpointKind, Refresher};
use crate::stream::{Connection, RawStream};
use crate::token::TokenSource;

/// Port the server-side proxy receives connections on.
pub const SERVER_PROXY_PORT: u16 = 5433;

/// User agent reported to the server-side proxy.
const USER_AGENT: &str = concat!("meridiandb-rs-connector/", env!("CARGO_PKG_VERSION"));

/// Where connection info records come from.
enum InfoSource {
    /// Pre-baked record; the control plane is never contacted.
    Static(ConnectionInfo),
    /// Fetched from the control plane through per-instance caches.
    ControlPlane { refresher: Refresher, lazy: bool },
}

/// A per-instance cache plus its connection accounting.
pub(crate) struct MonitoredCache {
    cache: Box<dyn ConnectionInfoCache>,
    /// Open connections to this instance. Metrics only, never admission
    /// control.
    open_conns: AtomicU64,
    /// True once the cache has produced a record; later dials count as
    /// cache hits.
    primed: AtomicBool,
}

/// Creates authenticated, encrypted connections to MeridianDB instances.
///
/// Construct with [`Dialer::builder`]. A dialer is safe for concurrent use;
/// concurrent dials against the same instance share one cache and therefore
/// one refresh pipeline.
pub struct Dialer {
    cache: RwLock<HashMap<InstanceUri, Arc<MonitoredCache>>>,
    source: InfoSource,
    /// Flips to true exactly once; dials observe it before any other work.
    closed: watch::Sender<bool>,
    default_dial_config: DialConfig,
    dialer_id: String,
    use_iam_authn: bool,
    token_source: Option<Arc<dyn TokenSource>>,
    user_agent: String,
    buffers: BufferPool,
    metrics: Arc<dyn MetricRecorder>,
    built_in_metrics: Option<Arc<ConnectorMetrics>>,
    skip_metadata_exchange: bool,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("dialer_id", &self.dialer_id)
            .field("use_iam_authn", &self.use_iam_authn)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Start configuring a dialer.
    pub fn builder() -> DialerBuilder {
        DialerBuilder::new()
    }

    pub(crate) fn from_builder(builder: DialerBuilder) -> Result<Dialer> {
        if let Some(err) = builder.err {
            return Err(err);
        }
        if builder.iam_authn && builder.opt_out_connection_check {
            return Err(Error::config(
                "iam-authn cannot be combined with opt-out-advanced-connection-check; \
                 the metadata exchange carries the IAM token",
                "n/a",
            ));
        }

        let source = match builder.static_info {
            Some(info) => {
                if info.ip_addrs.is_empty() {
                    return Err(Error::config(
                        "static connection info has no endpoint addresses",
                        info.instance.to_string(),
                    ));
                }
                InfoSource::Static(info)
            }
            None => {
                let client = builder.control_plane.ok_or_else(|| {
                    Error::config(
                        "a control plane client is required unless static connection info \
                         is supplied",
                        "n/a",
                    )
                })?;
                let keys = match builder.signing_key {
                    Some(keys) => keys,
                    None => ClientKeys::default_keys()?,
                };
                let limiter = builder
                    .throttle_control_plane
                    .then(RateLimiter::default_control_plane);
                let kind = if builder.lazy_refresh {
                    RefreshKind::Lazy
                } else {
                    RefreshKind::RefreshAhead
                };
                InfoSource::ControlPlane {
                    refresher: Refresher::new(
                        client,
                        keys,
                        builder.refresh_timeout,
                        limiter,
                        // Placeholder recorder; replaced below once the real
                        // recorder is chosen.
                        Arc::new(NullRecorder),
                        kind,
                    ),
                    lazy: builder.lazy_refresh,
                }
            }
        };

        let (metrics, built_in_metrics): (Arc<dyn MetricRecorder>, Option<Arc<ConnectorMetrics>>) =
            match (builder.metric_recorder, builder.opt_out_built_in_telemetry) {
                (Some(recorder), _) => (recorder, None),
                (None, true) => (Arc::new(NullRecorder), None),
                (None, false) => {
                    let metrics = ConnectorMetrics::shared();
                    (metrics.clone(), Some(metrics))
                }
            };
        let source = match source {
            InfoSource::ControlPlane { refresher, lazy } => InfoSource::ControlPlane {
                refresher: refresher.with_metrics(Arc::clone(&metrics)),
                lazy,
            },
            fixed => fixed,
        };

        let token_source = builder
            .iam_token_source
            .or_else(|| builder.credentials.as_ref().map(|c| c.token_source()));
        if token_source.is_none() && !builder.opt_out_connection_check {
            return Err(Error::config(
                "a token source is required for the metadata exchange; supply \
                 credentials or opt out of the advanced connection check",
                "n/a",
            ));
        }

        let mut user_agent = String::from(USER_AGENT);
        for token in &builder.user_agent_tokens {
            user_agent.push(' ');
            user_agent.push_str(token);
        }

        // The dialer-wide dial function sits underneath the default dial
        // options; one-off and default dial options both take precedence.
        let mut default_dial_config = builder.default_dial_config;
        if default_dial_config.dial_func.is_none() {
            default_dial_config.dial_func = builder.dial_func;
        }

        let (closed, _) = watch::channel(false);
        Ok(Dialer {
            cache: RwLock::new(HashMap::new()),
            source,
            closed,
            default_dial_config,
            dialer_id: Uuid::new_v4().to_string(),
            use_iam_authn: builder.iam_authn,
            token_source,
            user_agent,
            buffers: BufferPool::new(),
            metrics,
            built_in_metrics,
            skip_metadata_exchange: builder.opt_out_connection_check,
        })
    }

    /// The built-in metrics, unless telemetry was opted out or replaced.
    pub fn metrics(&self) -> Option<Arc<ConnectorMetrics>> {
        self.built_in_metrics.clone()
    }

    /// Unique identifier of this dialer, for telemetry correlation.
    pub fn id(&self) -> &str {
        &self.dialer_id
    }

    /// Connect to the instance using the dialer's default dial
    /// configuration.
    ///
    /// `instance` accepts both identifier forms, e.g.
    /// `projects/p/locations/r/clusters/c/instances/i` or `p.r.c.i`.
    pub async fn dial(&self, instance: &str) -> Result<Connection> {
        self.dial_with(instance, DialConfig::new()).await
    }

    /// Connect to the instance with per-dial overrides on top of the
    /// dialer's defaults.
    pub async fn dial_with(&self, instance: &str, cfg: DialConfig) -> Result<Connection> {
        if *self.closed.borrow() {
            return Err(Error::Closed);
        }
        let start = Instant::now();
        let cfg = cfg.merged_over(&self.default_dial_config);
        let iam_authn = cfg.iam_authn.unwrap_or(self.use_iam_authn);
        let auth = if iam_authn {
            AuthKind::Iam
        } else {
            AuthKind::Native
        };

        let uri = match InstanceUri::parse(instance) {
            Ok(uri) => uri,
            Err(err) => {
                self.metrics
                    .record_dial_count(DialStatus::UserError, auth, false);
                return Err(err);
            }
        };

        let entry = self.connection_info_cache(&uri);
        let cache_hit = entry.primed.load(Ordering::Acquire);
        let record = |status: DialStatus| {
            self.metrics.record_dial_count(status, auth, cache_hit);
        };

        let mut info = match entry.cache.connection_info().await {
            Ok(info) => info,
            Err(err) => {
                self.remove_cached(&uri, &entry, &err);
                record(DialStatus::CacheError);
                return Err(err);
            }
        };
        entry.primed.store(true, Ordering::Release);

        // The TLS handshake does not fail on an expired client certificate;
        // the server rejects it at the first read. If the leaf is already
        // past notAfter (say the machine slept through the refresh cycle),
        // rotate now instead of producing a doomed connection.
        if Utc::now() >= info.expiration {
            debug!(instance = %uri, "client certificate expired, refreshing now");
            entry.cache.force_refresh();
            info = match entry.cache.connection_info().await {
                Ok(info) => info,
                Err(err) => {
                    self.remove_cached(&uri, &entry, &err);
                    record(DialStatus::CacheError);
                    return Err(err);
                }
            };
        }

        let endpoint_kind = cfg.endpoint_kind.unwrap_or(EndpointKind::Private);
        let addr = match info.ip_addrs.get(&endpoint_kind) {
            Some(addr) => addr.clone(),
            None => {
                let err = Error::config(
                    format!("instance does not have an address of type \"{endpoint_kind}\""),
                    uri.to_string(),
                );
                self.remove_cached(&uri, &entry, &err);
                record(DialStatus::UserError);
                return Err(err);
            }
        };

        let host_port = format!("{addr}:{SERVER_PROXY_PORT}");
        debug!(instance = %uri, address = %host_port, "dialing");
        let raw = match &cfg.dial_func {
            Some(dial) => dial(&host_port).await,
            None => TcpStream::connect(&host_port).await.map(RawStream::Tcp),
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                debug!(instance = %uri, address = %host_port, error = %err, "dial failed");
                // Stale endpoint info may be the culprit; refresh for the
                // next attempt.
                entry.cache.force_refresh();
                record(DialStatus::TcpError);
                return Err(Error::dial(
                    "failed to dial",
                    uri.to_string(),
                    Error::cause(err),
                ));
            }
        };

        if let RawStream::Tcp(tcp) = &raw {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(cfg.tcp_keepalive.unwrap_or(DEFAULT_TCP_KEEPALIVE));
            if let Err(err) = socket2::SockRef::from(tcp).set_tcp_keepalive(&keepalive) {
                record(DialStatus::TcpError);
                return Err(Error::dial(
                    "failed to set keep-alive",
                    uri.to_string(),
                    Error::cause(err),
                ));
            }
        }

        // The certificate carries the private, public, and PSC addresses as
        // SANs. PSC dials still expect the private address as the server
        // name.
        let server_name_str = if endpoint_kind == EndpointKind::Psc {
            match info.ip_addrs.get(&EndpointKind::Private) {
                Some(private) => private.clone(),
                None => {
                    record(DialStatus::TlsError);
                    return Err(Error::dial(
                        "failed to look up server name for the PSC endpoint",
                        uri.to_string(),
                        None,
                    ));
                }
            }
        } else {
            addr
        };
        let server_name = match ServerName::try_from(server_name_str.clone()) {
            Ok(name) => name,
            Err(err) => {
                record(DialStatus::TlsError);
                return Err(Error::dial(
                    format!("invalid server name {server_name_str:?}"),
                    uri.to_string(),
                    Error::cause(err),
                ));
            }
        };

        let connector = tokio_rustls::TlsConnector::from(Arc::clone(&info.tls));
        let mut tls_stream = match connector.connect(server_name, raw).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(instance = %uri, error = %err, "TLS handshake failed");
                // The handshake may have failed on rotated server material;
                // refresh for the next attempt.
                entry.cache.force_refresh();
                record(DialStatus::TlsError);
                return Err(Error::dial(
                    "TLS handshake failed",
                    uri.to_string(),
                    Error::cause(err),
                ));
            }
        };

        // The metadata exchange happens after the TLS handshake so the
        // token is never sent in the clear.
        if !self.skip_metadata_exchange {
            if let Err(err) = self.metadata_exchange(&mut tls_stream, &uri, iam_authn).await {
                let _ = tls_stream.shutdown().await;
                record(DialStatus::MdxError);
                return Err(err);
            }
        }

        entry.open_conns.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_open_connection(auth);
        record(DialStatus::Success);
        self.metrics
            .record_dial_latency(start.elapsed().as_millis() as u64);

        let on_close = {
            let entry = Arc::clone(&entry);
            Box::new(move || {
                entry.open_conns.fetch_sub(1, Ordering::AcqRel);
            })
        };
        Ok(Connection::new(
            tls_stream,
            Arc::clone(&self.metrics),
            auth,
            on_close,
        ))
    }

    async fn metadata_exchange(
        &self,
        stream: &mut tokio_rustls::client::TlsStream<RawStream>,
        uri: &InstanceUri,
        iam_authn: bool,
    ) -> Result<()> {
        let token_source = self.token_source.as_ref().ok_or_else(|| {
            Error::dial("no token source configured", uri.to_string(), None)
        })?;
        let token = token_source.token().await?;
        let auth_type = if iam_authn {
            pb::AuthType::AutoIam
        } else {
            pb::AuthType::DbNative
        };
        let request = pb::MetadataExchangeRequest {
            user_agent: self.user_agent.clone(),
            auth_type: auth_type as i32,
            oauth2_token: token.secret().to_string(),
        };

        let mut buf = self.buffers.acquire();
        let res = metadata_exchange(stream, &mut buf, request, uri).await;
        self.buffers.release(buf);
        res
    }

    /// Number of open connections to the given instance.
    pub fn open_connections(&self, uri: &InstanceUri) -> u64 {
        let map = self.cache.read().expect("dialer cache lock poisoned");
        map.get(uri)
            .map(|entry| entry.open_conns.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Look up or create the cache entry for an instance. Double-checked so
    /// concurrent dials share one entry, and the write lock is never held
    /// across I/O.
    fn connection_info_cache(&self, uri: &InstanceUri) -> Arc<MonitoredCache> {
        {
            let map = self.cache.read().expect("dialer cache lock poisoned");
            if let Some(entry) = map.get(uri) {
                return Arc::clone(entry);
            }
        }
        let mut map = self.cache.write().expect("dialer cache lock poisoned");
        if let Some(entry) = map.get(uri) {
            return Arc::clone(entry);
        }
        debug!(instance = %uri, "connection info added to cache");
        let cache: Box<dyn ConnectionInfoCache> = match &self.source {
            InfoSource::Static(info) => Box::new(StaticCache::new(info.clone())),
            InfoSource::ControlPlane { refresher, lazy } => {
                let refresher = Arc::new(refresher.clone());
                if *lazy {
                    Box::new(LazyRefreshCache::new(uri.clone(), refresher))
                } else {
                    Box::new(RefreshAheadCache::new(uri.clone(), refresher))
                }
            }
        };
        let entry = Arc::new(MonitoredCache {
            cache,
            open_conns: AtomicU64::new(0),
            primed: AtomicBool::new(false),
        });
        map.insert(uri.clone(), Arc::clone(&entry));
        entry
    }

    /// Stop the entry's background work and drop it from the map, so a
    /// later dial can rebuild it from scratch.
    fn remove_cached(&self, uri: &InstanceUri, entry: &Arc<MonitoredCache>, err: &Error) {
        debug!(instance = %uri, error = %err, "removing connection info from cache");
        let mut map = self.cache.write().expect("dialer cache lock poisoned");
        entry.cache.close();
        map.remove(uri);
    }

    /// Close the dialer: stop every cache's background refresh and fail all
    /// subsequent dials. Idempotent. Connections already handed out remain
    /// usable.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        info!(dialer_id = %self.dialer_id, "dialer closed");
        let map = self.cache.write().expect("dialer cache lock poisoned");
        for entry in map.values() {
            entry.cache.close();
        }
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.close();
    }
}
