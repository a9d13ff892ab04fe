//! Dialer configuration.
//!
//! [`DialerBuilder`] collects construction options and validates their
//! mutual-exclusion rules; [`DialConfig`] carries the per-dial overrides.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::admin::ControlPlaneClient;
use crate::error::{Error, Result};
use crate::keys::ClientKeys;
use crate::metrics::MetricRecorder;
use crate::refresh::{ConnectionInfo, EndpointKind};
use crate::stream::RawStream;
use crate::token::{token_source_from_json, TokenSource};

/// Default per-refresh deadline.
pub(crate) const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Default TCP keep-alive period for dialed connections.
pub(crate) const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Future returned by a custom dial function.
pub type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<RawStream>> + Send>>;

/// Replacement for the built-in TCP dial primitive. Receives the
/// `host:port` the dialer would connect to.
pub type DialFunc = Arc<dyn Fn(&str) -> DialFuture + Send + Sync>;

/// Pre-resolved credentials for control-plane auth and, absent an explicit
/// IAM token source, the metadata exchange.
///
/// Credential discovery and refresh are out of scope for the connector, so
/// only token-bearing documents are accepted; anything richer should be
/// adapted into a [`TokenSource`] by the embedding application.
#[derive(Clone)]
pub struct Credentials {
    token_source: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Credentials {
    /// Wrap an existing token source.
    pub fn from_token_source(source: Arc<dyn TokenSource>) -> Self {
        Credentials {
            token_source: source,
        }
    }

    /// Parse a credentials JSON document.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        Ok(Credentials {
            token_source: token_source_from_json(json)?,
        })
    }

    /// Read and parse a credentials JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(|e| {
            Error::config(
                format!("failed to read credentials file {:?}: {e}", path.as_ref()),
                "n/a",
            )
        })?;
        Credentials::from_json(&bytes)
    }

    pub(crate) fn token_source(&self) -> Arc<dyn TokenSource> {
        Arc::clone(&self.token_source)
    }
}

/// Per-dial configuration.
///
/// A dialer carries one as its default (see
/// [`DialerBuilder::default_dial_config`]); individual
/// [`dial_with`](crate::Dialer::dial_with) calls may override it.
#[derive(Clone, Default)]
pub struct DialConfig {
    pub(crate) endpoint_kind: Option<EndpointKind>,
    pub(crate) tcp_keepalive: Option<Duration>,
    pub(crate) dial_func: Option<DialFunc>,
    pub(crate) iam_authn: Option<bool>,
}

impl DialConfig {
    pub fn new() -> Self {
        DialConfig::default()
    }

    /// Which of the instance's addresses to dial. Defaults to
    /// [`EndpointKind::Private`].
    pub fn endpoint_kind(mut self, kind: EndpointKind) -> Self {
        self.endpoint_kind = Some(kind);
        self
    }

    /// TCP keep-alive period for the connection. Defaults to 30 seconds.
    pub fn tcp_keepalive(mut self, period: Duration) -> Self {
        self.tcp_keepalive = Some(period);
        self
    }

    /// One-off dial function for this dial only.
    pub fn dial_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> DialFuture + Send + Sync + 'static,
    {
        self.dial_func = Some(Arc::new(f));
        self
    }

    /// Override the dialer-level IAM authentication setting for this dial.
    pub fn iam_authn(mut self, enabled: bool) -> Self {
        self.iam_authn = Some(enabled);
        self
    }

    /// Later settings win; unset fields fall through to `base`.
    pub(crate) fn merged_over(self, base: &DialConfig) -> DialConfig {
        DialConfig {
            endpoint_kind: self.endpoint_kind.or(base.endpoint_kind),
            tcp_keepalive: self.tcp_keepalive.or(base.tcp_keepalive),
            dial_func: self.dial_func.or_else(|| base.dial_func.clone()),
            iam_authn: self.iam_authn.or(base.iam_authn),
        }
    }
}

/// Builder for [`Dialer`](crate::Dialer).
///
/// ```no_run
/// # use std::sync::Arc;
/// # use meridiandb_connector::{Dialer, StaticTokenSource};
/// # fn control_plane() -> Arc<dyn meridiandb_connector::ControlPlaneClient> { unimplemented!() }
/// let dialer = Dialer::builder()
///     .control_plane_client(control_plane())
///     .token_source(Arc::new(StaticTokenSource::new("token")))
///     .build()?;
/// # Ok::<(), meridiandb_connector::Error>(())
/// ```
pub struct DialerBuilder {
    pub(crate) control_plane: Option<Arc<dyn ControlPlaneClient>>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) iam_token_source: Option<Arc<dyn TokenSource>>,
    pub(crate) iam_authn: bool,
    pub(crate) signing_key: Option<Arc<ClientKeys>>,
    pub(crate) refresh_timeout: Duration,
    pub(crate) lazy_refresh: bool,
    pub(crate) default_dial_config: DialConfig,
    pub(crate) dial_func: Option<DialFunc>,
    pub(crate) user_agent_tokens: Vec<String>,
    pub(crate) metric_recorder: Option<Arc<dyn MetricRecorder>>,
    pub(crate) opt_out_built_in_telemetry: bool,
    pub(crate) opt_out_connection_check: bool,
    pub(crate) static_info: Option<ConnectionInfo>,
    pub(crate) throttle_control_plane: bool,
    pub(crate) err: Option<Error>,
}

impl Default for DialerBuilder {
    fn default() -> Self {
        DialerBuilder {
            control_plane: None,
            credentials: None,
            iam_token_source: None,
            iam_authn: false,
            signing_key: None,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            lazy_refresh: false,
            default_dial_config: DialConfig::default(),
            dial_func: None,
            user_agent_tokens: Vec::new(),
            metric_recorder: None,
            opt_out_built_in_telemetry: false,
            opt_out_connection_check: false,
            static_info: None,
            throttle_control_plane: true,
            err: None,
        }
    }
}

impl DialerBuilder {
    pub fn new() -> Self {
        DialerBuilder::default()
    }

    /// The control-plane client used for endpoint discovery and certificate
    /// issuance. Required unless static connection info is supplied.
    ///
    /// Transport concerns (admin endpoint, HTTP client) belong to the
    /// injected implementation.
    pub fn control_plane_client(mut self, client: Arc<dyn ControlPlaneClient>) -> Self {
        self.control_plane = Some(client);
        self
    }

    /// Use a credentials JSON file as the base for authentication.
    ///
    /// Mutually exclusive with the other credentials options.
    pub fn credentials_file(mut self, path: impl AsRef<Path>) -> Self {
        match Credentials::from_file(path) {
            Ok(creds) => self.set_credentials(creds),
            Err(err) => self.record_err(err),
        }
        self
    }

    /// Use an in-memory credentials JSON document as the base for
    /// authentication.
    ///
    /// Mutually exclusive with the other credentials options.
    pub fn credentials_json(mut self, json: &[u8]) -> Self {
        match Credentials::from_json(json) {
            Ok(creds) => self.set_credentials(creds),
            Err(err) => self.record_err(err),
        }
        self
    }

    /// Use an OAuth2 token source as the base for authentication.
    ///
    /// Mutually exclusive with the other credentials options.
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.set_credentials(Credentials::from_token_source(source));
        self
    }

    /// Use pre-resolved credentials as the base for authentication.
    ///
    /// Mutually exclusive with the other credentials options.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.set_credentials(credentials);
        self
    }

    fn set_credentials(&mut self, credentials: Credentials) {
        if self.credentials.is_some() {
            self.record_err(Error::config(
                "credentials-file, credentials-json, token-source, and credentials \
                 are mutually exclusive",
                "n/a",
            ));
            return;
        }
        self.credentials = Some(credentials);
    }

    /// The first recorded option error wins; `build` surfaces it.
    fn record_err(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Token source used for the metadata exchange, independent of
    /// control-plane auth.
    pub fn iam_authn_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.iam_token_source = Some(source);
        self
    }

    /// Select automatic IAM authentication instead of database-native
    /// authentication in the metadata exchange.
    pub fn iam_authn(mut self) -> Self {
        self.iam_authn = true;
        self
    }

    /// Inject the RSA keypair used to request client certificates. Without
    /// this, a 2048-bit keypair is generated once per process.
    pub fn signing_key(mut self, keys: Arc<ClientKeys>) -> Self {
        self.signing_key = Some(keys);
        self
    }

    /// Deadline for each refresh operation. Defaults to 60 seconds.
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Use the lazy cache variant: certificates are rotated synchronously
    /// when a connection attempt needs a fresh one, instead of ahead of time
    /// in the background.
    pub fn lazy_refresh(mut self) -> Self {
        self.lazy_refresh = true;
        self
    }

    /// Dial options applied to every `dial` call.
    pub fn default_dial_config(mut self, cfg: DialConfig) -> Self {
        self.default_dial_config = cfg;
        self
    }

    /// Replace the TCP dial primitive for all dials.
    pub fn dial_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> DialFuture + Send + Sync + 'static,
    {
        self.dial_func = Some(Arc::new(f));
        self
    }

    /// Append a token to the connector's user-agent string.
    pub fn user_agent_token(mut self, token: impl Into<String>) -> Self {
        self.user_agent_tokens.push(token.into());
        self
    }

    /// Report metrics to the given recorder instead of the built-in one.
    pub fn metric_recorder(mut self, recorder: Arc<dyn MetricRecorder>) -> Self {
        self.metric_recorder = Some(recorder);
        self
    }

    /// Disable the built-in metric pipeline. Without a custom recorder, all
    /// signals are dropped.
    pub fn opt_out_built_in_telemetry(mut self) -> Self {
        self.opt_out_built_in_telemetry = true;
        self
    }

    /// Skip the post-handshake metadata exchange. Transitional; incompatible
    /// with IAM authentication.
    pub fn opt_out_advanced_connection_check(mut self) -> Self {
        self.opt_out_connection_check = true;
        self
    }

    /// Serve a fixed, pre-baked connection info record and never contact the
    /// control plane. Development only: the certificate will expire and no
    /// refresh will rescue it.
    pub fn static_connection_info(mut self, info: ConnectionInfo) -> Self {
        self.static_info = Some(info);
        self
    }

    /// Disable the client-side control-plane rate limit. Intended for tests
    /// that drive many refreshes against a fake control plane.
    pub fn allow_unthrottled_control_plane(mut self) -> Self {
        self.throttle_control_plane = false;
        self
    }

    /// Validate the collected options and construct the dialer.
    pub fn build(self) -> Result<crate::dialer::Dialer> {
        crate::dialer::Dialer::from_builder(self)
    }
}
