//! Connection info retrieval.
//!
//! The [`Refresher`] turns one round of control-plane traffic into an
//! immutable [`ConnectionInfo`] record: it fetches instance metadata and a
//! fresh ephemeral certificate in parallel, parses the PEM material once,
//! and prebuilds the rustls client configuration so that TLS handshakes
//! never touch PEM again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use x509_cert::der::Decode;

use crate::admin::{ControlPlaneClient, RateLimiter, CERT_DURATION};
use crate::error::{Error, Result};
use crate::instance::InstanceUri;
use crate::keys::ClientKeys;
use crate::metrics::{MetricRecorder, RefreshKind};

/// Which of an instance's addresses to dial.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EndpointKind {
    /// The instance's private (VPC) address. The default.
    Private,
    /// The instance's public address.
    Public,
    /// A private-service-connect endpoint.
    Psc,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Private => "PRIVATE",
            EndpointKind::Public => "PUBLIC",
            EndpointKind::Psc => "PSC",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to open a connection to one instance.
///
/// Records are immutable: a refresh produces a new record and the cache
/// swaps it in whole. Cloning is cheap; the certificate material and the
/// prebuilt TLS configuration are shared.
#[derive(Clone)]
pub struct ConnectionInfo {
    /// The instance this record belongs to.
    pub instance: InstanceUri,
    /// Opaque unique identifier reported by the control plane.
    pub instance_uid: String,
    /// Addresses by endpoint kind. Non-empty.
    pub ip_addrs: HashMap<EndpointKind, String>,
    /// The ephemeral client chain, leaf first.
    pub client_chain: Arc<Vec<CertificateDer<'static>>>,
    /// Trust anchors holding exactly the control-plane-supplied CA.
    pub root_cas: Arc<RootCertStore>,
    /// Client TLS configuration built from the chain and trust anchors
    /// (mutual TLS, TLS 1.3 minimum).
    pub tls: Arc<ClientConfig>,
    /// Expiration of the leaf certificate (`notAfter`).
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("instance", &self.instance.to_string())
            .field("instance_uid", &self.instance_uid)
            .field("ip_addrs", &self.ip_addrs)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Fetches connection info from the control plane.
#[derive(Clone)]
pub struct Refresher {
    client: Arc<dyn ControlPlaneClient>,
    keys: Arc<ClientKeys>,
    timeout: Duration,
    limiter: Option<RateLimiter>,
    metrics: Arc<dyn MetricRecorder>,
    kind: RefreshKind,
}

impl Refresher {
    pub(crate) fn new(
        client: Arc<dyn ControlPlaneClient>,
        keys: Arc<ClientKeys>,
        timeout: Duration,
        limiter: Option<RateLimiter>,
        metrics: Arc<dyn MetricRecorder>,
        kind: RefreshKind,
    ) -> Self {
        Refresher {
            client,
            keys,
            timeout,
            limiter,
            metrics,
            kind,
        }
    }

    /// Replace the metric recorder. Used by the dialer once the effective
    /// recorder is known.
    pub(crate) fn with_metrics(mut self, metrics: Arc<dyn MetricRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Perform one refresh, bounded by the configured deadline.
    ///
    /// Records a refresh-count metric tagged with the cache flavor and the
    /// outcome.
    pub(crate) async fn refresh(&self, instance: &InstanceUri) -> Result<ConnectionInfo> {
        let res = match tokio::time::timeout(self.timeout, self.refresh_inner(instance)).await {
            Ok(res) => res,
            Err(_) => Err(Error::refresh(
                format!("refresh did not complete within {:?}", self.timeout),
                instance.to_string(),
                None,
            )),
        };
        match &res {
            Ok(info) => debug!(
                instance = %instance,
                expiration = %info.expiration.to_rfc3339(),
                "refresh complete"
            ),
            Err(err) => debug!(instance = %instance, error = %err, "refresh failed"),
        }
        self.metrics.record_refresh_count(self.kind, res.is_ok());
        res
    }

    async fn refresh_inner(&self, instance: &InstanceUri) -> Result<ConnectionInfo> {
        // Keep forced-refresh loops from taxing the control plane. The wait
        // is bounded by the refresh deadline in `refresh`.
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let (info, certs) = tokio::try_join!(
            self.fetch_metadata(instance),
            self.fetch_ephemeral_cert(instance),
        )?;

        let client_chain = parse_chain(&certs.pem_certificate_chain, instance)?;
        let expiration = leaf_expiration(&client_chain[0], instance)?;
        let root_cas = parse_root(&certs.ca_cert, instance)?;

        let provider = rustls::crypto::ring::default_provider();
        let tls = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| {
                Error::refresh(
                    format!("failed to set TLS protocol versions: {e}"),
                    instance.to_string(),
                    None,
                )
            })?
            .with_root_certificates(Arc::clone(&root_cas))
            .with_client_auth_cert(client_chain.as_ref().clone(), self.keys.private_key_der())
            .map_err(|e| {
                Error::refresh(
                    format!("failed to build client TLS config: {e}"),
                    instance.to_string(),
                    None,
                )
            })?;

        Ok(ConnectionInfo {
            instance: instance.clone(),
            instance_uid: info.instance_uid,
            ip_addrs: info.ip_addrs,
            client_chain,
            root_cas,
            tls: Arc::new(tls),
            expiration,
        })
    }

    async fn fetch_metadata(
        &self,
        instance: &InstanceUri,
    ) -> Result<crate::admin::ConnectionInfoResponse> {
        let info = self
            .client
            .get_connection_info(instance)
            .await
            .map_err(|e| {
                Error::refresh(
                    "failed to get instance metadata",
                    instance.to_string(),
                    Error::cause(e),
                )
            })?;
        if info.ip_addrs.is_empty() {
            return Err(Error::config(
                "instance has no endpoint addresses",
                instance.to_string(),
            ));
        }
        Ok(info)
    }

    async fn fetch_ephemeral_cert(
        &self,
        instance: &InstanceUri,
    ) -> Result<crate::admin::ClientCertificateResponse> {
        let certs = self
            .client
            .generate_client_certificate(
                &instance.parent(),
                self.keys.public_key_pem(),
                CERT_DURATION,
            )
            .await
            .map_err(|e| {
                Error::refresh(
                    "create ephemeral cert failed",
                    instance.to_string(),
                    Error::cause(e),
                )
            })?;
        if certs.pem_certificate_chain.is_empty() {
            return Err(Error::refresh(
                "certificate chain is empty",
                instance.to_string(),
                None,
            ));
        }
        Ok(certs)
    }
}

fn parse_chain(
    pem_chain: &[String],
    instance: &InstanceUri,
) -> Result<Arc<Vec<CertificateDer<'static>>>> {
    let mut chain = Vec::with_capacity(pem_chain.len());
    for pem in pem_chain {
        let mut reader = pem.as_bytes();
        for cert in rustls_pemfile::certs(&mut reader) {
            chain.push(cert.map_err(|e| {
                Error::refresh(
                    "failed to parse client certificate chain",
                    instance.to_string(),
                    Error::cause(e),
                )
            })?);
        }
    }
    if chain.is_empty() {
        return Err(Error::refresh(
            "certificate chain contains no certificates",
            instance.to_string(),
            None,
        ));
    }
    Ok(Arc::new(chain))
}

fn leaf_expiration(
    leaf: &CertificateDer<'static>,
    instance: &InstanceUri,
) -> Result<DateTime<Utc>> {
    let cert = x509_cert::Certificate::from_der(leaf.as_ref()).map_err(|e| {
        Error::refresh(
            "failed to parse leaf certificate",
            instance.to_string(),
            Error::cause(e),
        )
    })?;
    let not_after = cert
        .tbs_certificate
        .validity
        .not_after
        .to_unix_duration();
    DateTime::<Utc>::from_timestamp(not_after.as_secs() as i64, not_after.subsec_nanos()).ok_or_else(
        || {
            Error::refresh(
                "leaf certificate has an unrepresentable expiration",
                instance.to_string(),
                None,
            )
        },
    )
}

fn parse_root(ca_pem: &str, instance: &InstanceUri) -> Result<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    let mut reader = ca_pem.as_bytes();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            Error::refresh(
                "failed to parse CA certificate",
                instance.to_string(),
                Error::cause(e),
            )
        })?;
        store.add(cert).map_err(|e| {
            Error::refresh(
                "failed to add CA certificate to trust store",
                instance.to_string(),
                Error::cause(e),
            )
        })?;
    }
    if store.is_empty() {
        return Err(Error::refresh(
            "control plane returned no CA certificate",
            instance.to_string(),
            None,
        ));
    }
    Ok(Arc::new(store))
}
