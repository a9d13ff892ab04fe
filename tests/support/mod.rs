//! Shared fixtures for the end-to-end tests: a certificate authority, a fake
//! control plane, and a fake server-side proxy that terminates TLS and
//! performs the metadata exchange.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use meridiandb_connector::mdx::pb;
use meridiandb_connector::{
    ClientCertificateResponse, ClientKeys, ConnectionInfoResponse, ControlPlaneClient, EndpointKind,
    Error, InstanceUri, Result,
};

/// The RSA signing keypair shared by every test, generated once. Tests
/// inject it into the dialer, and the fake control plane uses the same key
/// to issue matching leaf certificates.
pub fn shared_keys() -> (Arc<ClientKeys>, &'static [u8]) {
    static KEYS: OnceLock<(Arc<ClientKeys>, Vec<u8>)> = OnceLock::new();
    let (keys, der) = KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).expect("RSA generation");
        let client_keys = Arc::new(ClientKeys::from_private_key(&key).expect("key encoding"));
        let pkcs8 = key.to_pkcs8_der().expect("pkcs8").as_bytes().to_vec();
        (client_keys, pkcs8)
    });
    (Arc::clone(keys), der)
}

/// Three-tier test CA: a root that anchors trust, an intermediate that signs
/// client leaves, and a server certificate for 127.0.0.1 signed by the root.
pub struct TestCa {
    root_cert: Certificate,
    root_key: KeyPair,
    signing_cert: Certificate,
    signing_key: KeyPair,
    server_cert: Certificate,
    server_key: KeyPair,
}

impl TestCa {
    pub fn new() -> Self {
        let root_key = KeyPair::generate().expect("root key");
        let mut root_params = CertificateParams::new(Vec::new()).expect("root params");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params
            .distinguished_name
            .push(DnType::CommonName, "root.meridiandb.test");
        let root_cert = root_params.self_signed(&root_key).expect("root cert");

        let signing_key = KeyPair::generate().expect("signing key");
        let mut signing_params = CertificateParams::new(Vec::new()).expect("signing params");
        signing_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        signing_params
            .distinguished_name
            .push(DnType::CommonName, "client.meridiandb.test");
        let signing_cert = signing_params
            .signed_by(&signing_key, &root_cert, &root_key)
            .expect("signing cert");

        let server_key = KeyPair::generate().expect("server key");
        let mut server_params =
            CertificateParams::new(vec!["127.0.0.1".to_string()]).expect("server params");
        server_params
            .distinguished_name
            .push(DnType::CommonName, "server.meridiandb.test");
        server_params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        let server_cert = server_params
            .signed_by(&server_key, &root_cert, &root_key)
            .expect("server cert");

        TestCa {
            root_cert,
            root_key,
            signing_cert,
            signing_key,
            server_cert,
            server_key,
        }
    }

    pub fn root_pem(&self) -> String {
        self.root_cert.pem()
    }

    /// Issue a client leaf for the shared RSA key, expiring at `not_after`.
    pub fn issue_client_cert(&self, not_after: time::OffsetDateTime) -> String {
        let (_, pkcs8) = shared_keys();
        let client_key = KeyPair::try_from(pkcs8).expect("client key import");
        let mut params = CertificateParams::new(Vec::new()).expect("leaf params");
        params
            .distinguished_name
            .push(DnType::CommonName, "meridiandb-client");
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
        params.not_after = not_after;
        params
            .signed_by(&client_key, &self.signing_cert, &self.signing_key)
            .expect("leaf cert")
            .pem()
    }

    pub fn signing_pem(&self) -> String {
        self.signing_cert.pem()
    }

    fn server_tls_config(&self) -> Arc<ServerConfig> {
        let provider = rustls::crypto::ring::default_provider();
        let mut roots = RootCertStore::empty();
        roots
            .add(self.root_cert.der().clone())
            .expect("root into store");
        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(provider.clone()),
        )
        .build()
        .expect("client verifier");
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.server_key.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("tls13")
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.server_cert.der().clone()], key)
            .expect("server cert");
        Arc::new(config)
    }
}

/// What the fake control plane does for one certificate request.
#[derive(Clone)]
pub enum CertAction {
    /// Issue a leaf expiring the given number of seconds from now
    /// (negative for an already-expired leaf).
    Issue(i64),
    /// Fail the call.
    Fail(&'static str),
    /// Never complete (a stalled control plane).
    Hang,
}

/// In-memory control plane. Thread-safe; scripts certificate issuance
/// per-call and falls back to `default_action` when the script is empty.
pub struct FakeControlPlane {
    ca: Arc<TestCa>,
    ip_addrs: HashMap<EndpointKind, String>,
    script: Mutex<VecDeque<CertAction>>,
    default_action: CertAction,
    info_calls: AtomicUsize,
    cert_calls: AtomicUsize,
    seen_parents: Mutex<Vec<String>>,
    seen_public_keys: Mutex<Vec<String>>,
}

impl FakeControlPlane {
    pub fn new(ca: Arc<TestCa>, ip_addrs: HashMap<EndpointKind, String>) -> Self {
        FakeControlPlane {
            ca,
            ip_addrs,
            script: Mutex::new(VecDeque::new()),
            default_action: CertAction::Issue(24 * 3600),
            info_calls: AtomicUsize::new(0),
            cert_calls: AtomicUsize::new(0),
            seen_parents: Mutex::new(Vec::new()),
            seen_public_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn private_only(ca: Arc<TestCa>) -> Self {
        FakeControlPlane::new(
            ca,
            HashMap::from([(EndpointKind::Private, "127.0.0.1".to_string())]),
        )
    }

    pub fn with_script(mut self, script: Vec<CertAction>) -> Self {
        self.script = Mutex::new(script.into());
        self
    }

    pub fn with_default_action(mut self, action: CertAction) -> Self {
        self.default_action = action;
        self
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn cert_calls(&self) -> usize {
        self.cert_calls.load(Ordering::SeqCst)
    }

    pub fn seen_parents(&self) -> Vec<String> {
        self.seen_parents.lock().unwrap().clone()
    }

    pub fn seen_public_keys(&self) -> Vec<String> {
        self.seen_public_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlaneClient for FakeControlPlane {
    async fn get_connection_info(&self, _instance: &InstanceUri) -> Result<ConnectionInfoResponse> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectionInfoResponse {
            ip_addrs: self.ip_addrs.clone(),
            instance_uid: "00000000-0000-0000-0000-000000000000".to_string(),
        })
    }

    async fn generate_client_certificate(
        &self,
        parent: &str,
        public_key_pem: &str,
        duration: Duration,
    ) -> Result<ClientCertificateResponse> {
        self.cert_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_parents.lock().unwrap().push(parent.to_string());
        self.seen_public_keys
            .lock()
            .unwrap()
            .push(public_key_pem.to_string());

        let action = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_action.clone());
        let ttl_secs = match action {
            CertAction::Issue(ttl_secs) => ttl_secs,
            CertAction::Fail(message) => {
                return Err(Error::Refresh {
                    message: message.to_string(),
                    instance: "fake".to_string(),
                    source: None,
                })
            }
            CertAction::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        // The requested duration is honored only when the script does not
        // override it; the contract fixes it at one hour.
        let _ = duration;
        let not_after = time::OffsetDateTime::now_utc() + time::Duration::seconds(ttl_secs);
        Ok(ClientCertificateResponse {
            pem_certificate_chain: vec![self.ca.issue_client_cert(not_after), self.ca.signing_pem()],
            ca_cert: self.ca.root_pem(),
        })
    }
}

/// How the fake proxy treats the metadata exchange.
#[derive(Clone)]
pub enum ProxyBehavior {
    /// Respond OK, then write `payload` and shut down cleanly.
    Ok { payload: Vec<u8> },
    /// Respond with an error message, then close.
    MdxError(String),
    /// Skip the metadata exchange: write `payload` right after the
    /// handshake (for dialers that opted out of the connection check).
    NoExchange { payload: Vec<u8> },
}

/// A running fake server-side proxy.
pub struct FakeProxy {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<pb::MetadataExchangeRequest>>>,
    handle: JoinHandle<()>,
}

impl FakeProxy {
    /// Accept loop on an ephemeral localhost port: TLS 1.3 with mandatory
    /// client certificates, then the metadata exchange per `behavior`.
    pub async fn start(ca: &TestCa, behavior: ProxyBehavior) -> FakeProxy {
        let config = ca.server_tls_config();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let requests: Arc<Mutex<Vec<pb::MetadataExchangeRequest>>> =
            Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            let acceptor = tokio_rustls::TlsAcceptor::from(config);
            loop {
                let Ok((tcp, _peer)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let behavior = behavior.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(tcp).await else {
                        return;
                    };
                    match behavior {
                        ProxyBehavior::Ok { payload } => {
                            let Some(request) = read_exchange(&mut stream).await else {
                                return;
                            };
                            seen.lock().unwrap().push(request);
                            if write_exchange_response(&mut stream, pb::ResponseCode::Ok, "")
                                .await
                                .is_err()
                            {
                                return;
                            }
                            if stream.write_all(&payload).await.is_err() {
                                return;
                            }
                            let _ = stream.flush().await;
                            // Hold the connection open until the client
                            // closes, so client-side shutdown is clean.
                            drain(&mut stream).await;
                        }
                        ProxyBehavior::MdxError(message) => {
                            let Some(request) = read_exchange(&mut stream).await else {
                                return;
                            };
                            seen.lock().unwrap().push(request);
                            let _ = write_exchange_response(
                                &mut stream,
                                pb::ResponseCode::Error,
                                &message,
                            )
                            .await;
                            let _ = stream.shutdown().await;
                        }
                        ProxyBehavior::NoExchange { payload } => {
                            if stream.write_all(&payload).await.is_err() {
                                return;
                            }
                            let _ = stream.flush().await;
                            drain(&mut stream).await;
                        }
                    }
                });
            }
        });

        FakeProxy {
            addr,
            requests,
            handle,
        }
    }

    /// Metadata exchange requests the proxy has accepted.
    pub fn requests(&self) -> Vec<pb::MetadataExchangeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Read and discard until the peer closes.
async fn drain<S>(stream: &mut S)
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut sink = [0u8; 1024];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn read_exchange<S>(stream: &mut S) -> Option<pb::MetadataExchangeRequest>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    pb::MetadataExchangeRequest::decode(&payload[..]).ok()
}

async fn write_exchange_response<S>(
    stream: &mut S,
    code: pb::ResponseCode,
    error: &str,
) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let response = pb::MetadataExchangeResponse {
        response_code: code as i32,
        error: error.to_string(),
    };
    let mut frame = Vec::with_capacity(4 + response.encoded_len());
    frame.extend_from_slice(&(response.encoded_len() as u32).to_be_bytes());
    response.encode(&mut frame).expect("encode response");
    stream.write_all(&frame).await?;
    stream.flush().await
}
