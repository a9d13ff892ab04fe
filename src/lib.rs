//! meridiandb-connector - Secure connection broker for MeridianDB instances
//!
//! This library turns a MeridianDB instance identifier into an
//! authenticated, mutually-TLS-encrypted byte stream to the instance's
//! server-side proxy, ready for a database driver to speak the wire
//! protocol over. It takes care of:
//! - discovering the instance's current network endpoints
//! - obtaining and rotating short-lived client certificates from the
//!   control plane, ahead of expiry by default or lazily on request
//! - the post-handshake metadata exchange that authenticates the caller
//!   and selects the authentication mode
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! use meridiandb_connector::{Dialer, StaticTokenSource};
//! # fn control_plane() -> Arc<dyn meridiandb_connector::ControlPlaneClient> { unimplemented!() }
//!
//! # async fn example() -> Result<(), meridiandb_connector::Error> {
//! let dialer = Dialer::builder()
//!     .control_plane_client(control_plane())
//!     .token_source(Arc::new(StaticTokenSource::new("oauth2-token")))
//!     .build()?;
//!
//! let conn = dialer
//!     .dial("projects/p/locations/r/clusters/c/instances/i")
//!     .await?;
//! // conn implements AsyncRead + AsyncWrite; hand it to the database driver.
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod logging;

pub mod admin;
pub mod cache;
pub mod dialer;
pub mod error;
pub mod instance;
pub mod keys;
pub mod mdx;
pub mod metrics;
pub mod options;
pub mod refresh;
pub mod stream;
pub mod token;

pub use admin::{ClientCertificateResponse, ConnectionInfoResponse, ControlPlaneClient};
pub use dialer::{Dialer, SERVER_PROXY_PORT};
pub use error::{Error, Result};
pub use instance::InstanceUri;
pub use keys::ClientKeys;
pub use metrics::{AuthKind, ConnectorMetrics, DialStatus, MetricRecorder, MetricsSnapshot};
pub use options::{Credentials, DialConfig, DialFunc, DialFuture, DialerBuilder};
pub use refresh::{ConnectionInfo, EndpointKind};
pub use stream::{Connection, RawStream};
pub use token::{AccessToken, StaticTokenSource, TokenSource};
