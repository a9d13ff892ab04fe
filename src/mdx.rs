//! Metadata exchange.
//!
//! Immediately after the TLS handshake, and before any database bytes flow,
//! the connector and the server-side proxy exchange one framed protobuf
//! message in each direction. The request authenticates the caller with an
//! OAuth2 token and selects the authentication mode; a non-OK response
//! aborts the dial.
//!
//! Framing in both directions is a 4-byte big-endian unsigned length
//! followed by that many bytes of protobuf payload. The length does not
//! include the 4 bytes themselves. Each read and each write is bounded by a
//! 30 second deadline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::instance::InstanceUri;

/// Maximum size of a metadata exchange frame, including the length prefix.
pub(crate) const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Deadline applied to each read and each write on the socket.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire messages for the metadata exchange.
pub mod pb {
    /// Authentication mode requested by the client.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum AuthType {
        Unspecified = 0,
        /// Database-native authentication.
        DbNative = 1,
        /// Automatic IAM authentication using the carried OAuth2 token.
        AutoIam = 2,
    }

    /// Server verdict on the exchange.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ResponseCode {
        Unspecified = 0,
        Ok = 1,
        Error = 2,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetadataExchangeRequest {
        #[prost(string, tag = "1")]
        pub user_agent: ::prost::alloc::string::String,
        #[prost(enumeration = "AuthType", tag = "2")]
        pub auth_type: i32,
        #[prost(string, tag = "3")]
        pub oauth2_token: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetadataExchangeResponse {
        #[prost(enumeration = "ResponseCode", tag = "1")]
        pub response_code: i32,
        #[prost(string, tag = "2")]
        pub error: ::prost::alloc::string::String,
    }
}

/// Perform the metadata exchange on a freshly established TLS stream.
///
/// `buf` stages both frames; it is drawn from the dialer's pool so repeated
/// dials do not allocate.
pub(crate) async fn metadata_exchange<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    request: pb::MetadataExchangeRequest,
    instance: &InstanceUri,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = request.encoded_len();
    if 4 + len > MAX_MESSAGE_SIZE {
        return Err(Error::dial(
            "metadata exchange request exceeds the maximum frame size",
            instance.to_string(),
            None,
        ));
    }
    buf.clear();
    buf.put_u32(len as u32);
    request.encode(buf).map_err(|e| {
        Error::dial(
            "failed to encode metadata exchange request",
            instance.to_string(),
            Error::cause(e),
        )
    })?;

    match timeout(IO_TIMEOUT, stream.write_all(&buf[..])).await {
        Err(_) => {
            return Err(Error::dial(
                "metadata exchange write timed out",
                instance.to_string(),
                None,
            ))
        }
        Ok(res) => res.map_err(|e| {
            Error::dial(
                "failed to write metadata exchange request",
                instance.to_string(),
                Error::cause(e),
            )
        })?,
    }

    let mut len_bytes = [0u8; 4];
    match timeout(IO_TIMEOUT, stream.read_exact(&mut len_bytes)).await {
        Err(_) => {
            return Err(Error::dial(
                "metadata exchange read timed out",
                instance.to_string(),
                None,
            ))
        }
        Ok(res) => {
            res.map_err(|e| {
                Error::dial(
                    "failed to read metadata exchange response",
                    instance.to_string(),
                    Error::cause(e),
                )
            })?;
        }
    }
    let resp_len = u32::from_be_bytes(len_bytes) as usize;
    if resp_len > MAX_MESSAGE_SIZE {
        return Err(Error::dial(
            format!("metadata exchange response of {resp_len} bytes exceeds the maximum frame size"),
            instance.to_string(),
            None,
        ));
    }

    buf.clear();
    buf.resize(resp_len, 0);
    match timeout(IO_TIMEOUT, stream.read_exact(&mut buf[..resp_len])).await {
        Err(_) => {
            return Err(Error::dial(
                "metadata exchange read timed out",
                instance.to_string(),
                None,
            ))
        }
        Ok(res) => {
            res.map_err(|e| {
                Error::dial(
                    "failed to read metadata exchange response",
                    instance.to_string(),
                    Error::cause(e),
                )
            })?;
        }
    }

    let response = pb::MetadataExchangeResponse::decode(&buf[..resp_len]).map_err(|e| {
        Error::dial(
            "failed to decode metadata exchange response",
            instance.to_string(),
            Error::cause(e),
        )
    })?;
    if response.response_code() != pb::ResponseCode::Ok {
        return Err(Error::dial(
            format!("metadata exchange failed: {}", response.error),
            instance.to_string(),
            None,
        ));
    }
    Ok(())
}

/// Pool of reusable frame buffers, one dialer each.
///
/// Only the frame header region is rewritten between uses; the payload area
/// is overwritten by the next encode.
pub(crate) struct BufferPool {
    buffers: Mutex<VecDeque<BytesMut>>,
}

/// Buffers kept per pool. Dials beyond this run with a fresh allocation.
const MAX_POOLED: usize = 8;

impl BufferPool {
    pub(crate) fn new() -> Self {
        BufferPool {
            buffers: Mutex::new(VecDeque::with_capacity(MAX_POOLED)),
        }
    }

    pub(crate) fn acquire(&self) -> BytesMut {
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        buffers
            .pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_MESSAGE_SIZE))
    }

    pub(crate) fn release(&self, mut buf: BytesMut) {
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        if buffers.len() >= MAX_POOLED {
            return;
        }
        buf.clear();
        buffers.push_back(buf);
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
