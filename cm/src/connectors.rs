//! Dialers for the three outbound streams (cloud, IAM, each SM). The actual
//! TLS/mTLS session and the PKCS#11-backed credential material behind it
//! are out of scope; `TlsCredentials` is the seam a production
//! build would fill with a concrete `tokio-rustls` connector that reloads
//! its client config on `cm_iam::IamClient`'s `OnCertChanged` callback
//!. `TcpConnector`
//! dials the plain socket beneath wherever that TLS layer would sit, so the
//! rest of the daemon is already wired against the real seam.

use async_trait::async_trait;
use cm_proto::{CmError, CmResult, ErrorKind};
use cm_transport::{BoxedIo, Connect};
use tokio::net::TcpStream;

/// Supplies the current client credentials for a TLS dialer. No concrete
/// implementation ships here; a
/// production build wires this to the certificate IAM issues via
/// `cm_iam::IamClient::call(IamRequest::GetCert { .. })`.
pub trait TlsCredentials: Send + Sync {
    fn client_config(&self) -> CmResult<Vec<u8>>;
}

/// Dials a plain TCP socket. Used directly before provisioning (no identity
/// to present yet) and as the transport `tokio-rustls` would wrap once
/// `TlsCredentials` is implemented.
pub struct TcpConnector {
    pub addr: String,
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self) -> CmResult<BoxedIo> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| CmError::wrap(ErrorKind::Failed, format!("dialing {}", self.addr), e))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
