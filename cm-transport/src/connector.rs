//! Connection seam. Production wiring supplies a `Connect` impl that dials
//! a TLS/mTLS socket using credentials from `cm-iam`; tests supply one that
//! hands back one half of an in-memory duplex pipe.

use async_trait::async_trait;
use cm_proto::CmResult;
use tokio::io::{AsyncRead, AsyncWrite};

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxedIo = Box<dyn IoStream>;

#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> CmResult<BoxedIo>;
}

/// `Connect` impl built from an async closure, for tests and simple cases.
pub struct FnConnector<F>(pub F);

#[async_trait]
impl<F, Fut> Connect for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = CmResult<BoxedIo>> + Send,
{
    async fn connect(&self) -> CmResult<BoxedIo> {
        (self.0)().await
    }
}
