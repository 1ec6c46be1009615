//! Connection fabric shared by the Cloud Transport and SM Channel: message framing, reconnect/backoff, and the `Connect` seam
//! production code fills in with a TLS/mTLS dialer.

pub mod backoff;
pub mod cloud;
pub mod connector;
pub mod framing;
pub mod sm;

pub use backoff::Backoff;
pub use cloud::{CloudTransport, ConnectionEvent as CloudConnectionEvent, NodeInfoSource};
pub use connector::{BoxedIo, Connect, FnConnector, IoStream};
pub use framing::FramedStream;
pub use sm::{ConnectionEvent as SmConnectionEvent, SmChannel};
