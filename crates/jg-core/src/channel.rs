//! The channel-open seam between the SSH transport and the manager
//!
//! The manager and channel connectors never touch the SSH library
//! directly; they consume authenticated channel-open events through the
//! [`ChannelOpen`] trait. The daemon implements it over russh channels,
//! tests implement it over in-memory duplex streams.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream backing an accepted channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelIo for T {}

/// Boxed channel stream handed to the proxy.
pub type BoxedChannelIo = Box<dyn ChannelIo>;

/// Why a channel open was refused.
///
/// Mirrors the SSH open-failure reason codes of RFC 4254 §5.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The channel type is not `direct-tcpip`.
    UnknownChannelType,
    /// Administratively prohibited: bad parameters, or shutting down.
    Prohibited,
    /// The target could not be resolved, reached, or dialled.
    ConnectionFailed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownChannelType => write!(f, "unknown channel type"),
            RejectReason::Prohibited => write!(f, "administratively prohibited"),
            RejectReason::ConnectionFailed => write!(f, "connect failed"),
        }
    }
}

/// An authenticated channel-open event produced by the SSH transport.
///
/// Exactly one of [`accept`](ChannelOpen::accept) or
/// [`reject`](ChannelOpen::reject) is eventually called, by whichever task
/// ends up owning the event.
#[async_trait]
pub trait ChannelOpen: Send + 'static {
    /// SSH channel type, e.g. `direct-tcpip`.
    fn kind(&self) -> &str;

    /// Virtual target address from the channel-open payload.
    fn target(&self) -> &str;

    /// TCP port from the channel-open payload.
    fn port(&self) -> u32;

    /// Accept the channel and expose its byte stream.
    async fn accept(self: Box<Self>) -> io::Result<BoxedChannelIo>;

    /// Refuse the channel. `message` is a human-readable explanation; it
    /// ends up in the server log and, where the transport allows, on the
    /// wire.
    async fn reject(self: Box<Self>, reason: RejectReason, message: &str);
}
