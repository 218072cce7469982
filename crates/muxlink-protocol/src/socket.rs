//! The framed-socket collaborator trait.

use std::future::Future;

use crate::error::SocketError;

/// A transport that delivers discrete binary frames atomically; conceptually
/// one WebSocket. The connection is the only consumer: it serializes its own
/// receives, and submitted frames go out in submission order.
///
/// Production bindings wrap a real socket; tests use [`crate::sim`].
pub trait FramedSocket: Send + Sync + 'static {
    /// Receive one frame into `buf`, returning the number of bytes written.
    ///
    /// A frame larger than `buf` must yield [`SocketError::FrameTooLarge`]
    /// and a non-binary frame [`SocketError::NotBinary`]; both are fatal to
    /// the connection. [`SocketError::Closing`] reports an orderly close.
    fn receive_frame(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, SocketError>> + Send;

    /// Submit one binary frame. May complete before the frame is on the
    /// wire; failures are swallowed (the next receive observes the close).
    fn send_frame(&self, frame: &[u8]) -> impl Future<Output = ()> + Send;

    /// Initiate close. Idempotent; `wait_for_remote` asks the binding to
    /// wait for the peer's close handshake where the transport has one.
    fn close(&self, reason: &str, wait_for_remote: bool) -> impl Future<Output = ()> + Send;
}
