use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::frames::Frame;

/// This is the abstraction of the transport a session sends its frames through. Inbound frames
///  travel the other way: the transport (or whatever demultiplexes its traffic) pushes them into
///  the session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    async fn send_frame(&self, frame: Frame) -> anyhow::Result<()>;

    fn local_address(&self) -> SocketAddr;

    fn remote_address(&self) -> SocketAddr;
}
