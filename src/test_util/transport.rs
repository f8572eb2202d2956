use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use crate::frames::Frame;
use crate::session::SessionTransport;

/// convenience for test code: a localhost address based on a number, the same number generating
///  the same address
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// A transport that records sent frames instead of sending them, for asserting on them in
///  their order
#[derive(Debug)]
pub struct TrackingMockTransport {
    myself: SocketAddr,
    peer: SocketAddr,
    tracker: Arc<RwLock<Vec<Frame>>>,
}

impl TrackingMockTransport {
    pub fn new(myself: SocketAddr, peer: SocketAddr) -> Self {
        TrackingMockTransport {
            myself,
            peer,
            tracker: Default::default(),
        }
    }

    /// Removes the oldest recorded frame and checks it
    pub async fn assert_frame_sent(&self, check: impl FnOnce(&Frame) -> bool) -> Frame {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no frame was sent");
        }
        let frame = lock.remove(0);
        assert!(check(&frame), "unexpected frame {:?}", frame);
        frame
    }

    pub async fn assert_no_remaining_frames(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected frames {:?}", *lock);
    }

    pub async fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.tracker.write().await)
    }
}

#[async_trait]
impl SessionTransport for TrackingMockTransport {
    async fn send_frame(&self, frame: Frame) -> anyhow::Result<()> {
        self.tracker.write().await.push(frame);
        Ok(())
    }

    fn local_address(&self) -> SocketAddr {
        self.myself
    }

    fn remote_address(&self) -> SocketAddr {
        self.peer
    }
}

/// decides whether a frame is lost on its way to the peer
pub type LossFilter = Box<dyn FnMut(&Frame) -> bool + Send>;

/// One end of an in-memory link: frames sent here arrive at the peer end's inbox, unless the loss
///  filter drops them.
pub struct LinkedTransport {
    myself: SocketAddr,
    peer: SocketAddr,
    peer_inbox: mpsc::UnboundedSender<Frame>,
    loss_filter: Mutex<Option<LossFilter>>,
    sent: Mutex<Vec<Frame>>,
}

impl LinkedTransport {
    /// Creates both ends of a link, each with the inbox of frames sent by the other end
    pub fn pair() -> ((Arc<LinkedTransport>, mpsc::UnboundedReceiver<Frame>), (Arc<LinkedTransport>, mpsc::UnboundedReceiver<Frame>)) {
        let addr_a = test_addr_from_number(1);
        let addr_b = test_addr_from_number(2);
        let (to_a, inbox_a) = mpsc::unbounded_channel();
        let (to_b, inbox_b) = mpsc::unbounded_channel();

        let a = Arc::new(LinkedTransport::new(addr_a, addr_b, to_b));
        let b = Arc::new(LinkedTransport::new(addr_b, addr_a, to_a));
        ((a, inbox_a), (b, inbox_b))
    }

    fn new(myself: SocketAddr, peer: SocketAddr, peer_inbox: mpsc::UnboundedSender<Frame>) -> LinkedTransport {
        LinkedTransport {
            myself,
            peer,
            peer_inbox,
            loss_filter: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_loss_filter(&self, filter: LossFilter) {
        *self.loss_filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(filter);
    }

    /// every frame sent through this end, including lost ones
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl SessionTransport for LinkedTransport {
    async fn send_frame(&self, frame: Frame) -> anyhow::Result<()> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(frame.clone());

        let lost = match self.loss_filter.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            Some(filter) => filter(&frame),
            None => false,
        };
        if lost {
            return Ok(());
        }

        self.peer_inbox.send(frame)
            .map_err(|_| anyhow::anyhow!("peer end of the link is closed"))
    }

    fn local_address(&self) -> SocketAddr {
        self.myself
    }

    fn remote_address(&self) -> SocketAddr {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceId;

    fn ack_requested(id: u128) -> Frame {
        Frame::AckRequested { sequence_id: SequenceId::from_u128(id) }
    }

    #[tokio::test]
    async fn test_tracking_transport() {
        let transport = TrackingMockTransport::new(test_addr_from_number(1), test_addr_from_number(2));
        transport.send_frame(ack_requested(1)).await.unwrap();
        transport.send_frame(ack_requested(2)).await.unwrap();

        transport.assert_frame_sent(|f| *f == ack_requested(1)).await;
        transport.assert_frame_sent(|f| *f == ack_requested(2)).await;
        transport.assert_no_remaining_frames().await;
    }

    #[tokio::test]
    async fn test_linked_transport_with_loss() {
        let ((a, _inbox_a), (_b, mut inbox_b)) = LinkedTransport::pair();
        a.set_loss_filter(Box::new(|f| *f == ack_requested(1)));

        a.send_frame(ack_requested(1)).await.unwrap();
        a.send_frame(ack_requested(2)).await.unwrap();

        assert_eq!(inbox_b.recv().await, Some(ack_requested(2)));
        assert!(inbox_b.try_recv().is_err());
        assert_eq!(a.sent_frames().len(), 2);
        assert_eq!(a.remote_address(), test_addr_from_number(2));
    }
}
