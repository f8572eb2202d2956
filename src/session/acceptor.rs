use std::sync::{Arc, Weak};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};
use crate::config::ReliableSessionConfig;
use crate::frames::{CreateId, CreateSequence, CreateSequenceAccepted, Frame, RefusalReason};
use crate::sequence::SequenceId;
use crate::session::session::Session;
use crate::session::state::SessionKind;
use crate::session::transport::SessionTransport;

#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(Session),
    /// the CreateSequence was seen before, and its response was sent again
    Retransmission,
    Refused(RefusalReason),
}

struct AcceptedSequence {
    offer: SequenceId,
    response: Frame,
    session: Session,
}

/// The responding side of session creation: accepts or refuses CreateSequence requests arriving
///  through one transport, and answers retransmitted requests with the original response.
pub struct SequenceAcceptor {
    config: Arc<ReliableSessionConfig>,
    kind: SessionKind,
    transport: Weak<dyn SessionTransport>,
    accepted: FxHashMap<CreateId, AcceptedSequence>,
}

impl SequenceAcceptor {
    pub fn new(config: Arc<ReliableSessionConfig>, kind: SessionKind, transport: Weak<dyn SessionTransport>) -> anyhow::Result<SequenceAcceptor> {
        config.validate()?;

        Ok(SequenceAcceptor {
            config,
            kind,
            transport,
            accepted: FxHashMap::default(),
        })
    }

    /// number of accepted sessions that did not reach a terminal state yet
    pub fn num_active_sessions(&self) -> usize {
        self.accepted.values()
            .filter(|a| a.session.outcome().is_none())
            .count()
    }

    /// the accepted session whose input sequence has the given id, for routing inbound frames
    pub fn session_for(&self, input_id: SequenceId) -> Option<Session> {
        self.accepted.values()
            .find(|a| a.session.input_sequence_id() == input_id)
            .map(|a| a.session.clone())
    }

    pub async fn on_create_sequence(&mut self, create: CreateSequence) -> AcceptOutcome {
        let create_id = create.create_id;
        if let Some(accepted) = self.accepted.get(&create_id) {
            debug!("retransmitted CreateSequence {:?} - resending the response", create_id);
            let response = accepted.response.clone();
            self.send(response).await;
            return AcceptOutcome::Retransmission;
        }

        let offer = match self.check(&create) {
            Ok(offer) => offer,
            Err(reason) => {
                warn!("refusing CreateSequence {:?} for endpoint {:?}: {}", create_id, create.endpoint, reason);
                self.send(Frame::CreateSequenceResponse { create_id, result: Err(reason) }).await;
                return AcceptOutcome::Refused(reason);
            }
        };

        let expires = self.config.effective_expiry(create.expires);
        let session = Session::accepted(self.config.clone(), self.kind, self.transport.clone(), offer, expires);
        info!("accepted session {} for endpoint {:?}, replying on {}", session.input_sequence_id(), create.endpoint, offer);

        let response = Frame::CreateSequenceResponse {
            create_id,
            result: Ok(CreateSequenceAccepted {
                sequence_id: session.input_sequence_id(),
                expires,
            }),
        };
        self.accepted.insert(create_id, AcceptedSequence {
            offer,
            response: response.clone(),
            session: session.clone(),
        });
        self.send(response).await;
        AcceptOutcome::Accepted(session)
    }

    fn check(&mut self, create: &CreateSequence) -> Result<SequenceId, RefusalReason> {
        if !self.config.is_known_endpoint(&create.endpoint) {
            return Err(RefusalReason::EndpointNotFound);
        }
        let Some(offer) = create.offer else {
            return Err(RefusalReason::NoOffer);
        };
        if self.accepted.values().any(|a| a.offer == offer) {
            return Err(RefusalReason::ConflictingOffer);
        }

        self.accepted.retain(|_, a| a.session.outcome().is_none());
        if self.accepted.len() >= self.config.max_pending_sessions {
            return Err(RefusalReason::ServerTooBusy);
        }
        Ok(offer)
    }

    async fn send(&self, frame: Frame) {
        let Some(transport) = self.transport.upgrade() else {
            debug!("transport is gone - dropping {}", frame.kind_name());
            return;
        };
        if let Err(e) = transport.send_frame(frame).await {
            warn!("error sending CreateSequenceResponse: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use rstest::rstest;
    use rustc_hash::FxHashSet;
    use crate::session::transport::MockSessionTransport;

    fn recording_transport() -> (Arc<dyn SessionTransport>, Arc<Mutex<Vec<Frame>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let mut transport = MockSessionTransport::new();
        transport.expect_send_frame()
            .returning(move |frame| {
                sent_clone.lock().unwrap().push(frame);
                Ok(())
            });
        (Arc::new(transport), sent)
    }

    fn create(create_id: u128, endpoint: &str, offer: Option<u128>) -> CreateSequence {
        CreateSequence {
            create_id: CreateId(uuid::Uuid::from_u128(create_id)),
            endpoint: endpoint.to_string(),
            offer: offer.map(SequenceId::from_u128),
            expires: None,
        }
    }

    fn acceptor(transport: &Arc<dyn SessionTransport>, max_pending_sessions: usize) -> SequenceAcceptor {
        let config = Arc::new(ReliableSessionConfig {
            known_endpoints: FxHashSet::from_iter(["echo".to_string()]),
            max_pending_sessions,
            ..ReliableSessionConfig::default()
        });
        SequenceAcceptor::new(config, SessionKind::RequestReplyServer, Arc::downgrade(transport)).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (transport, _sent) = recording_transport();
        let config = Arc::new(ReliableSessionConfig {
            max_pending_sessions: 0,
            ..ReliableSessionConfig::default()
        });
        assert!(SequenceAcceptor::new(config, SessionKind::Duplex, Arc::downgrade(&transport)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept() {
        let (transport, sent) = recording_transport();
        let mut acceptor = acceptor(&transport, 8);

        let session = match acceptor.on_create_sequence(create(1, "echo", Some(100))).await {
            AcceptOutcome::Accepted(session) => session,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(session.output_sequence_id().await, Some(SequenceId::from_u128(100)));
        assert_eq!(session.kind(), SessionKind::RequestReplyServer);
        assert_eq!(acceptor.num_active_sessions(), 1);
        assert!(acceptor.session_for(session.input_sequence_id()).is_some());

        let sent = sent.lock().unwrap();
        match sent.as_slice() {
            [Frame::CreateSequenceResponse { result: Ok(accepted), .. }] => assert_eq!(accepted.sequence_id, session.input_sequence_id()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmitted_create_gets_same_response() {
        let (transport, sent) = recording_transport();
        let mut acceptor = acceptor(&transport, 8);

        acceptor.on_create_sequence(create(1, "echo", Some(100))).await;
        assert!(matches!(acceptor.on_create_sequence(create(1, "echo", Some(100))).await, AcceptOutcome::Retransmission));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(acceptor.num_active_sessions(), 1);
    }

    #[rstest]
    #[case::unknown_endpoint(create(2, "elsewhere", Some(200)), RefusalReason::EndpointNotFound)]
    #[case::no_offer(create(2, "echo", None), RefusalReason::NoOffer)]
    #[case::conflicting_offer(create(2, "echo", Some(100)), RefusalReason::ConflictingOffer)]
    #[case::too_busy(create(2, "echo", Some(200)), RefusalReason::ServerTooBusy)]
    #[tokio::test(start_paused = true)]
    async fn test_refusals(#[case] request: CreateSequence, #[case] expected: RefusalReason) {
        let (transport, sent) = recording_transport();
        let mut acceptor = acceptor(&transport, 1);
        acceptor.on_create_sequence(create(1, "echo", Some(100))).await;

        match acceptor.on_create_sequence(request).await {
            AcceptOutcome::Refused(reason) => assert_eq!(reason, expected),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(sent.lock().unwrap().last(), Some(Frame::CreateSequenceResponse { result: Err(r), .. }) if *r == expected));
        assert_eq!(acceptor.num_active_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_sessions_make_room() {
        let (transport, _sent) = recording_transport();
        let mut acceptor = acceptor(&transport, 1);

        let AcceptOutcome::Accepted(session) = acceptor.on_create_sequence(create(1, "echo", Some(100))).await else {
            panic!("not accepted");
        };
        session.abort().await;

        assert!(matches!(acceptor.on_create_sequence(create(2, "echo", Some(200))).await, AcceptOutcome::Accepted(_)));
    }
}
