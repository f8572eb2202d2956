use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};
use crate::config::{ProtocolVariant, ReliableSessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::frames::{CreateId, CreateSequence, FaultKind, Frame, ProtocolFault};
use crate::sequence::{SequenceId, SequenceNumber};
use crate::session::reply_cache::ReplyRecord;
use crate::session::state::{OutboundContext, OutboundPurpose, OutputState, ReleasedMessage, SessionInner, SessionKind, SessionOutcome, SessionState};
use crate::session::timer::{SessionEvent, TimerKind};
use crate::session::transport::SessionTransport;
use crate::transmission::{Admission, AdmissionTicket, MessageAttempt};

/// A message handed to the application
#[derive(Debug)]
pub struct DeliveredMessage {
    pub sequence_number: SequenceNumber,
    pub payload: Bytes,
    pub relates_to: Option<SequenceNumber>,
    /// present on a request-reply server: the handle for replying to this request
    pub reply_context: Option<RequestContext>,
}

/// The handle through which a request-reply server produces the outcome of a request. The
///  outcome is produced at most once; dropping the context without replying completes the
///  request without a reply.
pub struct RequestContext {
    session: Weak<SessionCore>,
    record: Arc<ReplyRecord>,
    done: bool,
}

impl Debug for RequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestContext{{request: {}}}", self.record.request_number())
    }
}

impl RequestContext {
    pub fn request_number(&self) -> SequenceNumber {
        self.record.request_number()
    }

    /// Replies to the request, or completes it without a reply if `payload` is `None`. Returns
    ///  the reply's sequence number.
    pub async fn reply(mut self, payload: Option<Bytes>, cancel: &CancellationToken) -> SessionResult<Option<SequenceNumber>> {
        self.done = true;
        let session = self.session.upgrade()
            .ok_or(SessionError::Aborted)?;
        if !self.record.begin_reply() {
            return Err(SessionError::InvalidOperation("the request was replied to before"));
        }

        match payload {
            None => {
                let record = self.record.clone();
                session.with_inner(|inner| inner.replies.complete_without_reply(&record)).await;
                Ok(None)
            }
            Some(payload) => {
                let deadline = Instant::now() + session.config.send_timeout;
                let purpose = OutboundPurpose::Reply(self.record.clone());
                session.admit_and_send(Some(payload), false, purpose, cancel, deadline).await
                    .map(Some)
            }
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !self.record.begin_reply() {
            return;
        }

        debug!("request #{} was dropped without a reply", self.record.request_number());
        let record = self.record.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.with_inner(|inner| inner.replies.complete_without_reply(&record)).await;
            });
        }
    }
}

/// Waits for `f`, giving up when the token is cancelled or the deadline passes
async fn suspend<F: Future>(f: F, cancel: &CancellationToken, deadline: Instant) -> SessionResult<F::Output> {
    select! {
        result = f => Ok(result),
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        _ = time::sleep_until(deadline) => Err(SessionError::Timeout),
    }
}

struct SessionCore {
    config: Arc<ReliableSessionConfig>,
    kind: SessionKind,
    input_id: SequenceId,
    inner: RwLock<SessionInner>,
    transport: Weak<dyn SessionTransport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    app_rx: Mutex<mpsc::UnboundedReceiver<DeliveredMessage>>,
    completion: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionCore {
    /// Runs a state change under the session lock, then hands released messages to the
    ///  application and sends the frames the change produced (after releasing the lock).
    async fn with_inner<R>(self: &Arc<Self>, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        let (result, frames) = {
            let mut inner = self.inner.write().await;
            let result = f(&mut *inner);
            self.dispatch_released(&mut *inner);
            (result, inner.take_outbox())
        };
        self.send_frames(frames).await;
        result
    }

    fn dispatch_released(self: &Arc<Self>, inner: &mut SessionInner) {
        for released in inner.take_released() {
            let ReleasedMessage { sequence_number, item, reply_record } = released;

            if inner.kind == SessionKind::RequestReplyClient {
                match item.relates_to.and_then(|request| inner.pending_requests.remove(&request)) {
                    Some(reply_sender) => {
                        trace!("reply #{} completes request #{:?}", sequence_number, item.relates_to);
                        let _ = reply_sender.send(item.payload);
                    }
                    None => debug!("reply #{} relates to no pending request ({:?}) - dropping it", sequence_number, item.relates_to),
                }
                inner.delivery.complete_delivery();
                continue;
            }

            let message = DeliveredMessage {
                sequence_number,
                payload: item.payload,
                relates_to: item.relates_to,
                reply_context: reply_record.map(|record| RequestContext {
                    session: Arc::downgrade(self),
                    record,
                    done: false,
                }),
            };
            let delivered = match &inner.app_tx {
                Some(app_tx) => app_tx.send(message).is_ok(),
                None => false,
            };
            if !delivered {
                inner.delivery.complete_delivery();
            }
        }
    }

    async fn send_frames(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let Some(transport) = self.transport.upgrade() else {
            debug!("transport is gone - dropping {} frames", frames.len());
            return;
        };

        for frame in frames {
            trace!("sending {}", frame.kind_name());
            if let Err(e) = transport.send_frame(frame).await {
                self.on_send_error(e).await;
            }
        }
    }

    async fn on_send_error(&self, e: anyhow::Error) {
        warn!("error sending frame to {:?}: {}", self.transport.upgrade().map(|t| t.remote_address()), e);
        self.inner.write().await.last_transport_error = Some(e.to_string());
    }

    /// Sends a frame for a message that is held by the transmission window. A failed send is not
    ///  an error for the caller: the message is retransmitted on the retry timer.
    async fn send_message_frame(&self, frame: Frame, cancel: &CancellationToken, deadline: Instant) -> SessionResult<()> {
        let Some(transport) = self.transport.upgrade() else {
            return Err(SessionError::Transport("the transport is gone".to_string()));
        };
        if let Err(e) = suspend(transport.send_frame(frame), cancel, deadline).await? {
            self.on_send_error(e).await;
        }
        Ok(())
    }

    async fn admit_and_send(self: &Arc<Self>, payload: Option<Bytes>, is_last: bool, purpose: OutboundPurpose, cancel: &CancellationToken, deadline: Instant) -> SessionResult<SequenceNumber> {
        let admission = self.with_inner(|inner| inner.add_outbound(payload, is_last, &purpose, Instant::now())).await?;

        let attempt = match admission {
            Admission::Admitted(attempt) => attempt,
            Admission::Blocked(ticket) => self.await_admission(ticket, cancel, deadline).await?,
        };

        let frame = self.with_inner(|inner| inner.on_attempt_issued(&attempt, purpose)).await?;
        self.send_message_frame(frame, cancel, deadline).await?;
        Ok(attempt.sequence_number)
    }

    async fn await_admission(&self, ticket: AdmissionTicket<OutboundContext>, cancel: &CancellationToken, deadline: Instant) -> SessionResult<MessageAttempt<OutboundContext>> {
        let AdmissionTicket { id, mut receiver } = ticket;
        trace!("waiting for admission into the transmission window as waiter #{}", id);

        let outcome = select! {
            outcome = &mut receiver => outcome,
            _ = cancel.cancelled() => return self.withdraw(id, receiver, SessionError::Cancelled).await,
            _ = time::sleep_until(deadline) => return self.withdraw(id, receiver, SessionError::Timeout).await,
        };
        outcome.unwrap_or(Err(SessionError::Aborted))
    }

    /// Removes a queued admission. If it was admitted in the meantime, the admission stands.
    async fn withdraw(&self, id: u64, mut receiver: oneshot::Receiver<SessionResult<MessageAttempt<OutboundContext>>>, error: SessionError) -> SessionResult<MessageAttempt<OutboundContext>> {
        let mut inner = self.inner.write().await;
        if inner.window.cancel_waiter(id) {
            debug!("withdrew waiter #{}: {}", id, error);
            return Err(error);
        }
        receiver.try_recv()
            .unwrap_or(Err(error))
    }

    async fn on_event(self: &Arc<Self>, event: SessionEvent) {
        self.with_inner(|inner| {
            let now = Instant::now();
            match event {
                SessionEvent::Frame(frame) => inner.on_frame(frame, now),
                SessionEvent::TransportFault(reason) => {
                    warn!("transport fault: {}", reason);
                    inner.last_transport_error = Some(reason.clone());
                    inner.fault(SessionError::Transport(reason), None);
                }
                SessionEvent::TimerFired { kind: TimerKind::Retry, generation } => inner.on_retry_timer(generation, now),
                SessionEvent::TimerFired { kind: TimerKind::Acknowledgment, generation } => inner.on_ack_timer(generation),
                SessionEvent::BufferReleased { remaining } => inner.on_buffer_released(remaining),
            }
        }).await
    }

    /// Returns true if the driver should stop
    async fn on_inactivity(self: &Arc<Self>) -> bool {
        self.with_inner(|inner| {
            if inner.state == SessionState::Terminated {
                debug!("terminated session {} is idle - stopping", inner.input_id);
                return true;
            }
            let input_id = inner.input_id;
            let fault = ProtocolFault::new(FaultKind::SequenceTerminated, Some(input_id), "no frames received within the inactivity timeout");
            inner.fault(SessionError::Timeout, Some(fault));
            true
        }).await
    }

    async fn on_expired(self: &Arc<Self>) {
        self.with_inner(|inner| {
            if inner.state.is_terminal() {
                return;
            }
            debug!("sequence {} expired", inner.input_id);
            let input_id = inner.input_id;
            let fault = ProtocolFault::new(FaultKind::SequenceTerminated, Some(input_id), "the sequence expired");
            inner.fault(SessionError::Timeout, Some(fault));
        }).await
    }

    async fn do_loop(core: Arc<SessionCore>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let inactivity_timeout = core.config.inactivity_timeout;
        let mut last_activity = Instant::now();

        loop {
            let expiry = core.inner.read().await.expiry;
            let expired = async move {
                match expiry {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let SessionEvent::Frame(_) = &event {
                        last_activity = Instant::now();
                    }
                    core.on_event(event).await;
                }
                _ = time::sleep_until(last_activity + inactivity_timeout) => {
                    if core.on_inactivity().await {
                        break;
                    }
                }
                _ = expired => {
                    core.on_expired().await;
                }
            }

            if matches!(core.inner.read().await.state, SessionState::Faulted | SessionState::Aborted) {
                break;
            }
        }
        trace!("session driver stopped");
    }
}

struct DriverHandle(JoinHandle<()>);

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A reliable session over a [SessionTransport]: exactly-once (and optionally ordered) delivery
///  in both directions, with a graceful shutdown handshake.
///
/// Inbound frames are pushed in through [Session::on_frame] and processed one at a time by the
///  session's driver task, so a session must be created inside a tokio runtime. Cloning a session
///  gives another handle to the same session; the driver stops when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
    _driver: Arc<DriverHandle>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session{{input: {}, kind: {:?}}}", self.core.input_id, self.core.kind)
    }
}

impl Session {
    /// Creates the initiating side of a session. It is established by [Session::open].
    pub fn initiate(config: Arc<ReliableSessionConfig>, kind: SessionKind, transport: Weak<dyn SessionTransport>) -> anyhow::Result<Session> {
        config.validate()?;
        Ok(Self::spawn(config, kind, transport, None, None))
    }

    /// Creates the accepting side of a session, sending on the sequence the initiator offered
    pub(crate) fn accepted(config: Arc<ReliableSessionConfig>, kind: SessionKind, transport: Weak<dyn SessionTransport>, offer: SequenceId, expires: Option<Duration>) -> Session {
        Self::spawn(config, kind, transport, Some(offer), expires)
    }

    fn spawn(config: Arc<ReliableSessionConfig>, kind: SessionKind, transport: Weak<dyn SessionTransport>, output_id: Option<SequenceId>, expires: Option<Duration>) -> Session {
        let input_id = SequenceId::new_random();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = watch::channel(None);

        let mut inner = SessionInner::new(&config, kind, input_id, output_id, events_tx.clone(), app_tx, completion_tx);
        if output_id.is_some() {
            inner.state = SessionState::Established;
            inner.expiry = expires.map(|e| Instant::now() + e);
        }

        let core = Arc::new(SessionCore {
            config,
            kind,
            input_id,
            inner: RwLock::new(inner),
            transport,
            events: events_tx,
            app_rx: Mutex::new(app_rx),
            completion: completion_rx,
        });

        let span = info_span!("session", input = %input_id, kind = ?kind);
        let handle = tokio::spawn(SessionCore::do_loop(core.clone(), events_rx).instrument(span));
        Session {
            core,
            _driver: Arc::new(DriverHandle(handle)),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.core.kind
    }

    pub fn input_sequence_id(&self) -> SequenceId {
        self.core.input_id
    }

    pub async fn output_sequence_id(&self) -> Option<SequenceId> {
        self.core.inner.read().await.output_id
    }

    pub async fn state(&self) -> SessionState {
        self.core.inner.read().await.state
    }

    /// the terminal outcome, if the session reached one
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.core.completion.borrow().clone()
    }

    pub async fn wait_for_completion(&self) -> SessionOutcome {
        let mut completion = self.core.completion.clone();
        let outcome = match completion.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(SessionOutcome::Aborted)
    }

    /// Pushes an inbound frame into the session
    pub fn on_frame(&self, frame: Frame) {
        if self.core.events.send(SessionEvent::Frame(frame)).is_err() {
            trace!("session {} is stopped - dropping inbound frame", self.core.input_id);
        }
    }

    /// Reports that the transport failed in a way that affects this session
    pub fn notify_transport_fault(&self, reason: impl Into<String>) {
        let _ = self.core.events.send(SessionEvent::TransportFault(reason.into()));
    }

    /// Establishes an initiated session: sends CreateSequence (offering this session's input
    ///  sequence) and waits for the peer's response, resending on the retry timeout.
    pub async fn open(&self, endpoint: impl Into<String>, cancel: &CancellationToken) -> SessionResult<()> {
        let deadline = Instant::now() + self.core.config.send_timeout;
        let endpoint = endpoint.into();
        let (waiter, opened) = oneshot::channel();

        self.core.with_inner(|inner| {
            if inner.state != SessionState::Created || inner.create_id.is_some() {
                return Err(SessionError::InvalidOperation("the session was opened before"));
            }
            let create_id = CreateId::new_random();
            debug!("opening session {} to endpoint {:?}", inner.input_id, endpoint);
            inner.create_id = Some(create_id);
            inner.open_waiter = Some(waiter);
            let offer = Some(inner.input_id);
            inner.start_handshake(Frame::CreateSequence(CreateSequence {
                create_id,
                endpoint,
                offer,
                expires: None,
            }));
            Ok(())
        }).await?;

        suspend(opened, cancel, deadline).await?
            .unwrap_or(Err(SessionError::Aborted))
    }

    /// Sends a message, waiting for room in the transmission window if necessary. Returns the
    ///  message's sequence number.
    ///
    /// A message that was admitted stays in the window if the send is cancelled afterwards, and
    ///  may still be delivered by retransmission.
    pub async fn send(&self, payload: Bytes, cancel: &CancellationToken) -> SessionResult<SequenceNumber> {
        let deadline = Instant::now() + self.core.config.send_timeout;
        self.core.admit_and_send(Some(payload), false, OutboundPurpose::Message, cancel, deadline).await
    }

    /// Sends a request and waits for its reply (request-reply clients only)
    pub async fn request(&self, payload: Bytes, cancel: &CancellationToken) -> SessionResult<Bytes> {
        let deadline = Instant::now() + self.core.config.send_timeout;
        let (reply_sender, reply) = oneshot::channel();
        let number = self.core.admit_and_send(Some(payload), false, OutboundPurpose::Request(reply_sender), cancel, deadline).await?;

        match suspend(reply, cancel, deadline).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                let inner = self.core.inner.read().await;
                Err(inner.terminal_error().unwrap_or(SessionError::Aborted))
            }
            Err(e) => {
                debug!("giving up on the reply to request #{}: {}", number, e);
                self.core.inner.write().await.pending_requests.remove(&number);
                Err(e)
            }
        }
    }

    /// Takes the next delivered message. Returns `None` once the session is terminated and all
    ///  messages were taken.
    pub async fn receive(&self, cancel: &CancellationToken) -> SessionResult<Option<DeliveredMessage>> {
        if self.core.kind == SessionKind::RequestReplyClient {
            return Err(SessionError::InvalidOperation("a request-reply client receives replies through request()"));
        }

        let mut app_rx = self.core.app_rx.lock().await;
        let received = select! {
            received = app_rx.recv() => received,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        };

        let mut inner = self.core.inner.write().await;
        match (received, inner.outcome()) {
            (_, Some(SessionOutcome::Faulted(cause))) => Err(SessionError::faulted(cause)),
            (_, Some(SessionOutcome::Aborted)) => Err(SessionError::Aborted),
            (Some(message), _) => {
                inner.delivery.complete_delivery();
                Ok(Some(message))
            }
            (None, _) => Ok(None),
        }
    }

    /// Shuts the session down gracefully and waits until both sequences are terminated
    pub async fn close(&self, cancel: &CancellationToken) -> SessionResult<()> {
        let deadline = Instant::now() + self.core.config.send_timeout;

        let needs_last_marker = self.core.with_inner(|inner| {
            if let Some(outcome) = inner.outcome() {
                return match outcome {
                    SessionOutcome::Closed => Ok(false),
                    other => Err(other.to_error()),
                };
            }
            if inner.state == SessionState::Created {
                return Err(SessionError::InvalidOperation("the session is not open"));
            }
            if inner.kind == SessionKind::RequestReplyClient && !inner.pending_requests.is_empty() {
                return Err(SessionError::InvalidOperation("there are requests waiting for replies"));
            }

            match (inner.kind, inner.variant) {
                // replies end when the client terminates the request sequence
                (SessionKind::RequestReplyServer, _) => Ok(false),
                (_, ProtocolVariant::Simplified) => Ok(inner.output_state == OutputState::Open && !inner.window.is_sealed()),
                (_, ProtocolVariant::TwoPhase) => inner.begin_output_shutdown().map(|_| false),
            }
        }).await?;

        if needs_last_marker {
            self.core.admit_and_send(None, true, OutboundPurpose::LastMarker, cancel, deadline).await?;
            self.core.with_inner(|inner| inner.begin_output_shutdown()).await?;
        }

        match suspend(self.wait_for_completion(), cancel, deadline).await? {
            SessionOutcome::Closed => Ok(()),
            other => Err(other.to_error()),
        }
    }

    /// Terminates the session right away. Every suspended operation fails with
    ///  [SessionError::Aborted]. Nothing is sent to the peer.
    pub async fn abort(&self) {
        self.core.with_inner(|inner| inner.abort()).await
    }
}
