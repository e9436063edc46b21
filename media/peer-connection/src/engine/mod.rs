//! # Negotiation engine
//!
//! See [`PeerConnection`].
//!
//! Every API call and every transport event is appended to an inbox and a wake is requested. [`PeerConnection::step`]
//! drains the inbox under the state lock, handles the events, prunes entities rejected in the previous step, works on
//! the oldest pending method, delivers buffered remote candidates and re-evaluates the aggregated states. Notifications collected during the step are dispatched
//! after the state lock is released, so delegates may call back into the API.

use crate::{
    Configuration, DataChannel, DataChannelEvent, DataChannelParameters, DataChannelState,
    Deferred, Error, IceConnectionState, IceGatheringState, InternalState, MediaDirection,
    MediaLineId, NegotiationState, PeerConnectionDelegate, PeerConnectionEvent,
    PeerConnectionState, ReceiverId, SenderId, SessionDescription, SignalingState, Subscription,
    TransportId,
    entities::{
        PendingMethod, PooledTransport, ReceiverInfo, RtpMediaLineInfo, SctpMediaLineInfo,
        SenderInfo, TransportInfo,
    },
    state,
    transport::{
        DtlsTransportState, IceCandidateInit, IceGathererState, IceTransportState, MediaTrack,
        SctpTransportState, TransportEvent, TransportFactory,
    },
};
use parking_lot::{Mutex, ReentrantMutex};
use rand::distr::{Alphanumeric, SampleString};
use rtp_params::{MediaKind, RtpParameters};
use std::{
    collections::{BTreeMap, VecDeque},
    mem::take,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::Notify;

mod apply;
mod data;
#[cfg(feature = "rt")]
mod driver;
mod offer;
mod transports;

/// Options for [`PeerConnection::create_offer`]
#[derive(Debug, Default, Clone)]
pub struct OfferOptions {
    /// Generate new ICE credentials for every transport
    pub ice_restart: bool,
    /// Offer comfort noise, disabled when set to `false`
    pub voice_activity_detection: Option<bool>,
}

/// Options for [`PeerConnection::create_answer`]
#[derive(Debug, Default, Clone)]
pub struct AnswerOptions {
    pub voice_activity_detection: Option<bool>,
}

/// Options for [`PeerConnection::create_capabilities`]
#[derive(Debug, Default, Clone)]
pub struct CapabilityOptions {
    /// Media kinds to include, all if empty
    pub kinds: Vec<MediaKind>,
    /// Include the data channel capabilities
    pub data: bool,
}

#[derive(Debug, Clone)]
pub struct TransportSummary {
    pub id: TransportId,
    pub negotiation: NegotiationState,
    pub ice_gatherer_state: IceGathererState,
    pub ice_transport_state: IceTransportState,
    pub dtls_state: Option<DtlsTransportState>,
    pub sctp_state: Option<SctpTransportState>,
    /// A separate RTCP component exists
    pub has_rtcp: bool,
    pub started: bool,
}

#[derive(Debug, Clone)]
pub struct MediaLineSummary {
    pub id: MediaLineId,
    pub line_index: usize,
    pub transport_id: TransportId,
    pub negotiation: NegotiationState,
    /// `None` for SCTP media lines
    pub kind: Option<MediaKind>,
    pub direction: Option<MediaDirection>,
}

#[derive(Debug, Clone)]
pub struct SenderSummary {
    pub id: SenderId,
    pub media_line_id: Option<MediaLineId>,
    pub negotiation: NegotiationState,
    pub track_id: String,
    pub stream_ids: Vec<String>,
    pub parameters: Option<RtpParameters>,
}

#[derive(Debug, Clone)]
pub struct ReceiverSummary {
    pub id: ReceiverId,
    pub media_line_id: MediaLineId,
    pub negotiation: NegotiationState,
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_ids: Vec<String>,
    pub parameters: Option<RtpParameters>,
}

pub(crate) enum Command {
    Method(PendingMethod),
    Candidate(IceCandidateInit),
    AddTrack {
        id: SenderId,
        track: MediaTrack,
        stream_ids: Vec<String>,
    },
    RemoveTrack(SenderId),
    CreateDataChannel(DataChannel),
    /// Closed by the user, carries the state the channel moved to
    CloseDataChannel(DataChannel, DataChannelState),
    SetConfiguration(Configuration),
    Event(TransportEvent),
    Close,
}

pub(crate) enum Notification {
    Connection(PeerConnectionEvent),
    Channel(DataChannel, DataChannelEvent),
}

/// Peer connection negotiation engine.
///
/// Owns the transports, media lines, senders and receivers of one peer-to-peer session and drives them through
/// offer/answer negotiation. Collaborators are created using the [`TransportFactory`] passed on construction.
pub struct PeerConnection {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    this: Weak<Inner>,
    wake_called: AtomicBool,
    closing: AtomicBool,
    buffer_data_channels: AtomicBool,
    next_id: AtomicU64,
    inbox: Mutex<VecDeque<Command>>,
    state: Mutex<State>,
    step_lock: ReentrantMutex<()>,
    observers: Mutex<Vec<(u64, Arc<dyn PeerConnectionDelegate>)>>,
    notify: Option<Arc<Notify>>,
}

pub(crate) struct State {
    this: Weak<Inner>,
    config: Configuration,
    factory: Box<dyn TransportFactory>,

    lifecycle: InternalState,
    signaling: SignalingState,
    ice_gathering: IceGatheringState,
    ice_connection: IceConnectionState,
    connection: PeerConnectionState,
    negotiation_dirty: bool,
    negotiation_needed_announced: bool,

    transports: BTreeMap<TransportId, TransportInfo>,
    /// Pre-gathering transports, taken by the first locally created transports
    candidate_pool: BTreeMap<TransportId, PooledTransport>,
    rtp_media_lines: BTreeMap<MediaLineId, RtpMediaLineInfo>,
    sctp_media_lines: BTreeMap<MediaLineId, SctpMediaLineInfo>,
    senders: BTreeMap<SenderId, SenderInfo>,
    receivers: BTreeMap<ReceiverId, ReceiverInfo>,
    data_channels: BTreeMap<u64, DataChannel>,

    pending_methods: VecDeque<PendingMethod>,
    /// Remote candidates waiting for their transport to be started, in arrival order
    pending_candidates: VecDeque<IceCandidateInit>,

    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    remote_capabilities: Option<SessionDescription>,

    session_id: u64,
    session_version: u64,
    cname: String,
    /// Role in the last applied offer/answer exchange
    is_offerer: Option<bool>,

    next_transport_id: u64,
    next_media_line_id: u64,
    next_receiver_id: u64,

    notifications: Vec<Notification>,
}

impl PeerConnection {
    /// Create a peer connection which must be driven manually by calling [`PeerConnection::step`] whenever
    /// [`PeerConnection::needs_step`] returns true.
    pub fn new(
        config: Configuration,
        factory: impl TransportFactory + 'static,
    ) -> Result<Self, Error> {
        Self::build(config, Box::new(factory), None)
    }

    /// Create a peer connection driven by a task spawned on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime
    #[cfg(feature = "rt")]
    pub fn spawn(
        config: Configuration,
        factory: impl TransportFactory + 'static,
    ) -> Result<Self, Error> {
        let notify = Arc::new(Notify::new());
        let this = Self::build(config, Box::new(factory), Some(notify.clone()))?;

        driver::spawn(Arc::downgrade(&this.inner), notify);
        this.inner.wake();

        Ok(this)
    }

    fn build(
        config: Configuration,
        factory: Box<dyn TransportFactory>,
        notify: Option<Arc<Notify>>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let pre_gather = config.ice_candidate_pool_size > 0;

        let inner = Arc::new_cyclic(|this: &Weak<Inner>| Inner {
            this: this.clone(),
            wake_called: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            buffer_data_channels: AtomicBool::new(config.buffer_data_channel_while_connecting),
            next_id: AtomicU64::new(0),
            inbox: Mutex::new(VecDeque::new()),
            state: Mutex::new(State::new(this.clone(), config, factory)),
            step_lock: ReentrantMutex::new(()),
            observers: Mutex::new(vec![]),
            notify,
        });

        // the first step fills the candidate pool
        if pre_gather {
            inner.wake();
        }

        Ok(Self { inner })
    }

    /// Run one iteration of the state machine
    pub fn step(&self) {
        self.inner.step();
    }

    /// Returns true if work has been queued since the last [`step`](Self::step)
    pub fn needs_step(&self) -> bool {
        self.inner.wake_called.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.inner.closing.load(Ordering::Acquire) {
            Err(Error::InvalidState("peer connection is closed".into()))
        } else {
            Ok(())
        }
    }

    fn enqueue_method(&self, method: PendingMethod) {
        self.inner.enqueue(Command::Method(method));
    }

    /// Create an offer covering all tracks and data channels
    pub fn create_offer(&self, options: OfferOptions) -> Result<Deferred<SessionDescription>, Error> {
        self.check_open()?;

        let (method, deferred) = PendingMethod::create_offer(options);
        self.enqueue_method(method);
        Ok(deferred)
    }

    /// Create an answer to the pending remote offer
    pub fn create_answer(
        &self,
        options: AnswerOptions,
    ) -> Result<Deferred<SessionDescription>, Error> {
        self.check_open()?;

        let (method, deferred) = PendingMethod::create_answer(options);
        self.enqueue_method(method);
        Ok(deferred)
    }

    /// Describe what this peer connection supports, without creating anything
    pub fn create_capabilities(
        &self,
        options: CapabilityOptions,
    ) -> Result<Deferred<SessionDescription>, Error> {
        self.check_open()?;

        let (method, deferred) = PendingMethod::create_capabilities(options);
        self.enqueue_method(method);
        Ok(deferred)
    }

    pub fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<Deferred<()>, Error> {
        self.check_open()?;
        description.validate()?;

        let (method, deferred) = PendingMethod::set_local_description(description);
        self.enqueue_method(method);
        Ok(deferred)
    }

    pub fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<Deferred<()>, Error> {
        self.check_open()?;
        description.validate()?;

        let (method, deferred) = PendingMethod::set_remote_description(description);
        self.enqueue_method(method);
        Ok(deferred)
    }

    /// Add a remote candidate. Candidates for transports which aren't running yet are kept until they are.
    pub fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), Error> {
        self.check_open()?;

        if candidate.mid.is_none() && candidate.line_index.is_none() {
            return Err(Error::InvalidParameters(
                "candidate must have a mid or line index".into(),
            ));
        }

        self.inner.enqueue(Command::Candidate(candidate));
        Ok(())
    }

    /// Add a local track to be sent. Requires a new offer/answer exchange.
    pub fn add_track(&self, track: MediaTrack, stream_ids: Vec<String>) -> Result<SenderId, Error> {
        self.check_open()?;

        let id = SenderId(format!("s{}", self.inner.next_id()));

        self.inner.enqueue(Command::AddTrack {
            id: id.clone(),
            track,
            stream_ids,
        });

        Ok(id)
    }

    pub fn remove_track(&self, sender_id: &SenderId) -> Result<(), Error> {
        self.check_open()?;

        self.inner
            .enqueue(Command::RemoveTrack(sender_id.clone()));
        Ok(())
    }

    /// Create a data channel, the SCTP media line is created with the first channel
    pub fn create_data_channel(
        &self,
        parameters: DataChannelParameters,
    ) -> Result<DataChannel, Error> {
        self.check_open()?;
        parameters.validate()?;

        let channel = DataChannel::new(
            self.inner.next_id(),
            parameters,
            self.inner.buffer_data_channels.load(Ordering::Acquire),
            self.inner.this.clone(),
        );

        self.inner
            .enqueue(Command::CreateDataChannel(channel.clone()));

        Ok(channel)
    }

    /// Update the configuration. Bundle, RTCP mux and secure transport policies cannot be changed.
    pub fn set_configuration(&self, config: Configuration) -> Result<(), Error> {
        self.check_open()?;

        self.inner.state.lock().config.validate_update(&config)?;

        self.inner.buffer_data_channels.store(
            config.buffer_data_channel_while_connecting,
            Ordering::Release,
        );
        self.inner.enqueue(Command::SetConfiguration(config));
        Ok(())
    }

    pub fn configuration(&self) -> Configuration {
        self.inner.state.lock().config.clone()
    }

    /// Close the peer connection. Pending operations fail with [`Error::Shutdown`].
    ///
    /// Calling this more than once has no effect.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.enqueue(Command::Close);
        self.inner.step();
    }

    /// Register a delegate, it is called for every [`PeerConnectionEvent`] in order.
    pub fn subscribe(&self, delegate: impl PeerConnectionDelegate + 'static) -> Subscription {
        let id = self.inner.next_id();

        self.inner
            .observers
            .lock()
            .push((id, Arc::new(delegate)));

        Subscription::new(id, self.inner.this.clone())
    }

    pub fn internal_state(&self) -> InternalState {
        self.inner.state.lock().lifecycle
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.state.lock().signaling
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.inner.state.lock().ice_gathering
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.inner.state.lock().ice_connection
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.inner.state.lock().connection
    }

    /// Returns the pending local description if there is one, else the current one
    pub fn local_description(&self) -> Option<SessionDescription> {
        let state = self.inner.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    /// Returns the pending remote description if there is one, else the current one
    pub fn remote_description(&self) -> Option<SessionDescription> {
        let state = self.inner.state.lock();
        state
            .pending_remote
            .clone()
            .or_else(|| state.current_remote.clone())
    }

    pub fn current_local_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().current_local.clone()
    }

    pub fn pending_local_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().pending_local.clone()
    }

    pub fn current_remote_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().current_remote.clone()
    }

    pub fn pending_remote_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().pending_remote.clone()
    }

    /// Capabilities the peer announced with a remote capabilities description
    pub fn remote_capabilities(&self) -> Option<SessionDescription> {
        self.inner.state.lock().remote_capabilities.clone()
    }

    /// Whether the peer accepts trickled candidates, `None` until a remote description is set
    pub fn can_trickle_candidates(&self) -> Option<bool> {
        let state = self.inner.state.lock();

        let remote = state
            .pending_remote
            .as_ref()
            .or(state.current_remote.as_ref())?;

        Some(
            remote
                .description
                .transports
                .iter()
                .all(|t| t.rtp.ice.as_ref().is_some_and(|ice| !ice.ice_lite)),
        )
    }

    pub fn negotiation_needed(&self) -> bool {
        self.inner.state.lock().negotiation_needed()
    }

    pub fn transports(&self) -> Vec<TransportSummary> {
        let state = self.inner.state.lock();

        state
            .transports
            .values()
            .map(|t| TransportSummary {
                id: t.id.clone(),
                negotiation: t.negotiation,
                ice_gatherer_state: t.rtp.gatherer_state,
                ice_transport_state: t.rtp.ice_state,
                dtls_state: t.rtp.dtls_state(),
                sctp_state: t.sctp.as_ref().map(|sctp| sctp.state),
                has_rtcp: t.rtcp.is_some(),
                started: t.started,
            })
            .collect()
    }

    pub fn rtp_media_lines(&self) -> Vec<MediaLineSummary> {
        let state = self.inner.state.lock();

        let mut lines: Vec<_> = state
            .rtp_media_lines
            .values()
            .map(|l| MediaLineSummary {
                id: l.id.clone(),
                line_index: l.line_index,
                transport_id: l.transport_id.clone(),
                negotiation: l.negotiation,
                kind: Some(l.kind),
                direction: Some(l.direction),
            })
            .collect();

        lines.sort_by_key(|l| l.line_index);
        lines
    }

    pub fn sctp_media_lines(&self) -> Vec<MediaLineSummary> {
        let state = self.inner.state.lock();

        state
            .sctp_media_lines
            .values()
            .map(|l| MediaLineSummary {
                id: l.id.clone(),
                line_index: l.line_index,
                transport_id: l.transport_id.clone(),
                negotiation: l.negotiation,
                kind: None,
                direction: None,
            })
            .collect()
    }

    pub fn senders(&self) -> Vec<SenderSummary> {
        let state = self.inner.state.lock();

        state
            .senders
            .values()
            .map(|s| SenderSummary {
                id: s.id.clone(),
                media_line_id: s.media_line_id.clone(),
                negotiation: s.negotiation,
                track_id: s.track.id.clone(),
                stream_ids: s.stream_ids.clone(),
                parameters: s.parameters.clone(),
            })
            .collect()
    }

    pub fn receivers(&self) -> Vec<ReceiverSummary> {
        let state = self.inner.state.lock();

        state
            .receivers
            .values()
            .map(|r| ReceiverSummary {
                id: r.id.clone(),
                media_line_id: r.media_line_id.clone(),
                negotiation: r.negotiation,
                kind: r.kind,
                track_id: r.track_id.clone(),
                stream_ids: r.stream_ids.clone(),
                parameters: r.parameters.clone(),
            })
            .collect()
    }

    /// Data channels which haven't been closed yet
    pub fn data_channels(&self) -> Vec<DataChannel> {
        self.inner
            .state
            .lock()
            .data_channels
            .values()
            .cloned()
            .collect()
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn wake(&self) {
        if !self.wake_called.swap(true, Ordering::AcqRel)
            && let Some(notify) = &self.notify
        {
            notify.notify_one();
        }
    }

    fn enqueue(&self, command: Command) {
        self.inbox.lock().push_back(command);
        self.wake();
    }

    pub(crate) fn push_event(&self, event: TransportEvent) {
        self.enqueue(Command::Event(event));
    }

    pub(crate) fn close_data_channel(&self, channel: DataChannel, new_state: DataChannelState) {
        self.enqueue(Command::CloseDataChannel(channel, new_state));
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.observers.lock().retain(|(i, _)| *i != id);
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().lifecycle == InternalState::Shutdown
    }

    pub(crate) fn step(&self) {
        let _step = self.step_lock.lock();

        self.wake_called.store(false, Ordering::Release);

        let (notifications, more_work) = {
            let mut state = self.state.lock();

            let commands = take(&mut *self.inbox.lock());

            for command in commands {
                state.handle_command(command);
            }

            let more_work = state.step();

            (take(&mut state.notifications), more_work)
        };

        self.dispatch(notifications);

        if more_work {
            self.wake();
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }

        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        for notification in notifications {
            match notification {
                Notification::Connection(event) => {
                    for observer in &observers {
                        observer.on_event(&event);
                    }
                }
                Notification::Channel(channel, event) => channel.dispatch(&event),
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // let the driver task exit
        if let Some(notify) = &self.notify {
            notify.notify_one();
        }
    }
}

impl State {
    fn new(this: Weak<Inner>, config: Configuration, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            this,
            config,
            factory,
            lifecycle: InternalState::Pending,
            signaling: SignalingState::Stable,
            ice_gathering: IceGatheringState::New,
            ice_connection: IceConnectionState::New,
            connection: PeerConnectionState::New,
            negotiation_dirty: false,
            negotiation_needed_announced: false,
            transports: BTreeMap::new(),
            candidate_pool: BTreeMap::new(),
            rtp_media_lines: BTreeMap::new(),
            sctp_media_lines: BTreeMap::new(),
            senders: BTreeMap::new(),
            receivers: BTreeMap::new(),
            data_channels: BTreeMap::new(),
            pending_methods: VecDeque::new(),
            pending_candidates: VecDeque::new(),
            current_local: None,
            pending_local: None,
            current_remote: None,
            pending_remote: None,
            remote_capabilities: None,
            session_id: u64::from(rand::random::<u32>()),
            session_version: 0,
            cname: Alphanumeric.sample_string(&mut rand::rng(), 16),
            is_offerer: None,
            next_transport_id: 0,
            next_media_line_id: 0,
            next_receiver_id: 0,
            notifications: vec![],
        }
    }

    fn notify(&mut self, event: PeerConnectionEvent) {
        self.notifications.push(Notification::Connection(event));
    }

    fn notify_channel(&mut self, channel: &DataChannel, event: DataChannelEvent) {
        self.notifications
            .push(Notification::Channel(channel.clone(), event));
    }

    fn is_closing(&self) -> bool {
        self.lifecycle >= InternalState::ShuttingDown
    }

    fn handle_command(&mut self, command: Command) {
        if self.is_closing() {
            match command {
                Command::Method(method) => method.fail(Error::Shutdown),
                Command::Event(event) => self.handle_transport_event(event),
                Command::CreateDataChannel(channel) => {
                    if let Some(event) = channel.set_closed() {
                        self.notify_channel(&channel, event);
                    }
                }
                Command::CloseDataChannel(channel, new_state) => {
                    self.close_data_channel(channel, new_state)
                }
                _ => {}
            }

            return;
        }

        match command {
            Command::Method(method) => self.pending_methods.push_back(method),
            Command::Candidate(candidate) => self.pending_candidates.push_back(candidate),
            Command::AddTrack {
                id,
                track,
                stream_ids,
            } => self.add_track(id, track, stream_ids),
            Command::RemoveTrack(id) => self.remove_track(&id),
            Command::CreateDataChannel(channel) => self.add_data_channel(channel),
            Command::CloseDataChannel(channel, new_state) => {
                self.close_data_channel(channel, new_state)
            }
            Command::SetConfiguration(config) => self.set_configuration(config),
            Command::Event(event) => self.handle_transport_event(event),
            Command::Close => self.start_shutdown(),
        }
    }

    /// Returns true if there's more work left
    fn step(&mut self) -> bool {
        if self.lifecycle == InternalState::Pending {
            self.lifecycle = InternalState::Ready;
            self.fill_candidate_pool();
        }

        let mut more_work = false;

        if !self.is_closing() {
            // entities rejected by the previous step
            self.prune_rejected();

            if let Some(method) = self.pending_methods.pop_front() {
                log::debug!("processing {}", method.name());

                match self.process_method(method) {
                    Ok(()) => more_work = !self.pending_methods.is_empty(),
                    Err(method) => {
                        log::trace!("{} is waiting for transports", method.name());
                        self.pending_methods.push_front(method)
                    }
                }
            }

            // the method may have started transports
            self.deliver_pending_candidates();

            more_work |= self.has_rejected();
        }

        self.finish_shutdown();
        self.update_states();

        more_work
    }

    /// Work on a pending method, returns it back if it must wait for transports to become ready
    fn process_method(&mut self, method: PendingMethod) -> Result<(), PendingMethod> {
        match method {
            PendingMethod::CreateOffer {
                mut options,
                completer,
            } => {
                match self.create_offer(&mut options) {
                    Ok(Some(offer)) => completer.complete(Ok(offer)),
                    Ok(None) => return Err(PendingMethod::CreateOffer { options, completer }),
                    Err(e) => completer.complete(Err(e)),
                }
            }
            PendingMethod::CreateAnswer { options, completer } => {
                match self.create_answer(&options) {
                    Ok(Some(answer)) => completer.complete(Ok(answer)),
                    Ok(None) => return Err(PendingMethod::CreateAnswer { options, completer }),
                    Err(e) => completer.complete(Err(e)),
                }
            }
            PendingMethod::CreateCapabilities { options, completer } => {
                completer.complete(Ok(self.create_capabilities(&options)));
            }
            PendingMethod::SetLocalDescription {
                description,
                completer,
            } => completer.complete(self.set_local_description(description)),
            PendingMethod::SetRemoteDescription {
                description,
                completer,
            } => completer.complete(self.set_remote_description(description)),
        }

        Ok(())
    }

    fn add_track(&mut self, id: SenderId, track: MediaTrack, stream_ids: Vec<String>) {
        log::debug!("adding {:?} track {} as sender {id}", track.kind, track.id);

        self.senders.insert(
            id.clone(),
            SenderInfo {
                id,
                media_line_id: None,
                negotiation: NegotiationState::PendingOffer,
                track,
                stream_ids,
                sender: None,
                sender_transport: None,
                offered: None,
                parameters: None,
            },
        );

        self.negotiation_dirty = true;
    }

    fn remove_track(&mut self, id: &SenderId) {
        let Some(mut sender) = self.senders.remove(id) else {
            log::warn!("remove_track called with unknown sender {id}");
            return;
        };

        if let Some(rtp_sender) = &mut sender.sender {
            rtp_sender.stop();
        }

        if let Some(line) = sender
            .media_line_id
            .as_ref()
            .and_then(|id| self.rtp_media_lines.get_mut(id))
        {
            line.senders.remove(id);
        }

        self.negotiation_dirty = true;
    }

    fn set_configuration(&mut self, config: Configuration) {
        let servers_changed = config.ice_servers != self.config.ice_servers
            || config.ice_transport_policy != self.config.ice_transport_policy;

        self.config = config;

        if servers_changed {
            let servers = self.ice_servers();
            let policy = self.config.ice_transport_policy;

            for transport in self.transports.values_mut() {
                transport.rtp.gatherer.gather(&servers, policy);

                if let Some(rtcp) = &mut transport.rtcp {
                    rtcp.gatherer.gather(&servers, policy);
                }
            }

            for pooled in self.candidate_pool.values_mut() {
                pooled.details.gatherer.gather(&servers, policy);
            }
        }

        self.fill_candidate_pool();
    }

    fn negotiation_needed(&self) -> bool {
        self.negotiation_dirty
            || (!self.data_channels.is_empty() && self.sctp_media_lines.is_empty())
            || self
                .senders
                .values()
                .any(|s| s.negotiation == NegotiationState::PendingOffer)
            || self
                .rtp_media_lines
                .values()
                .any(|l| l.negotiation == NegotiationState::PendingOffer)
            || self
                .sctp_media_lines
                .values()
                .any(|l| l.negotiation == NegotiationState::PendingOffer)
    }

    /// Re-evaluate all aggregated states and queue notifications for changes
    fn update_states(&mut self) {
        let closed = self.is_closing();

        let signaling = state::signaling_state(
            closed,
            self.pending_local.as_ref().map(|d| d.kind),
            self.pending_remote.as_ref().map(|d| d.kind),
        );

        let ice_gathering = state::ice_gathering_state(
            self.transports
                .values()
                .flat_map(|t| t.details().map(|d| d.gatherer_state)),
        );

        let ice_connection = if closed {
            IceConnectionState::Closed
        } else {
            state::ice_connection_state(
                self.transports
                    .values()
                    .flat_map(|t| t.details().map(|d| d.ice_state)),
            )
        };

        let connection = state::peer_connection_state(
            closed,
            ice_connection,
            self.transports
                .values()
                .flat_map(|t| t.details().filter_map(|d| d.dtls_state())),
            self.transports
                .values()
                .filter_map(|t| t.sctp.as_ref().map(|s| s.state)),
        );

        if signaling != self.signaling {
            log::debug!("signaling state {:?} -> {signaling:?}", self.signaling);
            self.signaling = signaling;
            self.notify(PeerConnectionEvent::SignalingStateChanged(signaling));
        }

        if ice_gathering != self.ice_gathering {
            self.ice_gathering = ice_gathering;
            self.notify(PeerConnectionEvent::IceGatheringStateChanged(ice_gathering));
        }

        if ice_connection != self.ice_connection {
            log::debug!(
                "ice connection state {:?} -> {ice_connection:?}",
                self.ice_connection
            );
            self.ice_connection = ice_connection;
            self.notify(PeerConnectionEvent::IceConnectionStateChanged(ice_connection));
        }

        if connection != self.connection {
            log::info!("connection state {:?} -> {connection:?}", self.connection);
            self.connection = connection;
            self.notify(PeerConnectionEvent::ConnectionStateChanged(connection));
        }

        if closed {
            return;
        }

        if self.negotiation_needed() {
            if signaling == SignalingState::Stable && !self.negotiation_needed_announced {
                self.negotiation_needed_announced = true;
                self.notify(PeerConnectionEvent::NegotiationNeeded);
            }
        } else {
            self.negotiation_needed_announced = false;
        }
    }

    fn start_shutdown(&mut self) {
        log::debug!("shutting down peer connection");

        self.lifecycle = InternalState::ShuttingDown;

        for method in take(&mut self.pending_methods) {
            method.fail(Error::Shutdown);
        }

        self.pending_candidates.clear();

        for mut pooled in take(&mut self.candidate_pool).into_values() {
            pooled.details.stop(false);
        }

        for channel in take(&mut self.data_channels).into_values() {
            if let Some(event) = channel.set_closed() {
                self.notify_channel(&channel, event);
            }
        }

        for sender in self.senders.values_mut() {
            if let Some(rtp_sender) = &mut sender.sender {
                rtp_sender.stop();
            }
        }

        for receiver in self.receivers.values_mut() {
            if let Some(rtp_receiver) = &mut receiver.receiver {
                rtp_receiver.stop();
            }
        }

        for transport in self.transports.values_mut() {
            Self::stop_transport(transport);
        }
    }

    /// Finalize the shutdown once all ICE transports confirmed their closure
    fn finish_shutdown(&mut self) {
        if self.lifecycle != InternalState::ShuttingDown {
            return;
        }

        if !self.transports.values().all(TransportInfo::is_closed) {
            return;
        }

        log::debug!("peer connection shut down");

        self.lifecycle = InternalState::Shutdown;
        self.transports.clear();
        self.rtp_media_lines.clear();
        self.sctp_media_lines.clear();
        self.senders.clear();
        self.receivers.clear();
    }
}
