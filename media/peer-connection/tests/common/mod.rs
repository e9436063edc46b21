#![allow(dead_code)]

use ezk_peer_connection::{
    Configuration, DataChannelParameters, DataMessage, Deferred, Error, IceServer,
    IceTransportPolicy, PeerConnection, PeerConnectionEvent, SessionDescription, TransportError,
    TransportId,
    rtp_params::{CodecParameters, MediaKind, RtpCapabilities, RtpParameters},
    transport::{
        CapabilityDirection, DataTransport, DtlsFingerprint, DtlsParameters, DtlsRole,
        DtlsTransport, IceCandidate, IceCandidateType, IceComponent, IceGatherer, IceParameters,
        IceProtocol, IceRole, IceTransport, IceTransportEvent, IceTransportState, MediaTrack,
        RtpReceiver, RtpSender, SctpCapabilities, SctpTransport, SrtpCryptoParameters,
        SrtpSdesParameters, SrtpSdesTransport, TransportEvent, TransportEventSink,
        TransportFactory,
    },
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Everything the mock collaborators were asked to do
#[derive(Default)]
pub(crate) struct Mock {
    /// Don't support video at all, audio is always available
    pub(crate) no_video: bool,

    pub(crate) gathers: Mutex<Vec<(TransportId, IceComponent)>>,
    pub(crate) ice_starts: Mutex<Vec<(TransportId, IceComponent, IceRole, String)>>,
    pub(crate) remote_candidates: Mutex<Vec<(TransportId, IceCandidate)>>,
    pub(crate) dtls_starts: Mutex<Vec<(TransportId, DtlsRole)>>,
    pub(crate) sdes_starts: Mutex<Vec<TransportId>>,
    pub(crate) sctp_starts: Mutex<Vec<(TransportId, Option<u16>)>>,
    pub(crate) sent: Mutex<Vec<(String, RtpParameters)>>,
    pub(crate) received: Mutex<Vec<(TransportId, RtpParameters)>>,
    pub(crate) stopped_senders: Mutex<Vec<String>>,
    pub(crate) receivers_created: Mutex<usize>,

    pub(crate) ice_sinks: Mutex<BTreeMap<(TransportId, IceComponent), TransportEventSink>>,
    pub(crate) sctp_sinks: Mutex<BTreeMap<TransportId, TransportEventSink>>,
    pub(crate) data: Mutex<BTreeMap<TransportId, Arc<MockDataTransport>>>,
}

impl Mock {
    pub(crate) fn push_ice_state(
        &self,
        transport_id: &str,
        component: IceComponent,
        state: IceTransportState,
    ) {
        let sink = self.ice_sinks.lock()[&(TransportId::from(transport_id), component)].clone();

        sink.push(TransportEvent::IceTransport {
            transport_id: transport_id.into(),
            component,
            event: IceTransportEvent::StateChange(state),
        });
    }

    pub(crate) fn ice_sink(&self, transport_id: &str) -> TransportEventSink {
        self.ice_sinks.lock()[&(TransportId::from(transport_id), IceComponent::Rtp)].clone()
    }

    pub(crate) fn sctp_sink(&self, transport_id: &str) -> TransportEventSink {
        self.sctp_sinks.lock()[&TransportId::from(transport_id)].clone()
    }

    pub(crate) fn data_transport(&self, transport_id: &str) -> Arc<MockDataTransport> {
        self.data.lock()[&TransportId::from(transport_id)].clone()
    }
}

pub(crate) struct MockFactory {
    mock: Arc<Mock>,
}

impl MockFactory {
    pub(crate) fn new() -> (Self, Arc<Mock>) {
        Self::with_mock(Mock::default())
    }

    pub(crate) fn with_mock(mock: Mock) -> (Self, Arc<Mock>) {
        let mock = Arc::new(mock);
        (Self { mock: mock.clone() }, mock)
    }
}

struct MockGatherer {
    transport_id: TransportId,
    component: IceComponent,
    generation: u32,
    mock: Arc<Mock>,
}

impl IceGatherer for MockGatherer {
    fn local_parameters(&self) -> Option<IceParameters> {
        Some(IceParameters {
            username_fragment: format!(
                "{}{:?}{}",
                self.transport_id, self.component, self.generation
            ),
            password: "0123456789abcdef01234567".into(),
            ice_lite: false,
        })
    }

    fn gather(&mut self, _: &[IceServer], _: IceTransportPolicy) {
        self.mock
            .gathers
            .lock()
            .push((self.transport_id.clone(), self.component));
    }

    fn restart(&mut self) {
        self.generation += 1;
    }

    fn close(&mut self) {}
}

struct MockIce {
    transport_id: TransportId,
    component: IceComponent,
    sink: TransportEventSink,
    mock: Arc<Mock>,
}

impl IceTransport for MockIce {
    fn start(
        &mut self,
        remote: &IceParameters,
        role: IceRole,
    ) -> Result<(), TransportError> {
        self.mock.ice_starts.lock().push((
            self.transport_id.clone(),
            self.component,
            role,
            remote.username_fragment.clone(),
        ));
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) {
        self.mock
            .remote_candidates
            .lock()
            .push((self.transport_id.clone(), candidate.clone()));
    }

    fn end_of_remote_candidates(&mut self) {}

    fn stop(&mut self) {
        self.sink.push(TransportEvent::IceTransport {
            transport_id: self.transport_id.clone(),
            component: self.component,
            event: IceTransportEvent::StateChange(IceTransportState::Closed),
        });
    }
}

struct MockDtls {
    transport_id: TransportId,
    mock: Arc<Mock>,
}

impl DtlsTransport for MockDtls {
    fn local_parameters(&self) -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AB:CD:EF".into(),
            }],
        }
    }

    fn start(&mut self, remote: &DtlsParameters) -> Result<(), TransportError> {
        self.mock
            .dtls_starts
            .lock()
            .push((self.transport_id.clone(), remote.role));
        Ok(())
    }

    fn stop(&mut self) {}
}

struct MockSdes {
    transport_id: TransportId,
    mock: Arc<Mock>,
}

impl SrtpSdesTransport for MockSdes {
    fn local_parameters(&self) -> SrtpSdesParameters {
        SrtpSdesParameters {
            crypto_params: vec![SrtpCryptoParameters {
                tag: 1,
                crypto_suite: "AES_CM_128_HMAC_SHA1_80".into(),
                key_params: vec!["inline:WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz".into()],
            }],
        }
    }

    fn start(
        &mut self,
        _: &SrtpSdesParameters,
    ) -> Result<(), TransportError> {
        self.mock.sdes_starts.lock().push(self.transport_id.clone());
        Ok(())
    }

    fn stop(&mut self) {}
}

struct MockSctp {
    transport_id: TransportId,
    data: Arc<MockDataTransport>,
    mock: Arc<Mock>,
}

impl SctpTransport for MockSctp {
    fn start(
        &mut self,
        _: &SctpCapabilities,
        port: Option<u16>,
    ) -> Result<(), TransportError> {
        self.mock
            .sctp_starts
            .lock()
            .push((self.transport_id.clone(), port));
        Ok(())
    }

    fn data_transport(&self) -> Arc<dyn DataTransport> {
        self.data.clone()
    }

    fn stop(&mut self) {}
}

#[derive(Default)]
pub(crate) struct MockDataTransport {
    pub(crate) opened: Mutex<Vec<(u16, String)>>,
    pub(crate) sent: Mutex<Vec<(u16, DataMessage)>>,
    pub(crate) reset: Mutex<Vec<u16>>,
}

impl DataTransport for MockDataTransport {
    fn open_stream(
        &self,
        stream_id: u16,
        parameters: &DataChannelParameters,
    ) -> Result<(), TransportError> {
        self.opened
            .lock()
            .push((stream_id, parameters.label.clone()));
        Ok(())
    }

    fn send(
        &self,
        stream_id: u16,
        message: &DataMessage,
    ) -> Result<(), TransportError> {
        self.sent.lock().push((stream_id, message.clone()));
        Ok(())
    }

    fn reset_stream(&self, stream_id: u16) {
        self.reset.lock().push(stream_id);
    }
}

struct MockSender {
    track_id: String,
    mock: Arc<Mock>,
}

impl RtpSender for MockSender {
    fn send(&mut self, parameters: &RtpParameters) -> Result<(), TransportError> {
        self.mock
            .sent
            .lock()
            .push((self.track_id.clone(), parameters.clone()));
        Ok(())
    }

    fn stop(&mut self) {
        self.mock.stopped_senders.lock().push(self.track_id.clone());
    }
}

struct MockReceiver {
    transport_id: TransportId,
    track_id: String,
    mock: Arc<Mock>,
}

impl RtpReceiver for MockReceiver {
    fn receive(
        &mut self,
        parameters: &RtpParameters,
    ) -> Result<(), TransportError> {
        self.mock
            .received
            .lock()
            .push((self.transport_id.clone(), parameters.clone()));
        Ok(())
    }

    fn track_id(&self) -> String {
        self.track_id.clone()
    }

    fn stop(&mut self) {}
}

impl TransportFactory for MockFactory {
    fn create_ice_gatherer(
        &mut self,
        transport_id: &TransportId,
        component: IceComponent,
        _: TransportEventSink,
    ) -> Box<dyn IceGatherer> {
        Box::new(MockGatherer {
            transport_id: transport_id.clone(),
            component,
            generation: 0,
            mock: self.mock.clone(),
        })
    }

    fn create_ice_transport(
        &mut self,
        transport_id: &TransportId,
        component: IceComponent,
        sink: TransportEventSink,
    ) -> Box<dyn IceTransport> {
        self.mock
            .ice_sinks
            .lock()
            .insert((transport_id.clone(), component), sink.clone());

        Box::new(MockIce {
            transport_id: transport_id.clone(),
            component,
            sink,
            mock: self.mock.clone(),
        })
    }

    fn create_dtls_transport(
        &mut self,
        transport_id: &TransportId,
        _: IceComponent,
        _: TransportEventSink,
    ) -> Box<dyn DtlsTransport> {
        Box::new(MockDtls {
            transport_id: transport_id.clone(),
            mock: self.mock.clone(),
        })
    }

    fn create_srtp_sdes_transport(
        &mut self,
        transport_id: &TransportId,
        _: IceComponent,
        _: TransportEventSink,
    ) -> Box<dyn SrtpSdesTransport> {
        Box::new(MockSdes {
            transport_id: transport_id.clone(),
            mock: self.mock.clone(),
        })
    }

    fn create_sctp_transport(
        &mut self,
        transport_id: &TransportId,
        sink: TransportEventSink,
    ) -> Box<dyn SctpTransport> {
        let data = Arc::new(MockDataTransport::default());

        self.mock
            .sctp_sinks
            .lock()
            .insert(transport_id.clone(), sink);
        self.mock
            .data
            .lock()
            .insert(transport_id.clone(), data.clone());

        Box::new(MockSctp {
            transport_id: transport_id.clone(),
            data,
            mock: self.mock.clone(),
        })
    }

    fn create_rtp_sender(
        &mut self,
        _: &TransportId,
        track: &MediaTrack,
    ) -> Box<dyn RtpSender> {
        Box::new(MockSender {
            track_id: track.id.clone(),
            mock: self.mock.clone(),
        })
    }

    fn create_rtp_receiver(
        &mut self,
        transport_id: &TransportId,
        kind: MediaKind,
        _: TransportEventSink,
    ) -> Box<dyn RtpReceiver> {
        let n = {
            let mut created = self.mock.receivers_created.lock();
            *created += 1;
            *created
        };

        Box::new(MockReceiver {
            transport_id: transport_id.clone(),
            track_id: format!("remote-{kind:?}-{n}").to_lowercase(),
            mock: self.mock.clone(),
        })
    }

    fn rtp_capabilities(&self, kind: MediaKind, _: CapabilityDirection) -> RtpCapabilities {
        match kind {
            MediaKind::Audio => audio_capabilities(),
            MediaKind::Video if self.mock.no_video => RtpCapabilities::default(),
            MediaKind::Video => video_capabilities(),
        }
    }

    fn sctp_capabilities(&self) -> SctpCapabilities {
        SctpCapabilities {
            max_message_size: 262_144,
        }
    }
}

pub(crate) fn audio_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            CodecParameters::new("opus", 111)
                .with_channels(2)
                .with_parameter("minptime", "10")
                .with_feedback("transport-cc", None),
            CodecParameters::new("PCMU", 0),
            CodecParameters::new("telephone-event", 126).with_clock_rate(8000),
            CodecParameters::new("CN", 13).with_clock_rate(8000),
        ],
        ..Default::default()
    }
}

pub(crate) fn video_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            CodecParameters::new("VP8", 96)
                .with_feedback("nack", None)
                .with_feedback("nack", Some("pli")),
            CodecParameters::rtx(97, 96, 90_000),
            CodecParameters::new("H264", 98)
                .with_parameter("packetization-mode", "1")
                .with_parameter("profile-level-id", "42e01f"),
            CodecParameters::rtx(99, 98, 90_000),
            CodecParameters::new("red", 100).with_clock_rate(90_000),
            CodecParameters::new("ulpfec", 101),
        ],
        fec_mechanisms: vec!["red+ulpfec".into()],
        ..Default::default()
    }
}

pub(crate) fn audio_track(id: &str) -> MediaTrack {
    MediaTrack {
        id: id.into(),
        kind: MediaKind::Audio,
    }
}

pub(crate) fn video_track(id: &str) -> MediaTrack {
    MediaTrack {
        id: id.into(),
        kind: MediaKind::Video,
    }
}

pub(crate) fn candidate(port: u16) -> IceCandidate {
    IceCandidate {
        foundation: port.to_string(),
        component: IceComponent::Rtp,
        priority: 2_130_706_431,
        protocol: IceProtocol::Udp,
        address: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        typ: IceCandidateType::Host,
    }
}

pub(crate) fn make_peer(config: Configuration) -> (PeerConnection, Arc<Mock>) {
    make_peer_with(config, Mock::default())
}

pub(crate) fn make_peer_with(config: Configuration, mock: Mock) -> (PeerConnection, Arc<Mock>) {
    init_logger();

    let (factory, mock) = MockFactory::with_mock(mock);
    let peer = PeerConnection::new(config, factory).unwrap();

    (peer, mock)
}

/// Step the peer connection until it has no more work queued
pub(crate) fn drive(peer: &PeerConnection) {
    for _ in 0..1000 {
        if !peer.needs_step() {
            return;
        }

        peer.step();
    }

    panic!("peer connection keeps requesting steps");
}

/// Drive the peer connection and take the result of the operation
pub(crate) fn resolve<T>(peer: &PeerConnection, deferred: Result<Deferred<T>, Error>) -> Result<T, Error> {
    let mut deferred = deferred?;

    drive(peer);

    deferred
        .try_result()
        .expect("operation must be resolved once the peer connection is idle")
}

/// Collect every event emitted by the peer connection
pub(crate) fn record_events(peer: &PeerConnection) -> Arc<Mutex<Vec<PeerConnectionEvent>>> {
    let events = Arc::new(Mutex::new(vec![]));

    let recorder = events.clone();
    // registration stays active for the lifetime of the peer connection
    let _subscription = peer.subscribe(move |event: &PeerConnectionEvent| {
        recorder.lock().push(event.clone());
    });

    events
}

pub(crate) fn create_offer(peer: &PeerConnection) -> SessionDescription {
    resolve(peer, peer.create_offer(Default::default())).unwrap()
}

/// Run a complete offer/answer exchange, returns offer and answer
pub(crate) fn negotiate(
    offerer: &PeerConnection,
    answerer: &PeerConnection,
) -> (SessionDescription, SessionDescription) {
    let offer = create_offer(offerer);
    resolve(offerer, offerer.set_local_description(offer.clone())).unwrap();

    resolve(answerer, answerer.set_remote_description(offer.clone())).unwrap();
    let answer = resolve(answerer, answerer.create_answer(Default::default())).unwrap();
    resolve(answerer, answerer.set_local_description(answer.clone())).unwrap();

    resolve(offerer, offerer.set_remote_description(answer.clone())).unwrap();

    (offer, answer)
}
