//! Interfaces of the transport collaborators
//!
//! The peer connection does not implement ICE, DTLS, SRTP, SCTP or the RTP media pipeline itself. It creates the
//! objects implementing these traits through the [`TransportFactory`] passed into the [`PeerConnection`] and
//! receives their state changes as [`TransportEvent`]s pushed into a [`TransportEventSink`].
//!
//! [`PeerConnection`]: crate::PeerConnection

use crate::{
    DataChannelParameters, DataMessage, IceServer, IceTransportPolicy, TransportError, TransportId,
};
use rtp_params::{MediaKind, RtpCapabilities, RtpParameters};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

mod event;

pub use event::{
    DtlsEvent, IceCandidatePair, IceGathererEvent, IceTransportEvent, RtpListenerEvent, SctpEvent,
    SrtpSdesEvent, TransportEvent, TransportEventSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceComponent {
    Rtp,
    Rtcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    Controlling,
    Controlled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: IceComponent,
    pub priority: u32,
    pub protocol: IceProtocol,
    pub address: SocketAddr,
    #[serde(rename = "type")]
    pub typ: IceCandidateType,
}

/// A trickled candidate, associated with a media line by `mid` or line index.
///
/// A `None` candidate signals the end of candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<crate::MediaLineId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_index: Option<usize>,
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    /// Either role, decided by the answer
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtpCryptoParameters {
    pub tag: u16,
    pub crypto_suite: String,
    pub key_params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtpSdesParameters {
    pub crypto_params: Vec<SrtpCryptoParameters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SctpCapabilities {
    pub max_message_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGathererState {
    New,
    Gathering,
    Complete,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsTransportState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SctpTransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

/// Which side of a media line capabilities are requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDirection {
    Send,
    Receive,
}

/// A local media source, the peer connection only needs to know its identity and kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

pub trait IceGatherer: Send {
    /// Local credentials, `None` until they have been generated.
    ///
    /// A gatherer must push an event once they become available.
    fn local_parameters(&self) -> Option<IceParameters>;

    fn gather(&mut self, servers: &[IceServer], policy: IceTransportPolicy);

    /// Generate new credentials and gather again
    fn restart(&mut self);

    fn close(&mut self);
}

pub trait IceTransport: Send {
    fn start(&mut self, remote: &IceParameters, role: IceRole) -> Result<(), TransportError>;

    fn add_remote_candidate(&mut self, candidate: &IceCandidate);

    fn end_of_remote_candidates(&mut self);

    /// Must eventually report [`IceTransportState::Closed`]
    fn stop(&mut self);
}

pub trait DtlsTransport: Send {
    fn local_parameters(&self) -> DtlsParameters;

    fn start(&mut self, remote: &DtlsParameters) -> Result<(), TransportError>;

    fn stop(&mut self);
}

pub trait SrtpSdesTransport: Send {
    fn local_parameters(&self) -> SrtpSdesParameters;

    fn start(&mut self, remote: &SrtpSdesParameters) -> Result<(), TransportError>;

    fn stop(&mut self);
}

pub trait SctpTransport: Send {
    fn start(&mut self, remote: &SctpCapabilities, port: Option<u16>) -> Result<(), TransportError>;

    /// Stream level access used by data channels
    fn data_transport(&self) -> Arc<dyn DataTransport>;

    fn stop(&mut self);
}

/// The stream multiplexing part of an SCTP association.
///
/// Called directly from [`DataChannel`](crate::DataChannel)s, possibly from multiple threads.
pub trait DataTransport: Send + Sync {
    fn open_stream(
        &self,
        stream_id: u16,
        parameters: &DataChannelParameters,
    ) -> Result<(), TransportError>;

    /// Queue a message, completion is reported with [`SctpEvent::Flushed`]
    fn send(&self, stream_id: u16, message: &DataMessage) -> Result<(), TransportError>;

    /// Close the stream, completion is reported with [`SctpEvent::StreamClosed`]
    fn reset_stream(&self, stream_id: u16);
}

pub trait RtpSender: Send {
    fn send(&mut self, parameters: &RtpParameters) -> Result<(), TransportError>;

    fn stop(&mut self);
}

pub trait RtpReceiver: Send {
    fn receive(&mut self, parameters: &RtpParameters) -> Result<(), TransportError>;

    /// Id of the track the received media is delivered to
    fn track_id(&self) -> String;

    fn stop(&mut self);
}

/// Creates the transport collaborators of a [`PeerConnection`](crate::PeerConnection)
pub trait TransportFactory: Send {
    fn create_ice_gatherer(
        &mut self,
        transport_id: &TransportId,
        component: IceComponent,
        sink: TransportEventSink,
    ) -> Box<dyn IceGatherer>;

    fn create_ice_transport(
        &mut self,
        transport_id: &TransportId,
        component: IceComponent,
        sink: TransportEventSink,
    ) -> Box<dyn IceTransport>;

    fn create_dtls_transport(
        &mut self,
        transport_id: &TransportId,
        component: IceComponent,
        sink: TransportEventSink,
    ) -> Box<dyn DtlsTransport>;

    fn create_srtp_sdes_transport(
        &mut self,
        transport_id: &TransportId,
        component: IceComponent,
        sink: TransportEventSink,
    ) -> Box<dyn SrtpSdesTransport>;

    fn create_sctp_transport(
        &mut self,
        transport_id: &TransportId,
        sink: TransportEventSink,
    ) -> Box<dyn SctpTransport>;

    fn create_rtp_sender(
        &mut self,
        transport_id: &TransportId,
        track: &MediaTrack,
    ) -> Box<dyn RtpSender>;

    /// The receiver must report packets it cannot map to an encoding as [`RtpListenerEvent::UnhandledRtp`]
    fn create_rtp_receiver(
        &mut self,
        transport_id: &TransportId,
        kind: MediaKind,
        sink: TransportEventSink,
    ) -> Box<dyn RtpReceiver>;

    fn rtp_capabilities(&self, kind: MediaKind, direction: CapabilityDirection) -> RtpCapabilities;

    fn sctp_capabilities(&self) -> SctpCapabilities;

    /// ICE servers to use when the configuration doesn't list any
    fn default_ice_servers(&self) -> Vec<IceServer> {
        vec![]
    }
}
