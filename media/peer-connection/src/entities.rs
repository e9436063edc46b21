//! Records kept by the engine for every negotiated object. Cross references are ids resolved through the
//! engine's maps.

use crate::{
    Deferred, Error, MediaDirection, MediaLineId, NegotiationState, ReceiverId,
    SecureTransportType, SenderId, SessionDescription, TransportId,
    deferred::Completer,
    description::{RtpMediaLine, SctpMediaLine, TransportDescription},
    engine::{AnswerOptions, CapabilityOptions, OfferOptions},
    transport::{
        DtlsTransport, DtlsTransportState, IceCandidate, IceComponent, IceGatherer,
        IceGathererState, IceTransport, IceTransportState, MediaTrack, RtpReceiver, RtpSender,
        SctpTransport, SctpTransportState, SrtpSdesTransport,
    },
};
use rtp_params::{MediaKind, RtpCapabilities, RtpParameters};
use std::collections::BTreeSet;

pub(crate) enum SecureTransport {
    Dtls {
        transport: Box<dyn DtlsTransport>,
        state: DtlsTransportState,
    },
    SrtpSdes(Box<dyn SrtpSdesTransport>),
}

impl SecureTransport {
    pub(crate) fn stop(&mut self) {
        match self {
            Self::Dtls { transport, .. } => transport.stop(),
            Self::SrtpSdes(transport) => transport.stop(),
        }
    }
}

/// Per component (RTP or RTCP) part of a transport
pub(crate) struct TransportDetails {
    pub(crate) gatherer: Box<dyn IceGatherer>,
    pub(crate) gatherer_state: IceGathererState,
    pub(crate) ice: Box<dyn IceTransport>,
    pub(crate) ice_state: IceTransportState,
    pub(crate) candidates: Vec<IceCandidate>,
    pub(crate) end_of_candidates: bool,
    pub(crate) secure: Option<SecureTransport>,
}

impl TransportDetails {
    pub(crate) fn dtls_state(&self) -> Option<DtlsTransportState> {
        match &self.secure {
            Some(SecureTransport::Dtls { state, .. }) => Some(*state),
            _ => None,
        }
    }

    pub(crate) fn stop(&mut self, started: bool) {
        self.gatherer.close();
        self.gatherer_state = IceGathererState::Closed;

        if let Some(secure) = &mut self.secure {
            secure.stop();
        }

        if started {
            self.ice.stop();
        } else {
            self.ice_state = IceTransportState::Closed;
        }
    }
}

/// RTP component of a transport created ahead of time to pre-gather candidates
pub(crate) struct PooledTransport {
    pub(crate) secure: SecureTransportType,
    pub(crate) details: TransportDetails,
}

pub(crate) struct TransportInfo {
    pub(crate) id: TransportId,
    pub(crate) negotiation: NegotiationState,
    pub(crate) rtp: TransportDetails,
    pub(crate) rtcp: Option<TransportDetails>,
    pub(crate) sctp: Option<SctpInfo>,
    /// ICE transports have been started with the remote parameters
    pub(crate) started: bool,
    /// Gatherers were restarted, the ICE transports must be restarted with the next remote parameters
    pub(crate) restarting: bool,
    /// Description of the peer's side, once known
    pub(crate) remote: Option<TransportDescription>,
}

pub(crate) struct SctpInfo {
    pub(crate) transport: Box<dyn SctpTransport>,
    pub(crate) state: SctpTransportState,
    pub(crate) started: bool,
}

impl TransportInfo {
    pub(crate) fn details(&self) -> impl Iterator<Item = &TransportDetails> {
        std::iter::once(&self.rtp).chain(self.rtcp.as_ref())
    }

    pub(crate) fn details_mut(&mut self) -> impl Iterator<Item = &mut TransportDetails> {
        std::iter::once(&mut self.rtp).chain(self.rtcp.as_mut())
    }

    pub(crate) fn component_mut(&mut self, component: IceComponent) -> Option<&mut TransportDetails> {
        match component {
            IceComponent::Rtp => Some(&mut self.rtp),
            IceComponent::Rtcp => self.rtcp.as_mut(),
        }
    }

    /// All ICE transports that were started confirmed their closure
    pub(crate) fn is_closed(&self) -> bool {
        self.details()
            .all(|details| details.ice_state == IceTransportState::Closed)
    }
}

pub(crate) struct RtpMediaLineInfo {
    pub(crate) id: MediaLineId,
    pub(crate) line_index: usize,
    pub(crate) transport_id: TransportId,
    pub(crate) negotiation: NegotiationState,
    pub(crate) kind: MediaKind,
    /// Our side's direction in the last description we created or applied
    pub(crate) direction: MediaDirection,
    pub(crate) local_sender_capabilities: RtpCapabilities,
    pub(crate) local_receiver_capabilities: RtpCapabilities,
    pub(crate) remote: Option<RtpMediaLine>,
    pub(crate) senders: BTreeSet<SenderId>,
    pub(crate) receivers: BTreeSet<ReceiverId>,
}

pub(crate) struct SctpMediaLineInfo {
    pub(crate) id: MediaLineId,
    pub(crate) line_index: usize,
    pub(crate) transport_id: TransportId,
    pub(crate) negotiation: NegotiationState,
    pub(crate) port: u16,
    pub(crate) remote: Option<SctpMediaLine>,
}

pub(crate) struct SenderInfo {
    pub(crate) id: SenderId,
    pub(crate) media_line_id: Option<MediaLineId>,
    pub(crate) negotiation: NegotiationState,
    pub(crate) track: MediaTrack,
    pub(crate) stream_ids: Vec<String>,
    pub(crate) sender: Option<Box<dyn RtpSender>>,
    /// Transport the `sender` was created for
    pub(crate) sender_transport: Option<TransportId>,
    /// Parameters put into the last local description
    pub(crate) offered: Option<RtpParameters>,
    /// Parameters the RTP sender was last started with
    pub(crate) parameters: Option<RtpParameters>,
}

pub(crate) struct ReceiverInfo {
    pub(crate) id: ReceiverId,
    pub(crate) media_line_id: MediaLineId,
    pub(crate) negotiation: NegotiationState,
    pub(crate) kind: MediaKind,
    /// Id of the peer's sender description this receiver belongs to
    pub(crate) remote_sender_id: SenderId,
    pub(crate) track_id: String,
    pub(crate) stream_ids: Vec<String>,
    pub(crate) receiver: Option<Box<dyn RtpReceiver>>,
    pub(crate) receiver_transport: Option<TransportId>,
    /// Parameters the RTP receiver was last started with
    pub(crate) parameters: Option<RtpParameters>,
}

pub(crate) enum PendingMethod {
    CreateOffer {
        options: OfferOptions,
        completer: Completer<SessionDescription>,
    },
    CreateAnswer {
        options: AnswerOptions,
        completer: Completer<SessionDescription>,
    },
    CreateCapabilities {
        options: CapabilityOptions,
        completer: Completer<SessionDescription>,
    },
    SetLocalDescription {
        description: SessionDescription,
        completer: Completer<()>,
    },
    SetRemoteDescription {
        description: SessionDescription,
        completer: Completer<()>,
    },
}

impl PendingMethod {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::CreateOffer { .. } => "create_offer",
            Self::CreateAnswer { .. } => "create_answer",
            Self::CreateCapabilities { .. } => "create_capabilities",
            Self::SetLocalDescription { .. } => "set_local_description",
            Self::SetRemoteDescription { .. } => "set_remote_description",
        }
    }

    pub(crate) fn fail(self, error: Error) {
        match self {
            Self::CreateOffer { completer, .. }
            | Self::CreateAnswer { completer, .. }
            | Self::CreateCapabilities { completer, .. } => completer.complete(Err(error)),
            Self::SetLocalDescription { completer, .. }
            | Self::SetRemoteDescription { completer, .. } => completer.complete(Err(error)),
        }
    }

    pub(crate) fn create_offer(options: OfferOptions) -> (Self, Deferred<SessionDescription>) {
        let (completer, deferred) = crate::deferred::deferred();
        (Self::CreateOffer { options, completer }, deferred)
    }

    pub(crate) fn create_answer(options: AnswerOptions) -> (Self, Deferred<SessionDescription>) {
        let (completer, deferred) = crate::deferred::deferred();
        (Self::CreateAnswer { options, completer }, deferred)
    }

    pub(crate) fn create_capabilities(
        options: CapabilityOptions,
    ) -> (Self, Deferred<SessionDescription>) {
        let (completer, deferred) = crate::deferred::deferred();
        (Self::CreateCapabilities { options, completer }, deferred)
    }

    pub(crate) fn set_local_description(description: SessionDescription) -> (Self, Deferred<()>) {
        let (completer, deferred) = crate::deferred::deferred();
        (
            Self::SetLocalDescription {
                description,
                completer,
            },
            deferred,
        )
    }

    pub(crate) fn set_remote_description(description: SessionDescription) -> (Self, Deferred<()>) {
        let (completer, deferred) = crate::deferred::deferred();
        (
            Self::SetRemoteDescription {
                description,
                completer,
            },
            deferred,
        )
    }
}
