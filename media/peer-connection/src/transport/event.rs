use super::{
    DtlsTransportState, IceCandidate, IceComponent, IceGathererState, IceTransportState,
    SctpTransportState,
};
use crate::{
    DataChannelParameters, DataMessage, MediaLineId, TransportError, TransportId, engine::Inner,
};
use std::{fmt, sync::Weak};

#[derive(Debug, Clone)]
pub enum IceGathererEvent {
    StateChange(IceGathererState),
    CandidateAvailable(IceCandidate),
    /// All candidates have been gathered
    CandidateComplete,
    CandidateGone(IceCandidate),
    Error(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidatePair {
    pub local: IceCandidate,
    pub remote: IceCandidate,
}

#[derive(Debug, Clone)]
pub enum IceTransportEvent {
    StateChange(IceTransportState),
    CandidatePairAvailable(IceCandidatePair),
    CandidatePairGone(IceCandidatePair),
    /// The selected candidate pair changed
    CandidatePairChanged(IceCandidatePair),
}

#[derive(Debug, Clone)]
pub enum DtlsEvent {
    StateChange(DtlsTransportState),
    Error(TransportError),
}

#[derive(Debug, Clone)]
pub enum SrtpSdesEvent {
    /// Percentage of the key lifetime left
    LifetimeRemaining {
        least_key_percentage_remaining: u8,
        overall_percentage_remaining: u8,
    },
    Error(TransportError),
}

#[derive(Debug, Clone)]
pub enum RtpListenerEvent {
    /// An RTP packet arrived which couldn't be associated to any receiver's encoding
    UnhandledRtp {
        ssrc: u32,
        payload_type: u8,
        mid: Option<MediaLineId>,
        rid: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum SctpEvent {
    StateChange(SctpTransportState),
    /// The peer opened a data channel
    DataChannel {
        stream_id: u16,
        parameters: DataChannelParameters,
    },
    Message {
        stream_id: u16,
        message: DataMessage,
    },
    /// `bytes` of previously sent messages have been handed to the network
    Flushed { stream_id: u16, bytes: u64 },
    StreamClosed { stream_id: u16 },
}

/// Callback of a transport collaborator, tagged with the collaborator it originates from
#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceGatherer {
        transport_id: TransportId,
        component: IceComponent,
        event: IceGathererEvent,
    },
    IceTransport {
        transport_id: TransportId,
        component: IceComponent,
        event: IceTransportEvent,
    },
    Dtls {
        transport_id: TransportId,
        component: IceComponent,
        event: DtlsEvent,
    },
    SrtpSdes {
        transport_id: TransportId,
        component: IceComponent,
        event: SrtpSdesEvent,
    },
    RtpListener {
        transport_id: TransportId,
        event: RtpListenerEvent,
    },
    Sctp {
        transport_id: TransportId,
        event: SctpEvent,
    },
}

/// Handle given to transport collaborators to report events back to the peer connection.
///
/// Pushing never blocks on the step loop, the event is queued and handled in the next step.
/// Events pushed after the peer connection was dropped are discarded.
#[derive(Clone)]
pub struct TransportEventSink {
    inner: Weak<Inner>,
}

impl TransportEventSink {
    pub(crate) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }

    pub fn push(&self, event: TransportEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.push_event(event);
        } else {
            log::trace!("discarding transport event of dropped peer connection {event:?}");
        }
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink").finish_non_exhaustive()
    }
}
