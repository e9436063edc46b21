use crate::{
    DataChannel, IceConnectionState, IceGatheringState, MediaLineId, PeerConnectionState,
    ReceiverId, SignalingState, TransportError, TransportId, engine::Inner,
    transport::IceCandidateInit,
};
use rtp_params::MediaKind;
use std::sync::Weak;

/// Notification emitted by the [`PeerConnection`](crate::PeerConnection)
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    SignalingStateChanged(SignalingState),
    IceGatheringStateChanged(IceGatheringState),
    IceConnectionStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    /// Local changes (tracks, data channels) require a new offer/answer exchange
    NegotiationNeeded,
    /// A local candidate to send to the peer, a `None` candidate marks the end of candidates
    IceCandidate(IceCandidateInit),
    IceCandidateRemoved(IceCandidateInit),
    TrackAdded {
        receiver_id: ReceiverId,
        kind: MediaKind,
        track_id: String,
        stream_ids: Vec<String>,
    },
    TrackRemoved {
        receiver_id: ReceiverId,
    },
    /// The answer didn't accept the media line, it has been removed
    MediaLineRejected {
        id: MediaLineId,
    },
    /// The peer opened a data channel
    DataChannel(DataChannel),
    TransportError {
        transport_id: TransportId,
        error: TransportError,
    },
}

pub trait PeerConnectionDelegate: Send + Sync {
    fn on_event(&self, event: &PeerConnectionEvent);
}

impl<F> PeerConnectionDelegate for F
where
    F: Fn(&PeerConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &PeerConnectionEvent) {
        self(event)
    }
}

/// Registration of a [`PeerConnectionDelegate`], see [`PeerConnection::subscribe`](crate::PeerConnection::subscribe).
///
/// Dropping the subscription keeps the delegate registered, use [`Subscription::cancel`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub(crate) fn new(id: u64, inner: Weak<Inner>) -> Self {
        Self { id, inner }
    }

    pub fn cancel(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}
