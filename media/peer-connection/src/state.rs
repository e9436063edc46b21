use crate::{
    DescriptionType,
    transport::{DtlsTransportState, IceGathererState, IceTransportState, SctpTransportState},
};
use serde::{Deserialize, Serialize};

/// Lifecycle of the peer connection, only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InternalState {
    Pending,
    Ready,
    ShuttingDown,
    Shutdown,
}

/// Agreement status of a transport, media line, sender or receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    /// Both descriptions concur
    Agreed,
    /// Not yet part of any description
    PendingOffer,
    LocalOffered,
    RemoteOffered,
    /// Omitted by the answer, about to be removed
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPrAnswer,
    HaveRemotePrAnswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Aggregated ICE connection state.
///
/// Ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IceConnectionState {
    Failed,
    Disconnected,
    New,
    Checking,
    Connected,
    Completed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub(crate) fn signaling_state(
    closed: bool,
    pending_local: Option<DescriptionType>,
    pending_remote: Option<DescriptionType>,
) -> SignalingState {
    if closed {
        return SignalingState::Closed;
    }

    match (pending_local, pending_remote) {
        (Some(DescriptionType::PrAnswer), _) => SignalingState::HaveLocalPrAnswer,
        (_, Some(DescriptionType::PrAnswer)) => SignalingState::HaveRemotePrAnswer,
        (Some(DescriptionType::Offer), _) => SignalingState::HaveLocalOffer,
        (_, Some(DescriptionType::Offer)) => SignalingState::HaveRemoteOffer,
        _ => SignalingState::Stable,
    }
}

pub(crate) fn ice_gathering_state(
    states: impl IntoIterator<Item = IceGathererState>,
) -> IceGatheringState {
    let mut any = false;
    let mut all_complete = true;
    let mut all_new = true;

    for state in states {
        if state == IceGathererState::Closed {
            continue;
        }

        any = true;
        all_complete &= state == IceGathererState::Complete;
        all_new &= state == IceGathererState::New;
    }

    if !any || all_new {
        IceGatheringState::New
    } else if all_complete {
        IceGatheringState::Complete
    } else {
        IceGatheringState::Gathering
    }
}

impl From<IceTransportState> for IceConnectionState {
    fn from(state: IceTransportState) -> Self {
        match state {
            IceTransportState::New => Self::New,
            IceTransportState::Checking => Self::Checking,
            IceTransportState::Connected => Self::Connected,
            IceTransportState::Completed => Self::Completed,
            IceTransportState::Disconnected => Self::Disconnected,
            IceTransportState::Failed => Self::Failed,
            IceTransportState::Closed => Self::Closed,
        }
    }
}

/// Aggregate over all transports, closed transports are ignored.
///
/// Failures and disconnects win. Any transport that is still new or checking keeps the
/// aggregate checking, unless none of them has started checking yet.
pub(crate) fn ice_connection_state(
    states: impl IntoIterator<Item = IceTransportState>,
) -> IceConnectionState {
    use IceConnectionState::*;

    let states: Vec<_> = states
        .into_iter()
        .map(IceConnectionState::from)
        .filter(|state| *state != Closed)
        .collect();

    let any = |wanted: IceConnectionState| states.contains(&wanted);

    if any(Failed) {
        Failed
    } else if any(Disconnected) {
        Disconnected
    } else if states.iter().all(|state| *state == New) {
        New
    } else if any(New) || any(Checking) {
        Checking
    } else if states.iter().all(|state| *state == Completed) {
        Completed
    } else {
        Connected
    }
}

pub(crate) fn peer_connection_state(
    closed: bool,
    ice: IceConnectionState,
    dtls: impl IntoIterator<Item = DtlsTransportState>,
    sctp: impl IntoIterator<Item = SctpTransportState>,
) -> PeerConnectionState {
    if closed {
        return PeerConnectionState::Closed;
    }

    let dtls: Vec<_> = dtls
        .into_iter()
        .filter(|state| *state != DtlsTransportState::Closed)
        .collect();
    let sctp: Vec<_> = sctp
        .into_iter()
        .filter(|state| *state != SctpTransportState::Closed)
        .collect();

    if ice == IceConnectionState::Failed || dtls.contains(&DtlsTransportState::Failed) {
        return PeerConnectionState::Failed;
    }

    if ice == IceConnectionState::Disconnected {
        return PeerConnectionState::Disconnected;
    }

    let ice_connected = matches!(
        ice,
        IceConnectionState::Connected | IceConnectionState::Completed
    );

    if ice_connected
        && dtls.iter().all(|s| *s == DtlsTransportState::Connected)
        && sctp.iter().all(|s| *s == SctpTransportState::Connected)
    {
        return PeerConnectionState::Connected;
    }

    if ice == IceConnectionState::New
        && dtls.iter().all(|s| *s == DtlsTransportState::New)
        && sctp.iter().all(|s| *s == SctpTransportState::New)
    {
        return PeerConnectionState::New;
    }

    PeerConnectionState::Connecting
}
