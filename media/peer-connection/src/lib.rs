//! # Peer connection negotiation
//!
//! See [`PeerConnection`].
//!
//! Decides which transports, media lines, senders, receivers and data channels exist, tracks their negotiation state
//! over offer/answer exchanges and reconciles RTP parameters using [`rtp_params`] whenever a description is built
//! or applied.
//!
//! ICE, DTLS, SRTP, SCTP and the RTP media pipeline are not implemented here. They are provided by a
//! [`TransportFactory`] and report back through [`TransportEvent`]s.
//!
//! All state is mutated inside [`PeerConnection::step`]. API calls only enqueue work, asynchronous operations
//! return a [`Deferred`] which is resolved by the step loop. Use [`PeerConnection::spawn`] to let a tokio task
//! drive the loop, or [`PeerConnection::new`] and call `step` yourself.

#![deny(unsafe_code)]

mod config;
mod data_channel;
mod deferred;
mod description;
mod engine;
mod entities;
mod error;
mod event;
mod ids;
mod state;
pub mod transport;

pub use config::{
    BundlePolicy, Configuration, IceServer, IceTransportPolicy, RtcpMuxPolicy, SecureTransportType,
};
pub use data_channel::{
    DataChannel, DataChannelDelegate, DataChannelEvent, DataChannelParameters, DataChannelState,
    DataMessage,
};
pub use deferred::Deferred;
pub use description::{
    Description, DescriptionType, MediaDirection, RtpMediaLine, RtpSenderDescription,
    SctpMediaLine, SessionDescription, SessionDetails, TransportDescription, TransportParameters,
};
pub use engine::{
    AnswerOptions, CapabilityOptions, MediaLineSummary, OfferOptions, PeerConnection,
    ReceiverSummary, SenderSummary, TransportSummary,
};
pub use error::{Error, TransportError};
pub use event::{PeerConnectionDelegate, PeerConnectionEvent, Subscription};
pub use ids::{MediaLineId, ReceiverId, SenderId, TransportId};
pub use state::{
    IceConnectionState, IceGatheringState, InternalState, NegotiationState, PeerConnectionState,
    SignalingState,
};
pub use transport::{MediaTrack, TransportEvent, TransportEventSink, TransportFactory};

pub use rtp_params;
