//! # RTP parameters & codec negotiation
//!
//! Plain data types describing RTP codecs, encodings and capabilities, plus the pure functions used to
//! reconcile them during offer/answer negotiation:
//!
//! - [`split_params_into_channels`] groups encodings into channels (a base encoding plus everything depending on it)
//! - [`calculate_delta_changes_in_channels`] matches old and new channels and reports what changed
//! - [`is_compatible_codec`] / [`find_codec`] / [`pick_codec`] and friends select codecs from a parameter set
//! - [`intersect_capabilities`] / [`negotiate_parameters`] narrow parameters down to what a peer supports
//!
//! Nothing in here owns state, every function works on borrowed values.

#![deny(unsafe_code)]

mod capabilities;
mod channels;
mod codec;
mod compat;
mod find;
mod params;

pub use capabilities::{intersect_capabilities, negotiate_parameters};
pub use channels::{ChannelDelta, calculate_delta_changes_in_channels, split_params_into_channels};
pub use codec::{CodecKind, CodecRole, MediaKind, SupportedCodec};
pub use compat::{
    MAX_CODEC_RANK, is_compatible_codec, is_generalized_ssrc_compatible_change, is_rankable_match,
};
pub use find::{
    EncodingToFill, FindCodecOptions, codecs_kind, find_codec, find_encoding_base, pick_codec,
    pick_encoding_to_fill, pick_fec_codec, pick_rtx_codec,
};
pub use params::{
    CodecParameters, EncodingParameters, FecParameters, HeaderExtensionParameters,
    RtcpFeedback, RtcpParameters, RtpCapabilities, RtpParameters, RtxParameters,
};
