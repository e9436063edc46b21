//! Structured session descriptions exchanged over the signaling channel
//!
//! There is no SDP here, descriptions are plain data which can be (de)serialized with serde,
//! [`SessionDescription::to_json`] and [`SessionDescription::from_json`] offer a JSON encoding.

use crate::{
    Error, MediaLineId, SenderId, TransportId,
    transport::{
        DtlsParameters, IceCandidate, IceParameters, SctpCapabilities, SrtpSdesParameters,
    },
};
use rtp_params::{MediaKind, RtpCapabilities, RtpParameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionType {
    Offer,
    PrAnswer,
    Answer,
    Rollback,
    Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionType,
    #[serde(default)]
    pub description: Description,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetails {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Description {
    pub details: Option<SessionDetails>,
    pub transports: Vec<TransportDescription>,
    pub rtp_media_lines: Vec<RtpMediaLine>,
    pub sctp_media_lines: Vec<SctpMediaLine>,
    pub rtp_senders: Vec<RtpSenderDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportParameters {
    pub ice: Option<IceParameters>,
    pub dtls: Option<DtlsParameters>,
    pub srtp_sdes: Option<SrtpSdesParameters>,
    pub candidates: Vec<IceCandidate>,
    pub end_of_candidates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportDescription {
    pub id: TransportId,
    pub rtp: TransportParameters,
    /// Separate RTCP transport, only present when RTCP muxing is not used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<TransportParameters>,
    #[serde(default)]
    pub use_mux: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn new(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => Self::SendRecv,
            (true, false) => Self::SendOnly,
            (false, true) => Self::RecvOnly,
            (false, false) => Self::Inactive,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Self::SendRecv | Self::RecvOnly)
    }

    /// The direction as seen from the peer
    pub fn flipped(self) -> Self {
        Self::new(self.receives(), self.sends())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpMediaLine {
    pub id: MediaLineId,
    pub line_index: usize,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub direction: MediaDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_capabilities: Option<RtpCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_capabilities: Option<RtpCapabilities>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SctpMediaLine {
    pub id: MediaLineId,
    pub line_index: usize,
    pub transport_id: TransportId,
    pub capabilities: SctpCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpSenderDescription {
    pub id: SenderId,
    pub media_line_id: MediaLineId,
    pub parameters: RtpParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(default)]
    pub stream_ids: Vec<String>,
}

impl SessionDescription {
    pub fn new(kind: DescriptionType, description: Description) -> Self {
        Self { kind, description }
    }

    pub fn rollback() -> Self {
        Self::new(DescriptionType::Rollback, Description::default())
    }

    pub fn is_answer(&self) -> bool {
        matches!(self.kind, DescriptionType::Answer | DescriptionType::PrAnswer)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidParameters(format!("failed to serialize description: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameters(format!("failed to parse description: {e}")))
    }

    /// Check that the description is consistent in itself.
    ///
    /// Ids and line indices must be unique, every media line's transport and every sender's media line must exist.
    pub fn validate(&self) -> Result<(), Error> {
        if self.kind == DescriptionType::Rollback {
            return Ok(());
        }

        let d = &self.description;

        let mut transport_ids = BTreeSet::new();
        for transport in &d.transports {
            if !transport_ids.insert(&transport.id) {
                return Err(invalid(format!("duplicate transport id {}", transport.id)));
            }

            // offers may carry an rtcp transport as fallback, answers must decide
            if transport.rtcp.is_some() && transport.use_mux && self.is_answer() {
                return Err(invalid(format!(
                    "transport {} uses rtcp-mux but has a separate rtcp transport",
                    transport.id
                )));
            }
        }

        let lines = d
            .rtp_media_lines
            .iter()
            .map(|l| (&l.id, l.line_index, &l.transport_id))
            .chain(
                d.sctp_media_lines
                    .iter()
                    .map(|l| (&l.id, l.line_index, &l.transport_id)),
            );

        let mut line_ids = BTreeSet::new();
        let mut line_indices = BTreeSet::new();

        for (id, line_index, transport_id) in lines {
            if !line_ids.insert(id) {
                return Err(invalid(format!("duplicate media line id {id}")));
            }

            if !line_indices.insert(line_index) {
                return Err(invalid(format!("duplicate media line index {line_index}")));
            }

            if !transport_ids.contains(transport_id) {
                return Err(invalid(format!(
                    "media line {id} references unknown transport {transport_id}"
                )));
            }
        }

        let mut sender_ids = BTreeSet::new();
        for sender in &d.rtp_senders {
            if !sender_ids.insert(&sender.id) {
                return Err(invalid(format!("duplicate sender id {}", sender.id)));
            }

            let line = d
                .rtp_media_lines
                .iter()
                .find(|l| l.id == sender.media_line_id)
                .ok_or_else(|| {
                    invalid(format!(
                        "sender {} references unknown rtp media line {}",
                        sender.id, sender.media_line_id
                    ))
                })?;

            if let Some(kind) = rtp_params::codecs_kind(&sender.parameters)
                && kind != line.kind
            {
                return Err(invalid(format!(
                    "sender {} carries {kind:?} codecs on a {:?} media line",
                    sender.id, line.kind
                )));
            }
        }

        Ok(())
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidParameters(reason)
}

impl Description {
    pub(crate) fn rtp_media_line(&self, id: &MediaLineId) -> Option<&RtpMediaLine> {
        self.rtp_media_lines.iter().find(|l| l.id == *id)
    }

    pub(crate) fn sctp_media_line(&self, id: &MediaLineId) -> Option<&SctpMediaLine> {
        self.sctp_media_lines.iter().find(|l| l.id == *id)
    }

    pub(crate) fn transport(&self, id: &TransportId) -> Option<&TransportDescription> {
        self.transports.iter().find(|t| t.id == *id)
    }

    pub(crate) fn has_media_line(&self, id: &MediaLineId) -> bool {
        self.rtp_media_line(id).is_some() || self.sctp_media_line(id).is_some()
    }

    /// Media line ids in description order
    pub(crate) fn media_line_ids(&self) -> Vec<(usize, MediaLineId)> {
        let mut ids: Vec<_> = self
            .rtp_media_lines
            .iter()
            .map(|l| (l.line_index, l.id.clone()))
            .chain(
                self.sctp_media_lines
                    .iter()
                    .map(|l| (l.line_index, l.id.clone())),
            )
            .collect();

        ids.sort();
        ids
    }
}
