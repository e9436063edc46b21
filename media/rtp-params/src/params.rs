use crate::{CodecKind, SupportedCodec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl RtcpFeedback {
    pub fn new(kind: impl Into<String>, parameter: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            parameter: parameter.map(Into::into),
        }
    }
}

/// A single codec entry of [`RtpParameters`] or [`RtpCapabilities`]
///
/// In capabilities `payload_type` is the preferred payload type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecParameters {
    pub name: String,
    pub payload_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ptime: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ptime: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_channels: Option<u32>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    /// Format specific parameters (`fmtp`)
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl CodecParameters {
    pub fn new(name: impl Into<String>, payload_type: u8) -> Self {
        let name = name.into();
        let supported = SupportedCodec::from_name(&name);

        Self {
            name,
            payload_type,
            clock_rate: supported.default_clock_rate(),
            ptime: None,
            max_ptime: None,
            num_channels: supported.default_channels(),
            rtcp_feedback: vec![],
            parameters: BTreeMap::new(),
        }
    }

    /// RTX codec for the given associated payload type
    pub fn rtx(payload_type: u8, apt: u8, clock_rate: u32) -> Self {
        Self::new("rtx", payload_type)
            .with_clock_rate(clock_rate)
            .with_parameter("apt", apt.to_string())
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = Some(clock_rate);
        self
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.num_channels = Some(channels);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_feedback(mut self, kind: &str, parameter: Option<&str>) -> Self {
        self.rtcp_feedback.push(RtcpFeedback::new(kind, parameter));
        self
    }

    pub fn supported_codec(&self) -> SupportedCodec {
        SupportedCodec::from_name(&self.name)
    }

    pub fn kind(&self) -> CodecKind {
        self.supported_codec().kind()
    }

    pub fn effective_clock_rate(&self) -> Option<u32> {
        self.clock_rate
            .or_else(|| self.supported_codec().default_clock_rate())
    }

    pub fn effective_channels(&self) -> u32 {
        self.num_channels
            .or_else(|| self.supported_codec().default_channels())
            .unwrap_or(1)
    }

    /// Associated payload type of an RTX codec
    pub fn apt(&self) -> Option<u8> {
        self.parameters.get("apt")?.trim().parse().ok()
    }

    pub(crate) fn set_apt(&mut self, apt: u8) {
        self.parameters.insert("apt".into(), apt.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
    #[serde(default)]
    pub encrypt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FecParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// e.g. `red`, `red+ulpfec` or `flexfec`
    pub mechanism: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RtxParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fec: Option<FecParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_scale: Option<f64>,
    #[serde(default = "active_default")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_id: Option<String>,
    /// Encodings (by `encoding_id`) this encoding depends on
    #[serde(default)]
    pub dependency_encoding_ids: Vec<String>,
}

fn active_default() -> bool {
    true
}

impl Default for EncodingParameters {
    fn default() -> Self {
        Self {
            ssrc: None,
            codec_payload_type: None,
            fec: None,
            rtx: None,
            max_bitrate: None,
            resolution_scale: None,
            active: true,
            encoding_id: None,
            dependency_encoding_ids: vec![],
        }
    }
}

impl EncodingParameters {
    /// Copy of the encoding with every SSRC removed
    pub(crate) fn without_ssrcs(&self) -> Self {
        let mut this = self.clone();
        this.ssrc = None;
        if let Some(rtx) = &mut this.rtx {
            rtx.ssrc = None;
        }
        if let Some(fec) = &mut this.fec {
            fec.ssrc = None;
        }
        this
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default)]
    pub reduced_size: bool,
    #[serde(default)]
    pub mux: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<String>,
    #[serde(default)]
    pub codecs: Vec<CodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<HeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<EncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// Parameters using all codecs and header extensions of the capabilities, without any encodings
    pub fn from_capabilities(capabilities: &RtpCapabilities) -> Self {
        Self {
            mux_id: None,
            codecs: capabilities.codecs.clone(),
            header_extensions: capabilities.header_extensions.clone(),
            encodings: vec![],
            rtcp: RtcpParameters {
                mux: true,
                ..Default::default()
            },
        }
    }
}

/// What a sender or receiver is able to handle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<CodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<HeaderExtensionParameters>,
    #[serde(default)]
    pub fec_mechanisms: Vec<String>,
}

impl RtpCapabilities {
    /// Returns if any codec can carry actual media
    pub fn has_media_codec(&self) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.kind().role() == crate::CodecRole::Media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_defaults_to_active_when_deserialized() {
        let encoding: EncodingParameters = serde_json::from_str(r#"{"ssrc": 1234}"#).unwrap();

        assert!(encoding.active);
        assert_eq!(encoding.ssrc, Some(1234));
        assert!(encoding.rtx.is_none());
    }

    #[test]
    fn codec_defaults_from_name() {
        let opus = CodecParameters::new("opus", 111);
        assert_eq!(opus.clock_rate, Some(48_000));
        assert_eq!(opus.num_channels, Some(2));

        let rtx = CodecParameters::rtx(97, 96, 90_000);
        assert_eq!(rtx.apt(), Some(96));
        assert_eq!(rtx.kind(), CodecKind::Rtx);
    }

    #[test]
    fn feedback_uses_type_key() {
        let fb = RtcpFeedback::new("nack", Some("pli"));
        let json = serde_json::to_string(&fb).unwrap();
        assert_eq!(json, r#"{"type":"nack","parameter":"pli"}"#);
    }
}
