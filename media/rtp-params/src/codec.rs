use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Codecs with known semantics. Anything else is [`SupportedCodec::Unknown`] and is only compared by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SupportedCodec {
    Opus,
    Isac,
    G722,
    Ilbc,
    Pcmu,
    Pcma,

    Vp8,
    Vp9,
    H264,
    Av1,

    Rtx,
    Red,
    Ulpfec,
    Flexfec,

    Cn,
    TelephoneEvent,

    Unknown,
}

/// What a codec carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CodecKind {
    Audio,
    Video,
    /// Usable for either audio or video (e.g. RED)
    AV,
    Rtx,
    Fec,
    /// Comfort noise, DTMF
    AudioSupplemental,
    Unknown,
}

/// The role a codec plays inside a set of RTP parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CodecRole {
    Media,
    Rtx,
    Fec,
    Supplemental,
}

const NAMES: &[(SupportedCodec, &str)] = &[
    (SupportedCodec::Opus, "opus"),
    (SupportedCodec::Isac, "ISAC"),
    (SupportedCodec::G722, "G722"),
    (SupportedCodec::Ilbc, "iLBC"),
    (SupportedCodec::Pcmu, "PCMU"),
    (SupportedCodec::Pcma, "PCMA"),
    (SupportedCodec::Vp8, "VP8"),
    (SupportedCodec::Vp9, "VP9"),
    (SupportedCodec::H264, "H264"),
    (SupportedCodec::Av1, "AV1"),
    (SupportedCodec::Rtx, "rtx"),
    (SupportedCodec::Red, "red"),
    (SupportedCodec::Ulpfec, "ulpfec"),
    (SupportedCodec::Flexfec, "flexfec"),
    (SupportedCodec::Cn, "CN"),
    (SupportedCodec::TelephoneEvent, "telephone-event"),
];

impl SupportedCodec {
    /// Case-insensitive lookup of the codec's encoding name
    pub fn from_name(name: &str) -> Self {
        NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(codec, _)| *codec)
            .unwrap_or(Self::Unknown)
    }

    pub fn name(&self) -> &'static str {
        NAMES
            .iter()
            .find(|(codec, _)| codec == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            Self::Opus | Self::Isac | Self::G722 | Self::Ilbc | Self::Pcmu | Self::Pcma => {
                CodecKind::Audio
            }
            Self::Vp8 | Self::Vp9 | Self::H264 | Self::Av1 => CodecKind::Video,
            Self::Rtx => CodecKind::Rtx,
            Self::Red => CodecKind::AV,
            Self::Ulpfec | Self::Flexfec => CodecKind::Fec,
            Self::Cn | Self::TelephoneEvent => CodecKind::AudioSupplemental,
            Self::Unknown => CodecKind::Unknown,
        }
    }

    /// Clock rate used when the parameters don't specify one
    pub fn default_clock_rate(&self) -> Option<u32> {
        match self {
            Self::Opus => Some(48_000),
            Self::Isac => Some(16_000),
            Self::G722 | Self::Ilbc | Self::Pcmu | Self::Pcma => Some(8000),
            Self::Vp8 | Self::Vp9 | Self::H264 | Self::Av1 | Self::Ulpfec => Some(90_000),
            Self::Rtx
            | Self::Red
            | Self::Flexfec
            | Self::Cn
            | Self::TelephoneEvent
            | Self::Unknown => None,
        }
    }

    pub fn default_channels(&self) -> Option<u32> {
        match self {
            Self::Opus => Some(2),
            Self::Isac | Self::G722 | Self::Ilbc | Self::Pcmu | Self::Pcma => Some(1),
            _ => None,
        }
    }
}

impl CodecKind {
    pub fn role(&self) -> CodecRole {
        match self {
            Self::Audio | Self::Video | Self::Unknown => CodecRole::Media,
            Self::AV | Self::Fec => CodecRole::Fec,
            Self::Rtx => CodecRole::Rtx,
            Self::AudioSupplemental => CodecRole::Supplemental,
        }
    }

    /// The media kind this codec kind is bound to, `None` for neutral kinds which work with both
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            Self::Audio | Self::AudioSupplemental => Some(MediaKind::Audio),
            Self::Video => Some(MediaKind::Video),
            Self::AV | Self::Rtx | Self::Fec | Self::Unknown => None,
        }
    }
}
