use crate::{
    CodecKind, CodecParameters, CodecRole, EncodingParameters, MediaKind, RtpParameters,
    SupportedCodec,
};
use std::collections::BTreeSet;

/// Constraints for [`find_codec`]. Unset fields don't constrain the search.
#[derive(Debug, Clone, Default)]
pub struct FindCodecOptions {
    pub payload_type: Option<u8>,
    pub kind: Option<MediaKind>,
    /// Codecs which are not bound to a media kind (RTX, FEC, RED, unknown) match any `kind`
    pub allow_neutral_kind: bool,
    pub codec_role: Option<CodecRole>,
    pub supported_codec: Option<SupportedCodec>,
    pub clock_rate: Option<u32>,
    /// Codecs without a clock rate match any `clock_rate`
    pub match_clock_rate_not_set: bool,
    pub disallowed_payload_types: BTreeSet<u8>,
    /// Return `None` if more than one codec matches
    pub disallow_multiple_matches: bool,
}

impl FindCodecOptions {
    fn matches(&self, codec: &CodecParameters) -> bool {
        if self.payload_type.is_some_and(|pt| pt != codec.payload_type) {
            return false;
        }

        if self.disallowed_payload_types.contains(&codec.payload_type) {
            return false;
        }

        let supported = codec.supported_codec();

        if self.supported_codec.is_some_and(|s| s != supported) {
            return false;
        }

        let kind = supported.kind();

        if self.codec_role.is_some_and(|role| role != kind.role()) {
            return false;
        }

        if let Some(wanted) = self.kind {
            match kind.media_kind() {
                Some(media_kind) if media_kind != wanted => return false,
                Some(_) => {}
                None if !self.allow_neutral_kind => return false,
                None => {}
            }
        }

        if let Some(wanted) = self.clock_rate {
            match codec.clock_rate {
                Some(clock_rate) if clock_rate != wanted => return false,
                Some(_) => {}
                None if !self.match_clock_rate_not_set => return false,
                None => {}
            }
        }

        true
    }
}

/// Linear scan for the first codec satisfying all `options`
pub fn find_codec<'p>(
    params: &'p RtpParameters,
    options: &FindCodecOptions,
) -> Option<&'p CodecParameters> {
    let mut matches = params.codecs.iter().filter(|codec| options.matches(codec));

    let first = matches.next()?;

    if options.disallow_multiple_matches && matches.next().is_some() {
        log::debug!("find_codec: ambiguous match for {options:?}");
        return None;
    }

    Some(first)
}

/// Follow the dependency chain of the encoding at `index` and return the index of its base encoding.
///
/// Dangling references end the chain. A cyclic chain resolves to the lowest index inside the cycle.
pub fn find_encoding_base(params: &RtpParameters, index: usize) -> usize {
    let mut visited = vec![index];
    let mut current = index;

    loop {
        let encoding = &params.encodings[current];

        let Some(dependency) = encoding.dependency_encoding_ids.first() else {
            return current;
        };

        let Some(next) = params
            .encodings
            .iter()
            .position(|e| e.encoding_id.as_ref() == Some(dependency))
        else {
            return current;
        };

        if let Some(pos) = visited.iter().position(|&i| i == next) {
            return visited[pos..].iter().copied().min().unwrap_or(next);
        }

        visited.push(next);
        current = next;
    }
}

/// Payload type declared by the encoding or its base
fn declared_payload_type(
    encoding: Option<&EncodingParameters>,
    base: Option<&EncodingParameters>,
) -> Option<u8> {
    encoding
        .and_then(|e| e.codec_payload_type)
        .or_else(|| base.and_then(|b| b.codec_payload_type))
}

/// Pick the media codec used by an encoding.
///
/// The payload type is taken from the encoding, then its base, then the packet. A packet payload type contradicting
/// the declared one yields `None`. Without any payload type the first media codec is used.
pub fn pick_codec<'p>(
    kind: Option<MediaKind>,
    params: &'p RtpParameters,
    packet_pt: Option<u8>,
    encoding: Option<&EncodingParameters>,
    base: Option<&EncodingParameters>,
) -> Option<&'p CodecParameters> {
    let declared = declared_payload_type(encoding, base);

    let payload_type = match (declared, packet_pt) {
        (Some(declared), Some(packet)) if declared != packet => return None,
        (declared, packet) => declared.or(packet),
    };

    find_codec(
        params,
        &FindCodecOptions {
            payload_type,
            kind,
            allow_neutral_kind: true,
            codec_role: Some(CodecRole::Media),
            ..Default::default()
        },
    )
}

/// Pick the RTX codec that protects the media codec of the encoding
pub fn pick_rtx_codec<'p>(
    kind: Option<MediaKind>,
    params: &'p RtpParameters,
    packet_pt: Option<u8>,
    encoding: Option<&EncodingParameters>,
    base: Option<&EncodingParameters>,
) -> Option<&'p CodecParameters> {
    let media_codec = pick_codec(kind, params, None, encoding, base)?;

    let declared = encoding
        .and_then(|e| e.rtx.as_ref())
        .and_then(|rtx| rtx.payload_type)
        .or_else(|| {
            base.and_then(|b| b.rtx.as_ref())
                .and_then(|rtx| rtx.payload_type)
        });

    let payload_type = match (declared, packet_pt) {
        (Some(declared), Some(packet)) if declared != packet => return None,
        (declared, packet) => declared.or(packet),
    };

    let mut options = FindCodecOptions {
        payload_type,
        kind,
        allow_neutral_kind: true,
        codec_role: Some(CodecRole::Rtx),
        ..Default::default()
    };

    // keep searching until an RTX codec associated with the media codec shows up
    loop {
        let rtx = find_codec(params, &options)?;

        if rtx.apt() == Some(media_codec.payload_type) {
            return Some(rtx);
        }

        options.disallowed_payload_types.insert(rtx.payload_type);
    }
}

fn fec_mechanism_codec(mechanism: &str) -> Option<SupportedCodec> {
    match mechanism.to_ascii_lowercase().as_str() {
        "red" => Some(SupportedCodec::Red),
        "ulpfec" | "red+ulpfec" => Some(SupportedCodec::Ulpfec),
        "flexfec" => Some(SupportedCodec::Flexfec),
        _ => None,
    }
}

/// Pick the FEC codec matching the FEC mechanism of the encoding
pub fn pick_fec_codec<'p>(
    kind: Option<MediaKind>,
    params: &'p RtpParameters,
    packet_pt: Option<u8>,
    encoding: Option<&EncodingParameters>,
    base: Option<&EncodingParameters>,
) -> Option<&'p CodecParameters> {
    let fec = encoding
        .and_then(|e| e.fec.as_ref())
        .or_else(|| base.and_then(|b| b.fec.as_ref()));

    let supported_codec = match fec {
        Some(fec) => Some(fec_mechanism_codec(&fec.mechanism)?),
        None if packet_pt.is_some() => None,
        None => return None,
    };

    find_codec(
        params,
        &FindCodecOptions {
            payload_type: packet_pt,
            kind,
            allow_neutral_kind: true,
            codec_role: Some(CodecRole::Fec),
            supported_codec,
            ..Default::default()
        },
    )
}

/// Result of [`pick_encoding_to_fill`]
#[derive(Debug, Clone)]
pub struct EncodingToFill {
    pub encoding_index: usize,
    pub codec: CodecParameters,
    pub supported_codec: SupportedCodec,
    /// Tells which SSRC slot of the encoding the payload type belongs to (media, RTX or FEC)
    pub codec_kind: CodecKind,
    pub base_encoding_index: usize,
}

/// Find an encoding without SSRC that could be receiving packets with the payload type `pt`.
pub fn pick_encoding_to_fill(
    kind: Option<MediaKind>,
    pt: u8,
    params: &RtpParameters,
) -> Option<EncodingToFill> {
    for (index, encoding) in params.encodings.iter().enumerate() {
        let base_index = find_encoding_base(params, index);
        let base = (base_index != index).then(|| &params.encodings[base_index]);

        let fill = |codec: &CodecParameters| {
            let supported_codec = codec.supported_codec();

            EncodingToFill {
                encoding_index: index,
                codec: codec.clone(),
                supported_codec,
                codec_kind: supported_codec.kind(),
                base_encoding_index: base_index,
            }
        };

        if encoding.ssrc.is_none()
            && let Some(codec) = pick_codec(kind, params, Some(pt), Some(encoding), base)
        {
            return Some(fill(codec));
        }

        if let Some(rtx) = &encoding.rtx
            && rtx.ssrc.is_none()
            && let Some(codec) = pick_rtx_codec(kind, params, Some(pt), Some(encoding), base)
        {
            return Some(fill(codec));
        }

        if let Some(fec) = &encoding.fec
            && fec.ssrc.is_none()
            && let Some(codec) = pick_fec_codec(kind, params, Some(pt), Some(encoding), base)
        {
            return Some(fill(codec));
        }
    }

    None
}

/// The media kind of the parameters' codecs, `None` if it can't be told or codecs of both kinds are present
pub fn codecs_kind(params: &RtpParameters) -> Option<MediaKind> {
    let mut kinds = params
        .codecs
        .iter()
        .filter_map(|codec| codec.kind().media_kind());

    let first = kinds.next()?;

    if kinds.all(|kind| kind == first) {
        Some(first)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FecParameters, RtxParameters};

    fn video_params() -> RtpParameters {
        RtpParameters {
            codecs: vec![
                CodecParameters::new("VP8", 96),
                CodecParameters::rtx(97, 96, 90_000),
                CodecParameters::new("H264", 98).with_parameter("packetization-mode", "1"),
                CodecParameters::rtx(99, 98, 90_000),
                CodecParameters::new("red", 100).with_clock_rate(90_000),
                CodecParameters::new("ulpfec", 101),
            ],
            ..Default::default()
        }
    }

    fn encoding(id: &str, depends_on: Option<&str>) -> EncodingParameters {
        EncodingParameters {
            encoding_id: Some(id.into()),
            dependency_encoding_ids: depends_on.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn find_by_payload_type_and_role() {
        let params = video_params();

        let codec = find_codec(
            &params,
            &FindCodecOptions {
                payload_type: Some(98),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(codec.name, "H264");

        let codec = find_codec(
            &params,
            &FindCodecOptions {
                codec_role: Some(CodecRole::Rtx),
                disallowed_payload_types: [97].into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(codec.payload_type, 99);
    }

    #[test]
    fn neutral_kind_needs_permission() {
        let params = video_params();

        let strict = FindCodecOptions {
            kind: Some(MediaKind::Video),
            codec_role: Some(CodecRole::Rtx),
            ..Default::default()
        };
        assert!(find_codec(&params, &strict).is_none());

        let relaxed = FindCodecOptions {
            allow_neutral_kind: true,
            ..strict
        };
        assert_eq!(find_codec(&params, &relaxed).unwrap().payload_type, 97);
    }

    #[test]
    fn multiple_matches_can_be_rejected() {
        let params = video_params();

        let options = FindCodecOptions {
            kind: Some(MediaKind::Video),
            codec_role: Some(CodecRole::Media),
            disallow_multiple_matches: true,
            ..Default::default()
        };
        assert!(find_codec(&params, &options).is_none());
    }

    #[test]
    fn clock_rate_not_set() {
        let mut params = video_params();
        params.codecs[0].clock_rate = None;

        let mut options = FindCodecOptions {
            payload_type: Some(96),
            clock_rate: Some(90_000),
            ..Default::default()
        };
        assert!(find_codec(&params, &options).is_none());

        options.match_clock_rate_not_set = true;
        assert!(find_codec(&params, &options).is_some());
    }

    #[test]
    fn encoding_base_follows_chain() {
        let params = RtpParameters {
            encodings: vec![
                encoding("a", None),
                encoding("b", Some("a")),
                encoding("c", Some("b")),
                encoding("d", Some("missing")),
            ],
            ..Default::default()
        };

        assert_eq!(find_encoding_base(&params, 0), 0);
        assert_eq!(find_encoding_base(&params, 2), 0);
        assert_eq!(find_encoding_base(&params, 3), 3);
    }

    #[test]
    fn encoding_base_of_cycle() {
        let params = RtpParameters {
            encodings: vec![
                encoding("x", Some("b")),
                encoding("a", Some("b")),
                encoding("b", Some("a")),
            ],
            ..Default::default()
        };

        assert_eq!(find_encoding_base(&params, 0), 1);
        assert_eq!(find_encoding_base(&params, 2), 1);
    }

    #[test]
    fn pick_codec_conflicting_packet() {
        let params = video_params();
        let enc = EncodingParameters {
            codec_payload_type: Some(98),
            ..Default::default()
        };

        assert_eq!(
            pick_codec(None, &params, None, Some(&enc), None)
                .unwrap()
                .payload_type,
            98
        );
        assert!(pick_codec(None, &params, Some(96), Some(&enc), None).is_none());
        assert_eq!(
            pick_codec(Some(MediaKind::Video), &params, None, None, None)
                .unwrap()
                .payload_type,
            96
        );
    }

    #[test]
    fn rtx_follows_apt() {
        let params = video_params();
        let enc = EncodingParameters {
            codec_payload_type: Some(98),
            rtx: Some(RtxParameters::default()),
            ..Default::default()
        };

        let rtx = pick_rtx_codec(None, &params, None, Some(&enc), None).unwrap();
        assert_eq!(rtx.payload_type, 99);

        assert!(pick_rtx_codec(None, &params, Some(97), Some(&enc), None).is_none());
    }

    #[test]
    fn fec_by_mechanism() {
        let params = video_params();
        let enc = EncodingParameters {
            fec: Some(FecParameters {
                ssrc: None,
                mechanism: "red+ulpfec".into(),
            }),
            ..Default::default()
        };

        let fec = pick_fec_codec(None, &params, None, Some(&enc), None).unwrap();
        assert_eq!(fec.payload_type, 101);
    }

    #[test]
    fn fill_encoding_slots() {
        let mut params = video_params();
        params.encodings = vec![
            EncodingParameters {
                ssrc: Some(1),
                codec_payload_type: Some(96),
                ..Default::default()
            },
            EncodingParameters {
                codec_payload_type: Some(98),
                rtx: Some(RtxParameters::default()),
                ..Default::default()
            },
        ];

        let fill = pick_encoding_to_fill(Some(MediaKind::Video), 98, &params).unwrap();
        assert_eq!(fill.encoding_index, 1);
        assert_eq!(fill.codec_kind, CodecKind::Video);

        let fill = pick_encoding_to_fill(Some(MediaKind::Video), 99, &params).unwrap();
        assert_eq!(fill.encoding_index, 1);
        assert_eq!(fill.codec_kind, CodecKind::Rtx);

        // pt 96 belongs to an encoding which already has its ssrc
        assert!(pick_encoding_to_fill(Some(MediaKind::Video), 96, &params).is_none());
    }

    #[test]
    fn kind_of_codecs() {
        assert_eq!(codecs_kind(&video_params()), Some(MediaKind::Video));

        let mut mixed = video_params();
        mixed.codecs.push(CodecParameters::new("opus", 111));
        assert_eq!(codecs_kind(&mixed), None);

        assert_eq!(codecs_kind(&RtpParameters::default()), None);
    }
}
