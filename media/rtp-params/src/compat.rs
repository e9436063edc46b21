use crate::{
    CodecParameters, EncodingParameters, MediaKind, RtpParameters, SupportedCodec, pick_codec,
};

/// Rank returned by [`is_compatible_codec`] for identical codecs
pub const MAX_CODEC_RANK: f32 = 5.0;

/// Added to the rank of channels which are identical
const EXACT_MATCH_BONUS: f32 = 100.0;

fn param<'c>(codec: &'c CodecParameters, key: &str, default: &'c str) -> &'c str {
    codec
        .parameters
        .get(key)
        .map(String::as_str)
        .unwrap_or(default)
}

/// H.264 profile (profile_idc + profile-iop) of the `profile-level-id`, ignoring the level
fn h264_profile(codec: &CodecParameters) -> String {
    param(codec, "profile-level-id", "42001f")
        .chars()
        .take(4)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Check if `new` can replace `old` without the receiving side noticing.
///
/// Returns `None` if the codecs differ in anything required for interoperability, otherwise a rank rewarding
/// agreement of the optional parameters, up to [`MAX_CODEC_RANK`].
pub fn is_compatible_codec(old: &CodecParameters, new: &CodecParameters) -> Option<f32> {
    let supported = old.supported_codec();

    if supported != new.supported_codec() {
        return None;
    }

    if supported == SupportedCodec::Unknown && !old.name.eq_ignore_ascii_case(&new.name) {
        return None;
    }

    if old.effective_clock_rate() != new.effective_clock_rate() {
        return None;
    }

    if old.effective_channels() != new.effective_channels() {
        return None;
    }

    match supported {
        SupportedCodec::H264 => {
            if param(old, "packetization-mode", "0") != param(new, "packetization-mode", "0") {
                return None;
            }

            if h264_profile(old) != h264_profile(new) {
                return None;
            }
        }
        SupportedCodec::Vp9 => {
            if param(old, "profile-id", "0") != param(new, "profile-id", "0") {
                return None;
            }
        }
        _ => {}
    }

    let mut rank = 1.0;

    if old.payload_type == new.payload_type {
        rank += 1.0;
    }

    if old.ptime == new.ptime {
        rank += 0.5;
    }

    if old.max_ptime == new.max_ptime {
        rank += 0.5;
    }

    if old.rtcp_feedback == new.rtcp_feedback {
        rank += 1.0;
    }

    if old.parameters == new.parameters {
        rank += 1.0;
    } else {
        let total = old
            .parameters
            .keys()
            .chain(new.parameters.keys().filter(|k| !old.parameters.contains_key(*k)))
            .count();

        let matching = old
            .parameters
            .iter()
            .filter(|(k, v)| new.parameters.get(*k) == Some(*v))
            .count();

        rank += 0.75 * (matching as f32 / total as f32);
    }

    Some(rank)
}

/// Rank how well the channel `new` matches the channel `old`, `None` if it can't be the same channel.
pub fn is_rankable_match(
    kind: Option<MediaKind>,
    old: &RtpParameters,
    new: &RtpParameters,
) -> Option<f32> {
    let old_encoding = old.encodings.first();
    let new_encoding = new.encodings.first();

    let old_codec = pick_codec(kind, old, None, old_encoding, None)?;
    let new_codec = pick_codec(kind, new, None, new_encoding, None)?;

    let mut rank = is_compatible_codec(old_codec, new_codec)?;

    match (old_encoding, new_encoding) {
        (Some(old_encoding), Some(new_encoding)) => {
            if old_encoding.encoding_id != new_encoding.encoding_id {
                return None;
            }

            if old_encoding.encoding_id.is_some() {
                rank += 1.0;
            }

            match (old_encoding.ssrc, new_encoding.ssrc) {
                (Some(a), Some(b)) if a == b => rank += 2.0,
                (Some(_), Some(_)) => rank -= 1.0,
                _ => {}
            }
        }
        (None, None) => rank += 1.0,
        _ => {}
    }

    if old.mux_id.is_some() && old.mux_id == new.mux_id {
        rank += 0.5;
    }

    if old == new {
        rank += EXACT_MATCH_BONUS;
    }

    Some(rank)
}

/// Codec, RTX and FEC payload an encoding is sent with
fn codec_linkage(encoding: &EncodingParameters) -> (Option<u8>, Option<u8>, Option<&str>) {
    (
        encoding.codec_payload_type,
        encoding.rtx.as_ref().and_then(|rtx| rtx.payload_type),
        encoding.fec.as_ref().map(|fec| fec.mechanism.as_str()),
    )
}

/// Returns true if `new` only changes, adds or removes SSRC-level encodings of `old`.
///
/// Codecs, header extensions and the mux id must be identical. Encodings present on both sides may only differ in
/// their SSRCs, added or removed encodings must use a codec linkage of one of the remaining encodings.
pub fn is_generalized_ssrc_compatible_change(old: &RtpParameters, new: &RtpParameters) -> bool {
    if old.codecs != new.codecs
        || old.header_extensions != new.header_extensions
        || old.mux_id != new.mux_id
    {
        return false;
    }

    if old.encodings.is_empty() || new.encodings.is_empty() {
        return true;
    }

    let (smaller, larger) = if old.encodings.len() <= new.encodings.len() {
        (&old.encodings, &new.encodings)
    } else {
        (&new.encodings, &old.encodings)
    };

    let mut surplus: Vec<_> = larger.iter().map(|e| e.without_ssrcs()).collect();

    for encoding in smaller {
        let encoding = encoding.without_ssrcs();

        match surplus.iter().position(|e| *e == encoding) {
            Some(pos) => {
                surplus.swap_remove(pos);
            }
            None => return false,
        }
    }

    surplus.iter().all(|added| {
        smaller
            .iter()
            .any(|kept| codec_linkage(kept) == codec_linkage(added))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FecParameters, RtxParameters};

    #[test]
    fn reflexive_with_max_rank() {
        let codecs = [
            CodecParameters::new("opus", 111)
                .with_parameter("minptime", "10")
                .with_feedback("transport-cc", None),
            CodecParameters::new("H264", 102)
                .with_parameter("packetization-mode", "1")
                .with_parameter("profile-level-id", "42e01f"),
            CodecParameters::new("x-custom", 120).with_clock_rate(8000),
        ];

        for codec in &codecs {
            assert_eq!(is_compatible_codec(codec, codec), Some(MAX_CODEC_RANK));
        }
    }

    #[test]
    fn fixed_parameters_must_match() {
        let opus = CodecParameters::new("opus", 111);
        assert!(is_compatible_codec(&opus, &opus.clone().with_channels(1)).is_none());
        assert!(is_compatible_codec(&opus, &CodecParameters::new("PCMU", 111)).is_none());

        let h264 = CodecParameters::new("H264", 102).with_parameter("packetization-mode", "1");
        let h264_mode0 = CodecParameters::new("H264", 102);
        assert!(is_compatible_codec(&h264, &h264_mode0).is_none());

        let level_a = h264.clone().with_parameter("profile-level-id", "42e01f");
        let level_b = h264.clone().with_parameter("profile-level-id", "42e034");
        assert!(is_compatible_codec(&level_a, &level_b).is_some());

        let vp9 = CodecParameters::new("VP9", 98);
        assert!(is_compatible_codec(&vp9, &vp9.clone().with_parameter("profile-id", "2")).is_none());

        let a = CodecParameters::new("x-foo", 120);
        let b = CodecParameters::new("x-bar", 120);
        assert!(is_compatible_codec(&a, &b).is_none());
    }

    #[test]
    fn rank_prefers_closer_match() {
        let old = CodecParameters::new("VP8", 96).with_feedback("nack", None);

        let same_pt = CodecParameters::new("VP8", 96);
        let other_pt = CodecParameters::new("VP8", 100);

        let a = is_compatible_codec(&old, &same_pt).unwrap();
        let b = is_compatible_codec(&old, &other_pt).unwrap();
        assert!(a > b);
        assert!(a < MAX_CODEC_RANK);
    }

    #[test]
    fn ssrc_only_change() {
        let params = |ssrc: u32, rtx: u32| RtpParameters {
            codecs: vec![
                CodecParameters::new("VP8", 96),
                CodecParameters::rtx(97, 96, 90_000),
            ],
            encodings: vec![EncodingParameters {
                ssrc: Some(ssrc),
                codec_payload_type: Some(96),
                rtx: Some(RtxParameters {
                    ssrc: Some(rtx),
                    payload_type: Some(97),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(is_generalized_ssrc_compatible_change(&params(1, 2), &params(3, 4)));

        let mut other_codec = params(1, 2);
        other_codec.codecs.pop();
        assert!(!is_generalized_ssrc_compatible_change(&params(1, 2), &other_codec));

        let mut bitrate = params(1, 2);
        bitrate.encodings[0].max_bitrate = Some(1000);
        assert!(!is_generalized_ssrc_compatible_change(&params(1, 2), &bitrate));

        let mut empty = params(1, 2);
        empty.encodings.clear();
        assert!(is_generalized_ssrc_compatible_change(&params(1, 2), &empty));
    }

    #[test]
    fn added_and_removed_encodings_are_ssrc_changes() {
        let encoding = |ssrc: u32| EncodingParameters {
            ssrc: Some(ssrc),
            codec_payload_type: Some(96),
            rtx: Some(RtxParameters {
                ssrc: Some(ssrc + 1),
                payload_type: Some(97),
            }),
            ..Default::default()
        };

        let params = |encodings: Vec<EncodingParameters>| RtpParameters {
            codecs: vec![
                CodecParameters::new("VP8", 96),
                CodecParameters::rtx(97, 96, 90_000),
                CodecParameters::new("red", 98),
            ],
            encodings,
            ..Default::default()
        };

        let one = params(vec![encoding(1)]);
        let two = params(vec![encoding(1), encoding(10)]);

        assert!(is_generalized_ssrc_compatible_change(&one, &two));
        assert!(is_generalized_ssrc_compatible_change(&two, &one));

        // the added encoding is sent without RTX
        let mut other_linkage = two.clone();
        other_linkage.encodings[1].rtx = None;
        assert!(!is_generalized_ssrc_compatible_change(&one, &other_linkage));

        let mut with_fec = two.clone();
        with_fec.encodings[1].fec = Some(FecParameters {
            ssrc: Some(20),
            mechanism: "red".into(),
        });
        assert!(!is_generalized_ssrc_compatible_change(&with_fec, &one));

        // the remaining encoding changed more than its SSRCs
        let mut changed = two.clone();
        changed.encodings[0].max_bitrate = Some(1000);
        changed.encodings[1].max_bitrate = Some(1000);
        assert!(!is_generalized_ssrc_compatible_change(&one, &changed));
    }

    #[test]
    fn rankable_match_penalizes_ssrc_change() {
        let channel = |ssrc: u32| RtpParameters {
            codecs: vec![CodecParameters::new("VP8", 96)],
            encodings: vec![EncodingParameters {
                ssrc: Some(ssrc),
                ..Default::default()
            }],
            ..Default::default()
        };

        let same = is_rankable_match(None, &channel(1), &channel(1)).unwrap();
        let other = is_rankable_match(None, &channel(1), &channel(2)).unwrap();

        assert!(same > other);
        assert!(same >= EXACT_MATCH_BONUS);
    }
}
