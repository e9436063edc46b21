use crate::{
    CodecParameters, CodecRole, HeaderExtensionParameters, RtpCapabilities, RtpParameters,
    is_compatible_codec,
};
use std::collections::BTreeMap;

/// Best compatible, not yet used codec out of `candidates`
fn best_match<'c>(
    codec: &CodecParameters,
    candidates: &'c [CodecParameters],
    used: &[u8],
) -> Option<&'c CodecParameters> {
    let mut best: Option<(f32, &CodecParameters)> = None;

    for candidate in candidates {
        if used.contains(&candidate.payload_type) {
            continue;
        }

        let Some(rank) = is_compatible_codec(codec, candidate) else {
            continue;
        };

        if best.is_none_or(|(best_rank, _)| rank > best_rank) {
            best = Some((rank, candidate));
        }
    }

    best.map(|(_, codec)| codec)
}

/// Translate codecs to the peer's payload types. RTX codecs are resolved after all other codecs, since they refer
/// to them by `apt`.
///
/// Returns the mapped codecs (in the order of `codecs`) and the payload type mapping.
fn map_codecs(
    codecs: &[CodecParameters],
    remote: &[CodecParameters],
) -> (Vec<CodecParameters>, BTreeMap<u8, u8>) {
    let mut mapped: Vec<Option<CodecParameters>> = vec![None; codecs.len()];
    let mut pt_map = BTreeMap::new();
    let mut used = vec![];

    for (i, codec) in codecs.iter().enumerate() {
        if codec.kind().role() == CodecRole::Rtx {
            continue;
        }

        let Some(remote) = best_match(codec, remote, &used) else {
            continue;
        };

        let mut codec = codec.clone();
        codec.payload_type = remote.payload_type;
        codec
            .rtcp_feedback
            .retain(|fb| remote.rtcp_feedback.contains(fb));

        used.push(remote.payload_type);
        pt_map.insert(codecs[i].payload_type, remote.payload_type);
        mapped[i] = Some(codec);
    }

    for (i, codec) in codecs.iter().enumerate() {
        if codec.kind().role() != CodecRole::Rtx {
            continue;
        }

        let Some(apt) = codec.apt().and_then(|apt| pt_map.get(&apt).copied()) else {
            continue;
        };

        let remote = remote.iter().find(|r| {
            r.kind().role() == CodecRole::Rtx
                && r.apt() == Some(apt)
                && r.effective_clock_rate() == codec.effective_clock_rate()
                && !used.contains(&r.payload_type)
        });

        let Some(remote) = remote else {
            continue;
        };

        let mut codec = codec.clone();
        codec.payload_type = remote.payload_type;
        codec.set_apt(apt);

        used.push(remote.payload_type);
        pt_map.insert(codecs[i].payload_type, remote.payload_type);
        mapped[i] = Some(codec);
    }

    (mapped.into_iter().flatten().collect(), pt_map)
}

fn map_header_extensions(
    local: &[HeaderExtensionParameters],
    remote: &[HeaderExtensionParameters],
) -> Vec<HeaderExtensionParameters> {
    local
        .iter()
        .filter_map(|l| {
            let r = remote.iter().find(|r| r.uri == l.uri)?;

            Some(HeaderExtensionParameters {
                uri: l.uri.clone(),
                id: r.id,
                encrypt: l.encrypt && r.encrypt,
            })
        })
        .collect()
}

/// Capabilities supported by both sides, in local preference order using the remote payload types and extension ids
pub fn intersect_capabilities(local: &RtpCapabilities, remote: &RtpCapabilities) -> RtpCapabilities {
    let (codecs, _) = map_codecs(&local.codecs, &remote.codecs);

    RtpCapabilities {
        codecs,
        header_extensions: map_header_extensions(&local.header_extensions, &remote.header_extensions),
        fec_mechanisms: local
            .fec_mechanisms
            .iter()
            .filter(|m| remote.fec_mechanisms.contains(m))
            .cloned()
            .collect(),
    }
}

/// Narrow the parameters down to what `capabilities` supports.
///
/// Codecs are translated to the payload types of the capabilities, encodings referencing a lost codec are dropped.
/// Returns `None` if no media codec or no encoding is left.
pub fn negotiate_parameters(
    params: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Option<RtpParameters> {
    let (codecs, pt_map) = map_codecs(&params.codecs, &capabilities.codecs);

    if !codecs.iter().any(|c| c.kind().role() == CodecRole::Media) {
        log::debug!("no media codec left after negotiating {:?}", params.codecs);
        return None;
    }

    let mut encodings = vec![];

    for encoding in &params.encodings {
        let mut encoding = encoding.clone();

        if let Some(pt) = encoding.codec_payload_type {
            let Some(mapped) = pt_map.get(&pt) else {
                continue;
            };

            encoding.codec_payload_type = Some(*mapped);
        }

        if let Some(rtx) = &mut encoding.rtx {
            match rtx.payload_type {
                Some(pt) => match pt_map.get(&pt) {
                    Some(mapped) => rtx.payload_type = Some(*mapped),
                    None => encoding.rtx = None,
                },
                None if !codecs.iter().any(|c| c.kind().role() == CodecRole::Rtx) => {
                    encoding.rtx = None
                }
                None => {}
            }
        }

        if encoding
            .fec
            .as_ref()
            .is_some_and(|fec| !capabilities.fec_mechanisms.contains(&fec.mechanism))
        {
            encoding.fec = None;
        }

        encodings.push(encoding);
    }

    if encodings.is_empty() && !params.encodings.is_empty() {
        log::debug!("no encoding left after negotiating");
        return None;
    }

    Some(RtpParameters {
        mux_id: params.mux_id.clone(),
        codecs,
        header_extensions: map_header_extensions(
            &params.header_extensions,
            &capabilities.header_extensions,
        ),
        encodings,
        rtcp: params.rtcp.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodingParameters, FecParameters, RtxParameters};

    fn local() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                CodecParameters::new("VP8", 96).with_feedback("nack", None),
                CodecParameters::rtx(97, 96, 90_000),
                CodecParameters::new("H264", 98).with_parameter("packetization-mode", "1"),
                CodecParameters::rtx(99, 98, 90_000),
            ],
            header_extensions: vec![
                HeaderExtensionParameters {
                    uri: "urn:ietf:params:rtp-hdrext:sdes:mid".into(),
                    id: 1,
                    encrypt: false,
                },
                HeaderExtensionParameters {
                    uri: "urn:3gpp:video-orientation".into(),
                    id: 2,
                    encrypt: false,
                },
            ],
            fec_mechanisms: vec!["red".into(), "flexfec".into()],
        }
    }

    fn remote() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                CodecParameters::new("H264", 120).with_parameter("packetization-mode", "1"),
                CodecParameters::rtx(121, 120, 90_000),
                CodecParameters::new("VP8", 100),
            ],
            header_extensions: vec![HeaderExtensionParameters {
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".into(),
                id: 5,
                encrypt: false,
            }],
            fec_mechanisms: vec!["red".into()],
        }
    }

    #[test]
    fn intersection_uses_remote_numbers() {
        let caps = intersect_capabilities(&local(), &remote());

        let pts: Vec<(String, u8)> = caps
            .codecs
            .iter()
            .map(|c| (c.name.clone(), c.payload_type))
            .collect();

        assert_eq!(
            pts,
            vec![
                ("VP8".to_string(), 100),
                ("H264".to_string(), 120),
                ("rtx".to_string(), 121)
            ]
        );

        assert_eq!(caps.codecs[2].apt(), Some(120));
        // remote doesn't do nack
        assert!(caps.codecs[0].rtcp_feedback.is_empty());

        assert_eq!(caps.header_extensions.len(), 1);
        assert_eq!(caps.header_extensions[0].id, 5);
        assert_eq!(caps.fec_mechanisms, vec!["red".to_string()]);
    }

    #[test]
    fn negotiation_remaps_encodings() {
        let mut params = RtpParameters::from_capabilities(&local());
        params.encodings = vec![
            EncodingParameters {
                ssrc: Some(10),
                codec_payload_type: Some(96),
                rtx: Some(RtxParameters {
                    ssrc: Some(11),
                    payload_type: Some(97),
                }),
                fec: Some(FecParameters {
                    ssrc: None,
                    mechanism: "flexfec".into(),
                }),
                ..Default::default()
            },
            EncodingParameters {
                ssrc: Some(20),
                codec_payload_type: Some(98),
                rtx: Some(RtxParameters {
                    ssrc: Some(21),
                    payload_type: Some(99),
                }),
                ..Default::default()
            },
        ];

        let negotiated = negotiate_parameters(&params, &remote()).unwrap();

        assert_eq!(negotiated.encodings[0].codec_payload_type, Some(100));
        // VP8's RTX is not supported by the remote
        assert!(negotiated.encodings[0].rtx.is_none());
        assert!(negotiated.encodings[0].fec.is_none());

        assert_eq!(negotiated.encodings[1].codec_payload_type, Some(120));
        assert_eq!(negotiated.encodings[1].rtx.as_ref().unwrap().payload_type, Some(121));
    }

    #[test]
    fn negotiation_fails_without_media_codec() {
        let params = RtpParameters {
            codecs: vec![CodecParameters::new("opus", 111)],
            ..Default::default()
        };

        assert!(negotiate_parameters(&params, &remote()).is_none());
    }
}
