use crate::{MediaKind, RtpParameters, find_encoding_base, is_rankable_match};
use std::collections::BTreeMap;

/// Split the parameters into channels, one per base encoding.
///
/// Every channel carries all codecs and header extensions but only the encodings of its dependency chain, base
/// encoding first. Channels are ordered by their base encoding's position. Parameters without encodings form a single
/// channel.
pub fn split_params_into_channels(params: &RtpParameters) -> Vec<RtpParameters> {
    if params.encodings.is_empty() {
        return vec![params.clone()];
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

    for index in 0..params.encodings.len() {
        let base = find_encoding_base(params, index);
        groups.entry(base).or_default().push(index);
    }

    groups
        .into_iter()
        .map(|(base, mut members)| {
            members.sort_by_key(|&i| (i != base, i));

            RtpParameters {
                mux_id: params.mux_id.clone(),
                codecs: params.codecs.clone(),
                header_extensions: params.header_extensions.clone(),
                encodings: members
                    .into_iter()
                    .map(|i| params.encodings[i].clone())
                    .collect(),
                rtcp: params.rtcp.clone(),
            }
        })
        .collect()
}

/// Result of [`calculate_delta_changes_in_channels`], all entries are indices into the old/new channel lists.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelDelta {
    /// Matched pairs `(old, new)` with identical content
    pub unchanged: Vec<(usize, usize)>,
    /// New channels without a match
    pub new: Vec<usize>,
    /// Matched pairs `(old, new)` with differing content
    pub updated: Vec<(usize, usize)>,
    /// Old channels without a match
    pub removed: Vec<usize>,
}

/// Match every new channel to at most one old channel and classify the result.
///
/// Pairs are assigned greedily by descending rank, ties go to the new channel appearing first.
pub fn calculate_delta_changes_in_channels(
    kind: Option<MediaKind>,
    old: &[RtpParameters],
    new: &[RtpParameters],
) -> ChannelDelta {
    let mut candidates = vec![];

    for (new_index, new_channel) in new.iter().enumerate() {
        for (old_index, old_channel) in old.iter().enumerate() {
            if let Some(rank) = is_rankable_match(kind, old_channel, new_channel) {
                candidates.push((rank, new_index, old_index));
            }
        }
    }

    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut old_taken = vec![false; old.len()];
    let mut new_taken = vec![false; new.len()];
    let mut delta = ChannelDelta::default();

    for (_, new_index, old_index) in candidates {
        if old_taken[old_index] || new_taken[new_index] {
            continue;
        }

        old_taken[old_index] = true;
        new_taken[new_index] = true;

        if old[old_index] == new[new_index] {
            delta.unchanged.push((old_index, new_index));
        } else {
            delta.updated.push((old_index, new_index));
        }
    }

    delta.unchanged.sort_by_key(|&(_, new)| new);
    delta.updated.sort_by_key(|&(_, new)| new);
    delta.new = (0..new.len()).filter(|&i| !new_taken[i]).collect();
    delta.removed = (0..old.len()).filter(|&i| !old_taken[i]).collect();

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodecParameters, EncodingParameters};

    fn encoding(id: &str, ssrc: u32, depends_on: Option<&str>) -> EncodingParameters {
        EncodingParameters {
            ssrc: Some(ssrc),
            codec_payload_type: Some(96),
            encoding_id: Some(id.into()),
            dependency_encoding_ids: depends_on.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn params(encodings: Vec<EncodingParameters>) -> RtpParameters {
        RtpParameters {
            codecs: vec![
                CodecParameters::new("VP8", 96),
                CodecParameters::new("H264", 98),
            ],
            encodings,
            ..Default::default()
        }
    }

    #[test]
    fn split_is_partition() {
        let params = params(vec![
            encoding("l1", 2, Some("l0")),
            encoding("l0", 1, None),
            encoding("h0", 3, None),
            encoding("l2", 4, Some("l1")),
            encoding("h1", 5, Some("h0")),
        ]);

        let channels = split_params_into_channels(&params);
        assert_eq!(channels.len(), 2);

        let ssrcs: Vec<Vec<u32>> = channels
            .iter()
            .map(|c| c.encodings.iter().filter_map(|e| e.ssrc).collect())
            .collect();

        assert_eq!(ssrcs, vec![vec![1, 2, 4], vec![3, 5]]);

        let total: usize = channels.iter().map(|c| c.encodings.len()).sum();
        assert_eq!(total, params.encodings.len());
    }

    #[test]
    fn split_without_encodings() {
        let params = params(vec![]);
        let channels = split_params_into_channels(&params);

        assert_eq!(channels, vec![params]);
    }

    #[test]
    fn identical_channels_are_unchanged() {
        let params = params(vec![encoding("a", 1, None), encoding("b", 2, None)]);
        let channels = split_params_into_channels(&params);

        let delta = calculate_delta_changes_in_channels(None, &channels, &channels);

        assert_eq!(delta.unchanged, vec![(0, 0), (1, 1)]);
        assert!(delta.new.is_empty());
        assert!(delta.updated.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn delta_classifies_everything_once() {
        let old = split_params_into_channels(&params(vec![
            encoding("a", 1, None),
            encoding("b", 2, None),
        ]));

        let mut changed = encoding("a", 1, None);
        changed.max_bitrate = Some(500_000);

        let new = split_params_into_channels(&params(vec![changed, encoding("c", 3, None)]));

        let delta = calculate_delta_changes_in_channels(None, &old, &new);

        assert_eq!(delta.updated, vec![(0, 0)]);
        assert_eq!(delta.new, vec![1]);
        assert_eq!(delta.removed, vec![1]);
        assert!(delta.unchanged.is_empty());
    }

    #[test]
    fn ties_go_to_first_new_channel() {
        let mut plain = params(vec![]);
        plain.encodings = vec![EncodingParameters {
            codec_payload_type: Some(96),
            ..Default::default()
        }];
        let old = vec![plain.clone()];

        let mut first = plain.clone();
        first.encodings[0].max_bitrate = Some(1);
        let mut second = plain;
        second.encodings[0].max_bitrate = Some(2);

        let delta = calculate_delta_changes_in_channels(None, &old, &[first, second]);

        assert_eq!(delta.updated, vec![(0, 0)]);
        assert_eq!(delta.new, vec![1]);
    }
}
