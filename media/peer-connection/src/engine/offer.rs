use super::{AnswerOptions, CapabilityOptions, OfferOptions, State};
use crate::{
    BundlePolicy, Description, DescriptionType, Error, MediaDirection, MediaLineId,
    NegotiationState, RtcpMuxPolicy, RtpMediaLine, RtpSenderDescription, SctpMediaLine,
    SecureTransportType, SenderId, SessionDescription, SessionDetails, TransportDescription,
    TransportId, TransportParameters,
    entities::RtpMediaLineInfo,
    ids::next_free,
    transport::{CapabilityDirection, DtlsRole},
};
use rtp_params::{
    CodecRole, EncodingParameters, MediaKind, RtpCapabilities, RtpParameters, RtxParameters,
    SupportedCodec, intersect_capabilities, is_compatible_codec, negotiate_parameters,
};
use std::collections::{BTreeMap, BTreeSet};

/// Transport id used in capability descriptions
const CAPABILITIES_TRANSPORT: &str = "capabilities";

impl State {
    pub(super) fn next_line_index(&self) -> usize {
        self.rtp_media_lines
            .values()
            .map(|l| l.line_index)
            .chain(self.sctp_media_lines.values().map(|l| l.line_index))
            .max()
            .map_or(0, |index| index + 1)
    }

    fn session_details(&mut self) -> SessionDetails {
        self.session_version += 1;

        SessionDetails {
            username: "ezk".into(),
            session_id: self.session_id,
            session_version: self.session_version,
        }
    }

    /// Transport of the first media line (by line index) whose kind matches, `None` kind stands for data
    fn line_transport(&self, matches: impl Fn(Option<MediaKind>) -> bool) -> Option<TransportId> {
        let rtp = self
            .rtp_media_lines
            .values()
            .filter(|l| l.negotiation != NegotiationState::Rejected)
            .map(|l| (l.line_index, Some(l.kind), &l.transport_id));
        let sctp = self
            .sctp_media_lines
            .values()
            .filter(|l| l.negotiation != NegotiationState::Rejected)
            .map(|l| (l.line_index, None, &l.transport_id));

        let mut lines: Vec<_> = rtp.chain(sctp).collect();
        lines.sort_by_key(|(index, ..)| *index);

        lines
            .into_iter()
            .filter(|(_, kind, transport_id)| {
                matches(*kind) && self.transports.contains_key(*transport_id)
            })
            .map(|(.., transport_id)| transport_id.clone())
            .next()
    }

    /// Pick or create the transport of a new media line according to the bundle policy
    pub(super) fn transport_for_new_line(&mut self, kind: Option<MediaKind>) -> TransportId {
        // SDES keyed media can't share a transport with the DTLS keyed SCTP association
        let sdes = self.config.secure_transport == SecureTransportType::SdesSrtp;
        let compatible = |other: Option<MediaKind>| !sdes || other.is_some() == kind.is_some();

        let existing = match self.config.bundle_policy {
            BundlePolicy::MaxBundle => self.line_transport(compatible),
            BundlePolicy::Balanced => self.line_transport(|other| other == kind),
            BundlePolicy::MaxCompat => None,
        };

        if let Some(id) = existing {
            return id;
        }

        let with_rtcp =
            kind.is_some() && self.config.rtcp_mux_policy == RtcpMuxPolicy::Negotiate;
        let secure = self.secure_transport_type(kind.is_some());

        self.create_transport(None, NegotiationState::PendingOffer, with_rtcp, secure)
    }

    pub(super) fn insert_rtp_media_line(
        &mut self,
        id: MediaLineId,
        line_index: usize,
        transport_id: TransportId,
        kind: MediaKind,
        negotiation: NegotiationState,
    ) {
        log::debug!("creating {kind:?} media line {id} on {transport_id}");

        let line = RtpMediaLineInfo {
            id: id.clone(),
            line_index,
            transport_id,
            negotiation,
            kind,
            direction: MediaDirection::Inactive,
            local_sender_capabilities: self
                .factory
                .rtp_capabilities(kind, CapabilityDirection::Send),
            local_receiver_capabilities: self
                .factory
                .rtp_capabilities(kind, CapabilityDirection::Receive),
            remote: None,
            senders: BTreeSet::new(),
            receivers: BTreeSet::new(),
        };

        self.rtp_media_lines.insert(id, line);
    }

    pub(super) fn new_media_line_id(&mut self) -> MediaLineId {
        next_free(&mut self.next_media_line_id, "", MediaLineId, |id| {
            self.rtp_media_lines.contains_key(id) || self.sctp_media_lines.contains_key(id)
        })
    }

    pub(super) fn attach_sender(&mut self, sender_id: &SenderId, line_id: &MediaLineId) {
        let previous = self
            .senders
            .get(sender_id)
            .and_then(|s| s.media_line_id.clone())
            .filter(|previous| previous != line_id);

        if let Some(line) = previous.and_then(|id| self.rtp_media_lines.get_mut(&id)) {
            line.senders.remove(sender_id);
        }

        if let Some(line) = self.rtp_media_lines.get_mut(line_id) {
            line.senders.insert(sender_id.clone());
        }

        if let Some(sender) = self.senders.get_mut(sender_id) {
            sender.media_line_id = Some(line_id.clone());
        }
    }

    /// Put every sender without a media line onto a free line of its kind, or a new one
    fn attach_senders(&mut self) {
        let unattached: Vec<_> = self
            .senders
            .values()
            .filter(|s| s.media_line_id.is_none())
            .map(|s| (s.id.clone(), s.track.kind))
            .collect();

        for (sender_id, kind) in unattached {
            let free_line = self
                .rtp_media_lines
                .values()
                .filter(|l| {
                    l.kind == kind
                        && l.senders.is_empty()
                        && l.negotiation != NegotiationState::Rejected
                })
                .min_by_key(|l| l.line_index)
                .map(|l| l.id.clone());

            let line_id = match free_line {
                Some(id) => id,
                None => {
                    let transport_id = self.transport_for_new_line(Some(kind));
                    let id = self.new_media_line_id();
                    let line_index = self.next_line_index();

                    self.insert_rtp_media_line(
                        id.clone(),
                        line_index,
                        transport_id,
                        kind,
                        NegotiationState::PendingOffer,
                    );

                    id
                }
            };

            log::debug!("attaching sender {sender_id} to media line {line_id}");

            self.attach_sender(&sender_id, &line_id);
        }
    }

    /// Local capabilities with comfort noise removed if requested and narrowed down to what the peer announced
    /// in a capabilities description
    fn filter_capabilities(
        &self,
        kind: MediaKind,
        capabilities: &RtpCapabilities,
        voice_activity_detection: Option<bool>,
        direction: CapabilityDirection,
    ) -> RtpCapabilities {
        let mut capabilities = capabilities.clone();

        if voice_activity_detection == Some(false) {
            capabilities
                .codecs
                .retain(|c| c.supported_codec() != SupportedCodec::Cn);
        }

        let remote = self
            .remote_capabilities
            .as_ref()
            .and_then(|d| d.description.rtp_media_lines.iter().find(|l| l.kind == kind))
            .and_then(|line| match direction {
                CapabilityDirection::Send => line.receiver_capabilities.as_ref(),
                CapabilityDirection::Receive => line.sender_capabilities.as_ref(),
            });

        let Some(remote) = remote else {
            return capabilities;
        };

        let mut filtered = capabilities.clone();
        filtered.codecs.retain(|c| {
            c.kind().role() == CodecRole::Rtx
                || remote
                    .codecs
                    .iter()
                    .any(|r| is_compatible_codec(c, r).is_some())
        });

        let kept: Vec<u8> = filtered.codecs.iter().map(|c| c.payload_type).collect();
        filtered
            .codecs
            .retain(|c| c.apt().is_none_or(|apt| kept.contains(&apt)));

        if filtered.has_media_codec() {
            filtered
        } else {
            log::debug!("peer capabilities share no {kind:?} codec with us, ignoring them");
            capabilities
        }
    }

    /// Generate new ICE credentials for every transport, running ICE transports are restarted once the answer is applied
    fn restart_ice(&mut self) {
        for transport in self.transports.values_mut() {
            for details in transport.details_mut() {
                details.gatherer.restart();
                details.candidates.clear();
                details.end_of_candidates = false;
            }

            transport.restarting = transport.started;
        }
    }

    /// Build an offer from the current entities.
    ///
    /// Returns `Ok(None)` if transports are still missing their local parameters.
    pub(super) fn create_offer(
        &mut self,
        options: &mut OfferOptions,
    ) -> Result<Option<SessionDescription>, Error> {
        if self.pending_remote.as_ref().map(|d| d.kind) == Some(DescriptionType::Offer) {
            return Err(Error::InvalidState(
                "cannot create an offer while a remote offer is pending".into(),
            ));
        }

        self.attach_senders();

        if !self.data_channels.is_empty() {
            self.ensure_sctp_media_line();
        }

        if options.ice_restart {
            options.ice_restart = false;
            self.restart_ice();
        }

        if !self.local_parameters_ready() {
            return Ok(None);
        }

        let vad = options.voice_activity_detection;

        let mut lines: Vec<&RtpMediaLineInfo> = self
            .rtp_media_lines
            .values()
            .filter(|l| l.negotiation != NegotiationState::Rejected)
            .collect();
        lines.sort_by_key(|l| l.line_index);

        let mut rtp_media_lines = vec![];
        let mut rtp_senders = vec![];
        let mut transport_ids = BTreeSet::new();
        let mut directions = BTreeMap::new();
        let mut offered = vec![];

        for line in lines {
            let sender_capabilities = self.filter_capabilities(
                line.kind,
                &line.local_sender_capabilities,
                vad,
                CapabilityDirection::Send,
            );
            let receiver_capabilities = self.filter_capabilities(
                line.kind,
                &line.local_receiver_capabilities,
                vad,
                CapabilityDirection::Receive,
            );

            for sender_id in &line.senders {
                let sender = &self.senders[sender_id];

                let parameters = sender
                    .offered
                    .clone()
                    .or_else(|| sender.parameters.clone())
                    .unwrap_or_else(|| {
                        initial_sender_parameters(&sender_capabilities, &line.id, &self.cname)
                    });

                rtp_senders.push(RtpSenderDescription {
                    id: sender.id.clone(),
                    media_line_id: line.id.clone(),
                    parameters: parameters.clone(),
                    track_id: Some(sender.track.id.clone()),
                    stream_ids: sender.stream_ids.clone(),
                });

                offered.push((sender.id.clone(), parameters));
            }

            let direction = MediaDirection::new(!line.senders.is_empty(), true);
            directions.insert(line.id.clone(), direction);

            rtp_media_lines.push(RtpMediaLine {
                id: line.id.clone(),
                line_index: line.line_index,
                transport_id: line.transport_id.clone(),
                kind: line.kind,
                direction,
                sender_capabilities: Some(sender_capabilities),
                receiver_capabilities: Some(receiver_capabilities),
            });

            transport_ids.insert(line.transport_id.clone());
        }

        let sctp_capabilities = self.factory.sctp_capabilities();

        let sctp_media_lines: Vec<_> = self
            .sctp_media_lines
            .values()
            .filter(|l| l.negotiation != NegotiationState::Rejected)
            .map(|l| {
                transport_ids.insert(l.transport_id.clone());

                SctpMediaLine {
                    id: l.id.clone(),
                    line_index: l.line_index,
                    transport_id: l.transport_id.clone(),
                    capabilities: sctp_capabilities,
                    port: Some(l.port),
                }
            })
            .collect();

        let transports = transport_ids
            .iter()
            .map(|id| {
                let transport = self
                    .transports
                    .get(id)
                    .expect("Internal references must be valid");

                self.local_transport_description(transport, DtlsRole::Auto, true, true)
            })
            .collect();

        for (sender_id, parameters) in offered {
            if let Some(sender) = self.senders.get_mut(&sender_id) {
                sender.offered = Some(parameters);

                if sender.negotiation == NegotiationState::PendingOffer {
                    sender.negotiation = NegotiationState::LocalOffered;
                }
            }
        }

        for (line_id, direction) in directions {
            if let Some(line) = self.rtp_media_lines.get_mut(&line_id) {
                line.direction = direction;

                if line.negotiation == NegotiationState::PendingOffer {
                    line.negotiation = NegotiationState::LocalOffered;
                }
            }
        }

        for line in self.sctp_media_lines.values_mut() {
            if line.negotiation == NegotiationState::PendingOffer {
                line.negotiation = NegotiationState::LocalOffered;
            }
        }

        let description = Description {
            details: Some(self.session_details()),
            transports,
            rtp_media_lines,
            sctp_media_lines,
            rtp_senders,
        };

        Ok(Some(SessionDescription::new(
            DescriptionType::Offer,
            description,
        )))
    }

    /// Build an answer to the pending remote offer.
    ///
    /// Media lines without a codec in common are left out, which rejects them.
    /// Returns `Ok(None)` if transports are still missing their local parameters.
    pub(super) fn create_answer(
        &mut self,
        options: &AnswerOptions,
    ) -> Result<Option<SessionDescription>, Error> {
        let Some(offer) = self
            .pending_remote
            .as_ref()
            .filter(|d| d.kind == DescriptionType::Offer)
            .cloned()
        else {
            return Err(Error::InvalidState(
                "create_answer requires a pending remote offer".into(),
            ));
        };

        if !self.local_parameters_ready() {
            return Ok(None);
        }

        let vad = options.voice_activity_detection;

        let mut rtp_media_lines = vec![];
        let mut rtp_senders = vec![];
        let mut transport_ids = BTreeSet::new();
        let mut directions = BTreeMap::new();
        let mut answered = vec![];

        for remote_line in &offer.description.rtp_media_lines {
            let Some(line) = self.rtp_media_lines.get(&remote_line.id) else {
                continue;
            };

            let sender_capabilities = remote_line
                .receiver_capabilities
                .as_ref()
                .map(|remote| {
                    let local = self.filter_capabilities(
                        line.kind,
                        &line.local_sender_capabilities,
                        vad,
                        CapabilityDirection::Send,
                    );

                    intersect_capabilities(&local, remote)
                })
                .unwrap_or_default();

            let receiver_capabilities = remote_line
                .sender_capabilities
                .as_ref()
                .map(|remote| {
                    let local = self.filter_capabilities(
                        line.kind,
                        &line.local_receiver_capabilities,
                        vad,
                        CapabilityDirection::Receive,
                    );

                    intersect_capabilities(&local, remote)
                })
                .unwrap_or_default();

            if !sender_capabilities.has_media_codec() && !receiver_capabilities.has_media_codec()
            {
                log::info!(
                    "rejecting {:?} media line {}, no codec in common",
                    line.kind,
                    line.id
                );
                continue;
            }

            // we may only do the opposite of what the peer offered
            let allowed = remote_line.direction.flipped();
            let mut sends = false;

            if allowed.sends() && sender_capabilities.has_media_codec() {
                for sender_id in &line.senders {
                    let sender = &self.senders[sender_id];

                    let base = sender
                        .parameters
                        .clone()
                        .or_else(|| sender.offered.clone())
                        .unwrap_or_else(|| {
                            initial_sender_parameters(&sender_capabilities, &line.id, &self.cname)
                        });

                    let Some(parameters) = negotiate_parameters(&base, &sender_capabilities)
                    else {
                        log::debug!("sender {sender_id} has no codec the peer can receive");
                        continue;
                    };

                    rtp_senders.push(RtpSenderDescription {
                        id: sender.id.clone(),
                        media_line_id: line.id.clone(),
                        parameters: parameters.clone(),
                        track_id: Some(sender.track.id.clone()),
                        stream_ids: sender.stream_ids.clone(),
                    });

                    answered.push((sender.id.clone(), parameters));
                    sends = true;
                }
            }

            let receives = allowed.receives() && receiver_capabilities.has_media_codec();

            let direction = MediaDirection::new(sends, receives);
            directions.insert(line.id.clone(), direction);

            rtp_media_lines.push(RtpMediaLine {
                id: line.id.clone(),
                line_index: remote_line.line_index,
                transport_id: remote_line.transport_id.clone(),
                kind: line.kind,
                direction,
                sender_capabilities: Some(sender_capabilities),
                receiver_capabilities: Some(receiver_capabilities),
            });

            transport_ids.insert(remote_line.transport_id.clone());
        }

        let sctp_capabilities = self.factory.sctp_capabilities();
        let mut sctp_media_lines = vec![];

        for remote_line in &offer.description.sctp_media_lines {
            let Some(line) = self.sctp_media_lines.get(&remote_line.id) else {
                continue;
            };

            sctp_media_lines.push(SctpMediaLine {
                id: line.id.clone(),
                line_index: remote_line.line_index,
                transport_id: remote_line.transport_id.clone(),
                capabilities: sctp_capabilities,
                port: Some(line.port),
            });

            transport_ids.insert(remote_line.transport_id.clone());
        }

        let mut transports = vec![];

        for id in &transport_ids {
            let (Some(transport), Some(remote)) =
                (self.transports.get(id), offer.description.transport(id))
            else {
                return Err(Error::Negotiation(format!(
                    "offered transport {id} is unknown"
                )));
            };

            transports.push(self.local_transport_description(
                transport,
                DtlsRole::Client,
                remote.use_mux,
                !remote.use_mux,
            ));
        }

        for (sender_id, parameters) in answered {
            if let Some(sender) = self.senders.get_mut(&sender_id) {
                sender.offered = Some(parameters);
            }
        }

        for (line_id, direction) in directions {
            if let Some(line) = self.rtp_media_lines.get_mut(&line_id) {
                line.direction = direction;
            }
        }

        let description = Description {
            details: Some(self.session_details()),
            transports,
            rtp_media_lines,
            sctp_media_lines,
            rtp_senders,
        };

        Ok(Some(SessionDescription::new(
            DescriptionType::Answer,
            description,
        )))
    }

    /// Describe everything this peer connection is able to send and receive
    pub(super) fn create_capabilities(&mut self, options: &CapabilityOptions) -> SessionDescription {
        let kinds = if options.kinds.is_empty() {
            vec![MediaKind::Audio, MediaKind::Video]
        } else {
            options.kinds.clone()
        };

        let transport_id = TransportId::from(CAPABILITIES_TRANSPORT);

        let mut rtp_media_lines: Vec<_> = kinds
            .iter()
            .enumerate()
            .map(|(line_index, kind)| RtpMediaLine {
                id: MediaLineId::from(match kind {
                    MediaKind::Audio => "audio",
                    MediaKind::Video => "video",
                }),
                line_index,
                transport_id: transport_id.clone(),
                kind: *kind,
                direction: MediaDirection::SendRecv,
                sender_capabilities: Some(
                    self.factory
                        .rtp_capabilities(*kind, CapabilityDirection::Send),
                ),
                receiver_capabilities: Some(
                    self.factory
                        .rtp_capabilities(*kind, CapabilityDirection::Receive),
                ),
            })
            .collect();

        rtp_media_lines.dedup_by_key(|l| l.kind);

        let sctp_media_lines = if options.data {
            vec![SctpMediaLine {
                id: MediaLineId::from("data"),
                line_index: rtp_media_lines.len(),
                transport_id: transport_id.clone(),
                capabilities: self.factory.sctp_capabilities(),
                port: None,
            }]
        } else {
            vec![]
        };

        let description = Description {
            details: Some(self.session_details()),
            transports: vec![TransportDescription {
                id: transport_id,
                rtp: TransportParameters::default(),
                rtcp: None,
                use_mux: true,
            }],
            rtp_media_lines,
            sctp_media_lines,
            rtp_senders: vec![],
        };

        SessionDescription::new(DescriptionType::Capabilities, description)
    }
}

/// Parameters for a sender which hasn't been negotiated yet: the preferred media codec with RTX if available and
/// random SSRCs
fn initial_sender_parameters(
    capabilities: &RtpCapabilities,
    media_line_id: &MediaLineId,
    cname: &str,
) -> RtpParameters {
    let mut parameters = RtpParameters::from_capabilities(capabilities);
    parameters.mux_id = Some(media_line_id.to_string());
    parameters.rtcp.cname = Some(cname.into());
    parameters.rtcp.ssrc = Some(rand::random());

    let media = parameters
        .codecs
        .iter()
        .find(|c| c.kind().role() == CodecRole::Media);

    let rtx = media.and_then(|media| {
        parameters
            .codecs
            .iter()
            .find(|c| c.kind().role() == CodecRole::Rtx && c.apt() == Some(media.payload_type))
    });

    let encoding = EncodingParameters {
        ssrc: Some(rand::random()),
        codec_payload_type: media.map(|c| c.payload_type),
        rtx: rtx.map(|rtx| RtxParameters {
            ssrc: Some(rand::random()),
            payload_type: Some(rtx.payload_type),
        }),
        ..Default::default()
    };

    parameters.encodings = vec![encoding];
    parameters
}
