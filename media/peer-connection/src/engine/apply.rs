use super::{State, data::SCTP_PORT};
use crate::{
    DescriptionType, Error, MediaLineId, NegotiationState, PeerConnectionEvent, ReceiverId,
    RtcpMuxPolicy, SecureTransportType, SenderId, SessionDescription, TransportId,
    entities::{ReceiverInfo, SctpMediaLineInfo},
    ids::next_free,
    transport::IceRole,
};
use rtp_params::{
    MediaKind, RtpParameters, calculate_delta_changes_in_channels,
    is_generalized_ssrc_compatible_change, negotiate_parameters, pick_codec,
    split_params_into_channels,
};
use std::collections::BTreeSet;

/// How a running RTP sender or receiver must be changed to use new parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelAction {
    Keep,
    /// Same codecs and channels, parameters (including added or removed SSRCs) can be updated in place
    Update,
    /// Channels were added or removed, a new sender/receiver is required
    Replace,
}

fn channel_action(kind: MediaKind, old: &RtpParameters, new: &RtpParameters) -> ChannelAction {
    if old == new {
        return ChannelAction::Keep;
    }

    if is_generalized_ssrc_compatible_change(old, new) {
        return ChannelAction::Update;
    }

    let delta = calculate_delta_changes_in_channels(
        Some(kind),
        &split_params_into_channels(old),
        &split_params_into_channels(new),
    );

    if delta.new.is_empty() && delta.removed.is_empty() {
        ChannelAction::Update
    } else {
        ChannelAction::Replace
    }
}

/// Keep SSRCs learned from incoming packets if the new parameters don't declare them
fn carry_over_ssrcs(old: &RtpParameters, new: &mut RtpParameters) {
    for (old, new) in old.encodings.iter().zip(&mut new.encodings) {
        if old.encoding_id != new.encoding_id {
            continue;
        }

        new.ssrc = new.ssrc.or(old.ssrc);

        if let (Some(old), Some(new)) = (&old.rtx, &mut new.rtx) {
            new.ssrc = new.ssrc.or(old.ssrc);
        }

        if let (Some(old), Some(new)) = (&old.fec, &mut new.fec) {
            new.ssrc = new.ssrc.or(old.ssrc);
        }
    }
}

struct SenderPlan {
    id: SenderId,
    transport_id: TransportId,
    /// `None` if the peer doesn't receive on the media line
    parameters: Option<RtpParameters>,
}

struct ReceiverPlan {
    existing: Option<ReceiverId>,
    media_line_id: MediaLineId,
    transport_id: TransportId,
    kind: MediaKind,
    remote_sender_id: SenderId,
    track_id: Option<String>,
    stream_ids: Vec<String>,
    parameters: RtpParameters,
}

/// Everything an answer changes, computed before anything is touched
struct AnswerPlan {
    rejected_rtp: Vec<MediaLineId>,
    rejected_sctp: Vec<MediaLineId>,
    ice_role: IceRole,
    senders: Vec<SenderPlan>,
    receivers: Vec<ReceiverPlan>,
    removed_receivers: Vec<ReceiverId>,
}

impl State {
    pub(super) fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), Error> {
        match description.kind {
            DescriptionType::Offer => {
                if self.pending_remote.is_some() {
                    return Err(Error::InvalidState(
                        "cannot set a local offer while a remote offer is pending".into(),
                    ));
                }

                self.apply_local_offer(&description)?;
                self.pending_local = Some(description);
                self.negotiation_dirty = false;

                Ok(())
            }
            DescriptionType::Answer | DescriptionType::PrAnswer => {
                if self.pending_remote.as_ref().map(|d| d.kind) != Some(DescriptionType::Offer) {
                    return Err(Error::InvalidState(
                        "cannot set a local answer without a pending remote offer".into(),
                    ));
                }

                self.apply_answer(description, false)
            }
            DescriptionType::Rollback => self.rollback(),
            DescriptionType::Capabilities => Err(Error::InvalidParameters(
                "a capabilities description cannot be set as local description".into(),
            )),
        }
    }

    pub(super) fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), Error> {
        match description.kind {
            DescriptionType::Offer => {
                if self.pending_local.is_some() {
                    return Err(Error::InvalidState(
                        "cannot set a remote offer while a local offer is pending".into(),
                    ));
                }

                self.validate_remote_offer(&description)?;

                if self.pending_remote.is_some() {
                    self.rollback_remote();
                }

                self.discard_unapplied_local();
                self.apply_remote_offer(&description);
                self.pending_remote = Some(description);

                Ok(())
            }
            DescriptionType::Answer | DescriptionType::PrAnswer => {
                if self.pending_local.as_ref().map(|d| d.kind) != Some(DescriptionType::Offer) {
                    return Err(Error::InvalidState(
                        "cannot set a remote answer without a pending local offer".into(),
                    ));
                }

                self.apply_answer(description, true)
            }
            DescriptionType::Rollback => self.rollback(),
            DescriptionType::Capabilities => {
                log::debug!("storing remote capabilities");
                self.remote_capabilities = Some(description);
                Ok(())
            }
        }
    }

    /// Check that everything the local offer refers to exists, then mark it as offered
    fn apply_local_offer(&mut self, description: &SessionDescription) -> Result<(), Error> {
        let d = &description.description;

        for line in &d.rtp_media_lines {
            match self.rtp_media_lines.get(&line.id) {
                Some(info) if info.kind == line.kind => {}
                Some(_) => {
                    return Err(Error::InvalidParameters(format!(
                        "media line {} changed its kind",
                        line.id
                    )));
                }
                None => {
                    return Err(Error::InvalidParameters(format!(
                        "unknown media line {}",
                        line.id
                    )));
                }
            }
        }

        if let Some(line) = d
            .sctp_media_lines
            .iter()
            .find(|l| !self.sctp_media_lines.contains_key(&l.id))
        {
            return Err(Error::InvalidParameters(format!(
                "unknown sctp media line {}",
                line.id
            )));
        }

        if let Some(transport) = d
            .transports
            .iter()
            .find(|t| !self.transports.contains_key(&t.id))
        {
            return Err(Error::InvalidParameters(format!(
                "unknown transport {}",
                transport.id
            )));
        }

        if let Some(sender) = d
            .rtp_senders
            .iter()
            .find(|s| !self.senders.contains_key(&s.id))
        {
            return Err(Error::InvalidParameters(format!(
                "unknown sender {}",
                sender.id
            )));
        }

        let offered = |negotiation: &mut NegotiationState| {
            if *negotiation == NegotiationState::PendingOffer {
                *negotiation = NegotiationState::LocalOffered;
            }
        };

        for transport in &d.transports {
            if let Some(info) = self.transports.get_mut(&transport.id) {
                offered(&mut info.negotiation);
            }
        }

        for line in &d.rtp_media_lines {
            if let Some(info) = self.rtp_media_lines.get_mut(&line.id) {
                offered(&mut info.negotiation);
                info.direction = line.direction;
                info.transport_id = line.transport_id.clone();
            }
        }

        for line in &d.sctp_media_lines {
            if let Some(info) = self.sctp_media_lines.get_mut(&line.id) {
                offered(&mut info.negotiation);
                info.transport_id = line.transport_id.clone();
            }
        }

        for sender in &d.rtp_senders {
            self.attach_sender(&sender.id, &sender.media_line_id);

            if let Some(info) = self.senders.get_mut(&sender.id) {
                offered(&mut info.negotiation);
                info.offered = Some(sender.parameters.clone());
            }
        }

        Ok(())
    }

    fn validate_remote_offer(&self, description: &SessionDescription) -> Result<(), Error> {
        let d = &description.description;

        for transport in &d.transports {
            if !transport.use_mux && self.config.rtcp_mux_policy == RtcpMuxPolicy::Require {
                return Err(Error::Negotiation(format!(
                    "transport {} doesn't multiplex RTCP",
                    transport.id
                )));
            }

            let carries_rtp = d
                .rtp_media_lines
                .iter()
                .any(|l| l.transport_id == transport.id);
            let secure = self.secure_transport_type(carries_rtp);

            for parameters in std::iter::once(&transport.rtp).chain(transport.rtcp.as_ref()) {
                if parameters.ice.is_none() {
                    return Err(Error::Negotiation(format!(
                        "transport {} has no ICE parameters",
                        transport.id
                    )));
                }

                let has_secure = match secure {
                    SecureTransportType::DtlsSrtp => parameters.dtls.is_some(),
                    SecureTransportType::SdesSrtp => parameters.srtp_sdes.is_some(),
                };

                if !has_secure {
                    return Err(Error::Negotiation(format!(
                        "transport {} has no {secure:?} parameters",
                        transport.id
                    )));
                }
            }
        }

        for line in &d.rtp_media_lines {
            if let Some(info) = self.rtp_media_lines.get(&line.id)
                && info.negotiation == NegotiationState::Agreed
                && info.kind != line.kind
            {
                return Err(Error::Negotiation(format!(
                    "media line {} changed its kind",
                    line.id
                )));
            }

            if self
                .sctp_media_lines
                .get(&line.id)
                .is_some_and(|l| l.negotiation == NegotiationState::Agreed)
            {
                return Err(Error::Negotiation(format!(
                    "media line {} changed from data to media",
                    line.id
                )));
            }
        }

        for line in &d.sctp_media_lines {
            if self
                .rtp_media_lines
                .get(&line.id)
                .is_some_and(|l| l.negotiation == NegotiationState::Agreed)
            {
                return Err(Error::Negotiation(format!(
                    "media line {} changed from media to data",
                    line.id
                )));
            }
        }

        Ok(())
    }

    /// Remove media lines and transports created for a local offer which was never applied
    fn discard_unapplied_local(&mut self) {
        let unapplied = |n: NegotiationState| {
            matches!(
                n,
                NegotiationState::PendingOffer | NegotiationState::LocalOffered
            )
        };

        let rtp: Vec<_> = self
            .rtp_media_lines
            .values()
            .filter(|l| unapplied(l.negotiation))
            .map(|l| l.id.clone())
            .collect();

        for id in rtp {
            log::debug!("discarding unapplied media line {id}");
            self.remove_rtp_media_line(&id, false);
        }

        self.sctp_media_lines.retain(|_, l| !unapplied(l.negotiation));

        for sender in self.senders.values_mut() {
            if sender.negotiation == NegotiationState::LocalOffered {
                sender.negotiation = NegotiationState::PendingOffer;
                sender.offered = None;
            }
        }

        self.transports.retain(|_, transport| {
            if unapplied(transport.negotiation) {
                Self::stop_transport(transport);
                false
            } else {
                true
            }
        });
    }

    /// Create the transports, media lines and receivers the peer offered
    fn apply_remote_offer(&mut self, description: &SessionDescription) {
        let d = &description.description;

        for remote in &d.transports {
            let carries_rtp = d
                .rtp_media_lines
                .iter()
                .any(|l| l.transport_id == remote.id);

            match self.transports.get_mut(&remote.id) {
                Some(transport) => {
                    let restart = transport.started
                        && transport
                            .remote
                            .as_ref()
                            .is_some_and(|current| current.rtp.ice != remote.rtp.ice);

                    if restart && !transport.restarting {
                        log::info!("peer restarted ICE on transport {}", remote.id);

                        for details in transport.details_mut() {
                            details.gatherer.restart();
                            details.candidates.clear();
                            details.end_of_candidates = false;
                        }

                        transport.restarting = true;
                    }
                }
                None => {
                    let with_rtcp = carries_rtp
                        && remote.rtcp.is_some()
                        && self.config.rtcp_mux_policy == RtcpMuxPolicy::Negotiate;
                    let secure = self.secure_transport_type(carries_rtp);

                    self.create_transport(
                        Some(remote.id.clone()),
                        NegotiationState::RemoteOffered,
                        with_rtcp,
                        secure,
                    );
                }
            }
        }

        for remote in &d.rtp_media_lines {
            match self.rtp_media_lines.get_mut(&remote.id) {
                Some(line) => line.transport_id = remote.transport_id.clone(),
                None => self.insert_rtp_media_line(
                    remote.id.clone(),
                    remote.line_index,
                    remote.transport_id.clone(),
                    remote.kind,
                    NegotiationState::RemoteOffered,
                ),
            }
        }

        for remote in &d.sctp_media_lines {
            match self.sctp_media_lines.get_mut(&remote.id) {
                Some(line) => line.transport_id = remote.transport_id.clone(),
                None => {
                    log::debug!("peer offered sctp media line {}", remote.id);

                    self.sctp_media_lines.insert(
                        remote.id.clone(),
                        SctpMediaLineInfo {
                            id: remote.id.clone(),
                            line_index: remote.line_index,
                            transport_id: remote.transport_id.clone(),
                            negotiation: NegotiationState::RemoteOffered,
                            port: SCTP_PORT,
                            remote: None,
                        },
                    );
                }
            }
        }

        for remote in &d.rtp_senders {
            let exists = self
                .receivers
                .values()
                .any(|r| r.media_line_id == remote.media_line_id && r.remote_sender_id == remote.id);

            let Some(kind) = self
                .rtp_media_lines
                .get(&remote.media_line_id)
                .map(|l| l.kind)
            else {
                continue;
            };

            if exists {
                continue;
            }

            let id = next_free(&mut self.next_receiver_id, "r", ReceiverId, |id| {
                self.receivers.contains_key(id)
            });

            if let Some(line) = self.rtp_media_lines.get_mut(&remote.media_line_id) {
                line.receivers.insert(id.clone());
            }

            self.receivers.insert(
                id.clone(),
                ReceiverInfo {
                    id: id.clone(),
                    media_line_id: remote.media_line_id.clone(),
                    negotiation: NegotiationState::RemoteOffered,
                    kind,
                    remote_sender_id: remote.id.clone(),
                    track_id: remote.track_id.clone().unwrap_or_else(|| id.to_string()),
                    stream_ids: remote.stream_ids.clone(),
                    receiver: None,
                    receiver_transport: None,
                    parameters: None,
                },
            );
        }

        // Tracks added before the offer arrived are sent on offered lines the peer wants to receive on
        let unattached: Vec<_> = self
            .senders
            .values()
            .filter(|s| s.media_line_id.is_none())
            .map(|s| (s.id.clone(), s.track.kind))
            .collect();

        for (sender_id, kind) in unattached {
            let line = d
                .rtp_media_lines
                .iter()
                .filter(|l| l.kind == kind && l.direction.receives())
                .filter(|l| {
                    self.rtp_media_lines
                        .get(&l.id)
                        .is_some_and(|info| info.senders.is_empty())
                })
                .min_by_key(|l| l.line_index)
                .map(|l| l.id.clone());

            if let Some(line_id) = line {
                log::debug!("sending {sender_id} on offered media line {line_id}");
                self.attach_sender(&sender_id, &line_id);
            }
        }
    }

    /// Apply an answer to the pending offer.
    ///
    /// `local_is_offerer` is true if the offer is the pending local description and the answer came from the peer.
    fn apply_answer(
        &mut self,
        answer: SessionDescription,
        local_is_offerer: bool,
    ) -> Result<(), Error> {
        let offer = if local_is_offerer {
            self.pending_local.clone()
        } else {
            self.pending_remote.clone()
        }
        .filter(|d| d.kind == DescriptionType::Offer)
        .ok_or_else(|| Error::InvalidState("no pending offer".into()))?;

        let plan = self.plan_answer(&offer, &answer, local_is_offerer)?;

        let is_final = answer.kind == DescriptionType::Answer;
        let (local, remote) = if local_is_offerer {
            (&offer, &answer)
        } else {
            (&answer, &offer)
        };

        // a provisional answer may leave out lines the final answer still accepts
        if is_final {
            for id in &plan.rejected_rtp {
                self.reject_rtp_media_line(id);
            }

            for id in &plan.rejected_sctp {
                self.reject_sctp_media_line(id);
            }

            self.reject_unused_transports();
        }

        for transport in &answer.description.transports {
            let Some(remote_transport) = remote.description.transport(&transport.id) else {
                continue;
            };

            let mut remote_transport = remote_transport.clone();
            // the answer decides about rtcp-mux
            remote_transport.use_mux = transport.use_mux;

            self.start_transport(&transport.id, &remote_transport, plan.ice_role);

            if is_final && let Some(info) = self.transports.get_mut(&transport.id) {
                info.negotiation = NegotiationState::Agreed;
            }
        }

        for line in &answer.description.rtp_media_lines {
            let (Some(info), Some(local_line), Some(remote_line)) = (
                self.rtp_media_lines.get_mut(&line.id),
                local.description.rtp_media_line(&line.id),
                remote.description.rtp_media_line(&line.id),
            ) else {
                continue;
            };

            info.remote = Some(remote_line.clone());
            info.direction = local_line.direction;
            info.transport_id = line.transport_id.clone();

            if is_final {
                info.negotiation = NegotiationState::Agreed;
            }
        }

        for line in &answer.description.sctp_media_lines {
            let (Some(info), Some(remote_line)) = (
                self.sctp_media_lines.get_mut(&line.id),
                remote.description.sctp_media_line(&line.id),
            ) else {
                continue;
            };

            info.remote = Some(remote_line.clone());
            info.transport_id = line.transport_id.clone();

            if is_final {
                info.negotiation = NegotiationState::Agreed;
            }
        }

        if !is_final {
            log::debug!("applied provisional answer");

            if local_is_offerer {
                self.pending_remote = Some(answer);
            } else {
                self.pending_local = Some(answer);
            }

            return Ok(());
        }

        self.is_offerer = Some(local_is_offerer);

        for sender in plan.senders {
            self.apply_sender_plan(sender);
        }

        for id in plan.removed_receivers {
            self.remove_receiver(&id);
        }

        for receiver in plan.receivers {
            self.apply_receiver_plan(receiver);
        }

        self.remove_unused_transports();
        self.start_sctp_transports();
        self.open_data_channels();

        if local_is_offerer {
            self.current_local = self.pending_local.take();
            self.current_remote = Some(answer);
            self.pending_remote = None;
        } else {
            self.current_remote = self.pending_remote.take();
            self.current_local = Some(answer);
            self.pending_local = None;
        }

        self.fill_candidate_pool();

        log::debug!("negotiation complete");

        Ok(())
    }

    fn plan_answer(
        &self,
        offer: &SessionDescription,
        answer: &SessionDescription,
        local_is_offerer: bool,
    ) -> Result<AnswerPlan, Error> {
        let (local, remote) = if local_is_offerer {
            (offer, answer)
        } else {
            (answer, offer)
        };

        for (_, id) in answer.description.media_line_ids() {
            if !offer.description.has_media_line(&id) {
                return Err(Error::Negotiation(format!(
                    "answer contains media line {id} which wasn't offered"
                )));
            }
        }

        for line in &answer.description.rtp_media_lines {
            if offer
                .description
                .rtp_media_line(&line.id)
                .is_none_or(|offered| offered.kind != line.kind)
                || !self.rtp_media_lines.contains_key(&line.id)
            {
                return Err(Error::Negotiation(format!(
                    "answered media line {} doesn't match the offer",
                    line.id
                )));
            }
        }

        for line in &answer.description.sctp_media_lines {
            if !self.sctp_media_lines.contains_key(&line.id) {
                return Err(Error::Negotiation(format!(
                    "answered sctp media line {} doesn't match the offer",
                    line.id
                )));
            }
        }

        for transport in &answer.description.transports {
            if offer.description.transport(&transport.id).is_none()
                || !self.transports.contains_key(&transport.id)
            {
                return Err(Error::Negotiation(format!(
                    "answered transport {} wasn't offered",
                    transport.id
                )));
            }

            if !transport.use_mux && self.config.rtcp_mux_policy == RtcpMuxPolicy::Require {
                return Err(Error::Negotiation(format!(
                    "transport {} doesn't multiplex RTCP",
                    transport.id
                )));
            }

            let remote_transport = remote
                .description
                .transport(&transport.id)
                .expect("transport was checked to exist in both descriptions");

            if remote_transport.rtp.ice.is_none() {
                return Err(Error::Negotiation(format!(
                    "transport {} has no ICE parameters",
                    transport.id
                )));
            }
        }

        let rejected_rtp = offer
            .description
            .rtp_media_lines
            .iter()
            .filter(|l| !answer.description.has_media_line(&l.id))
            .filter(|l| {
                self.rtp_media_lines
                    .get(&l.id)
                    .is_some_and(|l| l.negotiation != NegotiationState::Rejected)
            })
            .map(|l| l.id.clone())
            .collect();

        let rejected_sctp = offer
            .description
            .sctp_media_lines
            .iter()
            .filter(|l| !answer.description.has_media_line(&l.id))
            .filter(|l| {
                self.sctp_media_lines
                    .get(&l.id)
                    .is_some_and(|l| l.negotiation != NegotiationState::Rejected)
            })
            .map(|l| l.id.clone())
            .collect();

        let remote_is_lite = remote
            .description
            .transports
            .iter()
            .any(|t| t.rtp.ice.as_ref().is_some_and(|ice| ice.ice_lite));

        let ice_role = if local_is_offerer || remote_is_lite {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        };

        let mut senders = vec![];
        let mut receivers = vec![];
        let mut kept_receivers = BTreeSet::new();
        let mut answered_lines = BTreeSet::new();

        for line in &answer.description.rtp_media_lines {
            let info = &self.rtp_media_lines[&line.id];
            answered_lines.insert(line.id.clone());

            let (Some(local_line), Some(remote_line)) = (
                local.description.rtp_media_line(&line.id),
                remote.description.rtp_media_line(&line.id),
            ) else {
                continue;
            };

            for sender_id in &info.senders {
                let described = local
                    .description
                    .rtp_senders
                    .iter()
                    .find(|s| s.id == *sender_id && s.media_line_id == line.id);

                let parameters = match described {
                    Some(described) if remote_line.direction.receives() => {
                        match (&remote_line.receiver_capabilities, local_is_offerer) {
                            (Some(capabilities), true) => Some(
                                negotiate_parameters(&described.parameters, capabilities)
                                    .ok_or_else(|| {
                                        Error::Negotiation(format!(
                                            "peer can't receive any codec of sender {sender_id}"
                                        ))
                                    })?,
                            ),
                            _ => Some(described.parameters.clone()),
                        }
                    }
                    _ => None,
                };

                senders.push(SenderPlan {
                    id: sender_id.clone(),
                    transport_id: line.transport_id.clone(),
                    parameters,
                });
            }

            if !local_line.direction.receives() {
                continue;
            }

            let capabilities = local_line
                .receiver_capabilities
                .as_ref()
                .unwrap_or(&info.local_receiver_capabilities);

            for remote_sender in remote
                .description
                .rtp_senders
                .iter()
                .filter(|s| s.media_line_id == line.id)
            {
                let parameters = negotiate_parameters(&remote_sender.parameters, capabilities)
                    .ok_or_else(|| {
                        Error::Negotiation(format!(
                            "no codec of remote sender {} can be received",
                            remote_sender.id
                        ))
                    })?;

                for channel in split_params_into_channels(&parameters) {
                    if pick_codec(
                        Some(info.kind),
                        &channel,
                        None,
                        channel.encodings.first(),
                        None,
                    )
                    .is_none()
                    {
                        return Err(Error::Negotiation(format!(
                            "an encoding of remote sender {} has no usable codec",
                            remote_sender.id
                        )));
                    }
                }

                let existing = self
                    .receivers
                    .values()
                    .find(|r| r.media_line_id == line.id && r.remote_sender_id == remote_sender.id)
                    .map(|r| r.id.clone());

                if let Some(id) = &existing {
                    kept_receivers.insert(id.clone());
                }

                receivers.push(ReceiverPlan {
                    existing,
                    media_line_id: line.id.clone(),
                    transport_id: line.transport_id.clone(),
                    kind: info.kind,
                    remote_sender_id: remote_sender.id.clone(),
                    track_id: remote_sender.track_id.clone(),
                    stream_ids: remote_sender.stream_ids.clone(),
                    parameters,
                });
            }
        }

        let removed_receivers = self
            .receivers
            .values()
            .filter(|r| answered_lines.contains(&r.media_line_id) && !kept_receivers.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();

        Ok(AnswerPlan {
            rejected_rtp,
            rejected_sctp,
            ice_role,
            senders,
            receivers,
            removed_receivers,
        })
    }

    fn apply_sender_plan(&mut self, plan: SenderPlan) {
        let Some(sender) = self.senders.get_mut(&plan.id) else {
            return;
        };

        sender.negotiation = NegotiationState::Agreed;

        let Some(parameters) = plan.parameters else {
            if let Some(mut rtp_sender) = sender.sender.take() {
                log::debug!("peer doesn't receive {}, stopping sender", plan.id);
                rtp_sender.stop();
            }

            sender.sender_transport = None;
            sender.parameters = None;
            return;
        };

        let action = match (&sender.sender, &sender.parameters) {
            (Some(_), Some(old)) if sender.sender_transport.as_ref() == Some(&plan.transport_id) => {
                channel_action(sender.track.kind, old, &parameters)
            }
            _ => ChannelAction::Replace,
        };

        log::debug!("sender {} {action:?}", plan.id);

        let result = match action {
            ChannelAction::Keep => Ok(()),
            ChannelAction::Update => match &mut sender.sender {
                Some(rtp_sender) => rtp_sender.send(&parameters),
                None => Ok(()),
            },
            ChannelAction::Replace => {
                if let Some(mut old) = sender.sender.take() {
                    old.stop();
                }

                let mut rtp_sender = self
                    .factory
                    .create_rtp_sender(&plan.transport_id, &sender.track);
                let result = rtp_sender.send(&parameters);

                sender.sender = Some(rtp_sender);
                sender.sender_transport = Some(plan.transport_id.clone());
                result
            }
        };

        sender.parameters = Some(parameters);

        if let Err(error) = result {
            log::warn!("failed to start sender {}, {error}", plan.id);
            self.notify(PeerConnectionEvent::TransportError {
                transport_id: plan.transport_id,
                error,
            });
        }
    }

    fn apply_receiver_plan(&mut self, plan: ReceiverPlan) {
        let id = match plan.existing {
            Some(id) => id,
            None => {
                let id = next_free(&mut self.next_receiver_id, "r", ReceiverId, |id| {
                    self.receivers.contains_key(id)
                });

                if let Some(line) = self.rtp_media_lines.get_mut(&plan.media_line_id) {
                    line.receivers.insert(id.clone());
                }

                self.receivers.insert(
                    id.clone(),
                    ReceiverInfo {
                        id: id.clone(),
                        media_line_id: plan.media_line_id.clone(),
                        negotiation: NegotiationState::Agreed,
                        kind: plan.kind,
                        remote_sender_id: plan.remote_sender_id.clone(),
                        track_id: plan.track_id.clone().unwrap_or_else(|| id.to_string()),
                        stream_ids: plan.stream_ids.clone(),
                        receiver: None,
                        receiver_transport: None,
                        parameters: None,
                    },
                );

                id
            }
        };

        let sink = self.sink();

        let Some(receiver) = self.receivers.get_mut(&id) else {
            return;
        };

        receiver.negotiation = NegotiationState::Agreed;
        receiver.stream_ids = plan.stream_ids;

        let mut parameters = plan.parameters;

        let action = match (&receiver.receiver, &receiver.parameters) {
            (Some(_), Some(old))
                if receiver.receiver_transport.as_ref() == Some(&plan.transport_id) =>
            {
                carry_over_ssrcs(old, &mut parameters);
                channel_action(plan.kind, old, &parameters)
            }
            _ => ChannelAction::Replace,
        };

        log::debug!("receiver {id} {action:?}");

        let mut added = false;

        let result = match action {
            ChannelAction::Keep => Ok(()),
            ChannelAction::Update => match &mut receiver.receiver {
                Some(rtp_receiver) => rtp_receiver.receive(&parameters),
                None => Ok(()),
            },
            ChannelAction::Replace => {
                let replaced = match receiver.receiver.take() {
                    Some(mut old) => {
                        old.stop();
                        true
                    }
                    None => false,
                };

                let mut rtp_receiver =
                    self.factory
                        .create_rtp_receiver(&plan.transport_id, plan.kind, sink);
                let result = rtp_receiver.receive(&parameters);

                receiver.track_id = rtp_receiver.track_id();
                receiver.receiver = Some(rtp_receiver);
                receiver.receiver_transport = Some(plan.transport_id.clone());

                added = !replaced;
                result
            }
        };

        receiver.parameters = Some(parameters);

        let event = added.then(|| PeerConnectionEvent::TrackAdded {
            receiver_id: receiver.id.clone(),
            kind: receiver.kind,
            track_id: receiver.track_id.clone(),
            stream_ids: receiver.stream_ids.clone(),
        });

        if let Err(error) = result {
            log::warn!("failed to start receiver {id}, {error}");
            self.notify(PeerConnectionEvent::TransportError {
                transport_id: plan.transport_id,
                error,
            });
        }

        if let Some(event) = event {
            self.notify(event);
        }
    }

    fn remove_receiver(&mut self, id: &ReceiverId) {
        let Some(mut receiver) = self.receivers.remove(id) else {
            return;
        };

        if let Some(line) = self.rtp_media_lines.get_mut(&receiver.media_line_id) {
            line.receivers.remove(id);
        }

        if let Some(mut rtp_receiver) = receiver.receiver.take() {
            log::debug!("removing receiver {id}");

            rtp_receiver.stop();
            self.notify(PeerConnectionEvent::TrackRemoved {
                receiver_id: id.clone(),
            });
        }
    }

    /// Stop everything running on a media line the answer left out and mark it as rejected.
    ///
    /// The line with its senders and receivers is removed by [`State::prune_rejected`].
    fn reject_rtp_media_line(&mut self, id: &MediaLineId) {
        let Some(line) = self.rtp_media_lines.get_mut(id) else {
            return;
        };

        log::info!("media line {id} was rejected");

        line.negotiation = NegotiationState::Rejected;

        let senders = line.senders.clone();
        let receivers = line.receivers.clone();

        for sender_id in &senders {
            if let Some(sender) = self.senders.get_mut(sender_id) {
                sender.negotiation = NegotiationState::Rejected;
                sender.sender_transport = None;

                if let Some(mut rtp_sender) = sender.sender.take() {
                    rtp_sender.stop();
                }
            }
        }

        for receiver_id in &receivers {
            let Some(receiver) = self.receivers.get_mut(receiver_id) else {
                continue;
            };

            receiver.negotiation = NegotiationState::Rejected;

            if let Some(mut rtp_receiver) = receiver.receiver.take() {
                rtp_receiver.stop();
                self.notify(PeerConnectionEvent::TrackRemoved {
                    receiver_id: receiver_id.clone(),
                });
            }
        }

        self.notify(PeerConnectionEvent::MediaLineRejected { id: id.clone() });
    }

    fn reject_sctp_media_line(&mut self, id: &MediaLineId) {
        let Some(line) = self.sctp_media_lines.get_mut(id) else {
            return;
        };

        log::info!("sctp media line {id} was rejected");

        line.negotiation = NegotiationState::Rejected;

        self.close_all_data_channels();
        self.notify(PeerConnectionEvent::MediaLineRejected { id: id.clone() });
    }

    /// Transports only used by rejected media lines are rejected as well
    fn reject_unused_transports(&mut self) {
        let rtp_lines = &self.rtp_media_lines;
        let sctp_lines = &self.sctp_media_lines;

        for transport in self.transports.values_mut() {
            let in_use = rtp_lines
                .values()
                .filter(|l| l.negotiation != NegotiationState::Rejected)
                .any(|l| l.transport_id == transport.id)
                || sctp_lines
                    .values()
                    .filter(|l| l.negotiation != NegotiationState::Rejected)
                    .any(|l| l.transport_id == transport.id);

            if !in_use {
                log::debug!("transport {} was rejected", transport.id);
                transport.negotiation = NegotiationState::Rejected;
            }
        }
    }

    pub(super) fn has_rejected(&self) -> bool {
        self.rtp_media_lines
            .values()
            .any(|l| l.negotiation == NegotiationState::Rejected)
            || self
                .sctp_media_lines
                .values()
                .any(|l| l.negotiation == NegotiationState::Rejected)
    }

    /// Remove rejected media lines together with their senders, receivers and transports
    pub(super) fn prune_rejected(&mut self) {
        if !self.has_rejected() {
            return;
        }

        let rejected: Vec<_> = self
            .rtp_media_lines
            .values()
            .filter(|l| l.negotiation == NegotiationState::Rejected)
            .map(|l| l.id.clone())
            .collect();

        for id in rejected {
            log::debug!("pruning rejected media line {id}");
            self.remove_rtp_media_line(&id, true);
        }

        self.sctp_media_lines
            .retain(|_, l| l.negotiation != NegotiationState::Rejected);

        self.remove_unused_transports();
    }

    /// Remove an RTP media line with its receivers.
    ///
    /// Senders are removed as well if the line was rejected, else they are detached and offered again.
    fn remove_rtp_media_line(&mut self, id: &MediaLineId, rejected: bool) {
        let Some(line) = self.rtp_media_lines.remove(id) else {
            return;
        };

        for receiver_id in &line.receivers {
            self.remove_receiver(receiver_id);
        }

        for sender_id in &line.senders {
            if rejected {
                if let Some(mut sender) = self.senders.remove(sender_id)
                    && let Some(rtp_sender) = &mut sender.sender
                {
                    rtp_sender.stop();
                }
            } else if let Some(sender) = self.senders.get_mut(sender_id) {
                sender.media_line_id = None;
                sender.negotiation = NegotiationState::PendingOffer;
                sender.offered = None;
            }
        }
    }

    /// Discard the pending offer, whichever side it came from
    fn rollback(&mut self) -> Result<(), Error> {
        let local_offer = self.pending_local.as_ref().map(|d| d.kind) == Some(DescriptionType::Offer);
        let remote_offer =
            self.pending_remote.as_ref().map(|d| d.kind) == Some(DescriptionType::Offer);

        if local_offer {
            self.rollback_local();
            Ok(())
        } else if remote_offer {
            self.rollback_remote();
            Ok(())
        } else {
            Err(Error::InvalidState("there is no pending offer to roll back".into()))
        }
    }

    fn rollback_local(&mut self) {
        log::debug!("rolling back local offer");

        let lines: Vec<_> = self
            .rtp_media_lines
            .values()
            .filter(|l| l.negotiation == NegotiationState::LocalOffered)
            .map(|l| l.id.clone())
            .collect();

        for id in lines {
            self.remove_rtp_media_line(&id, false);
        }

        self.sctp_media_lines
            .retain(|_, l| l.negotiation != NegotiationState::LocalOffered);

        for sender in self.senders.values_mut() {
            match sender.negotiation {
                NegotiationState::LocalOffered => {
                    sender.negotiation = NegotiationState::PendingOffer;
                    sender.offered = None;
                }
                NegotiationState::Agreed => sender.offered = sender.parameters.clone(),
                _ => {}
            }
        }

        self.restore_agreed_lines();
        self.prune_offered_transports(NegotiationState::LocalOffered);
        self.pending_local = None;
        self.negotiation_dirty = true;
    }

    fn rollback_remote(&mut self) {
        log::debug!("rolling back remote offer");

        let lines: Vec<_> = self
            .rtp_media_lines
            .values()
            .filter(|l| l.negotiation == NegotiationState::RemoteOffered)
            .map(|l| l.id.clone())
            .collect();

        for id in lines {
            self.remove_rtp_media_line(&id, false);
        }

        self.sctp_media_lines
            .retain(|_, l| l.negotiation != NegotiationState::RemoteOffered);

        let receivers: Vec<_> = self
            .receivers
            .values()
            .filter(|r| r.negotiation == NegotiationState::RemoteOffered)
            .map(|r| r.id.clone())
            .collect();

        for id in receivers {
            self.remove_receiver(&id);
        }

        // senders attached to agreed lines while the offer was pending
        for sender in self.senders.values_mut() {
            if sender.negotiation == NegotiationState::PendingOffer
                && let Some(line_id) = sender.media_line_id.take()
                && let Some(line) = self.rtp_media_lines.get_mut(&line_id)
            {
                line.senders.remove(&sender.id);
            }
        }

        self.restore_agreed_lines();
        self.prune_offered_transports(NegotiationState::RemoteOffered);
        self.pending_remote = None;
        self.pending_local = None;
    }

    /// Reset direction and transport of agreed media lines to the current local description
    fn restore_agreed_lines(&mut self) {
        let Some(current) = &self.current_local else {
            return;
        };

        for line in &current.description.rtp_media_lines {
            if let Some(info) = self.rtp_media_lines.get_mut(&line.id) {
                info.direction = line.direction;
                info.transport_id = line.transport_id.clone();
            }
        }

        for line in &current.description.sctp_media_lines {
            if let Some(info) = self.sctp_media_lines.get_mut(&line.id) {
                info.transport_id = line.transport_id.clone();
            }
        }
    }

    /// Remove transports left without media lines, the remaining ones must be offered again
    fn prune_offered_transports(&mut self, offered: NegotiationState) {
        self.remove_unused_transports();

        for transport in self.transports.values_mut() {
            if transport.negotiation == offered {
                transport.negotiation = NegotiationState::PendingOffer;
            }
        }
    }
}
