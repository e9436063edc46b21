use super::State;
use crate::{
    IceServer, MediaLineId, NegotiationState, PeerConnectionEvent, SecureTransportType,
    TransportError, TransportId,
    description::{TransportDescription, TransportParameters},
    entities::{PooledTransport, SecureTransport, TransportDetails, TransportInfo},
    ids::next_free,
    transport::{
        DtlsEvent, DtlsRole, DtlsTransportState, IceCandidate, IceCandidateInit, IceComponent,
        IceGathererEvent, IceGathererState, IceRole, IceTransportEvent, IceTransportState,
        RtpListenerEvent, SrtpSdesEvent, TransportEvent, TransportEventSink,
    },
};
use rtp_params::{CodecRole, pick_encoding_to_fill};
use std::collections::VecDeque;

impl State {
    pub(super) fn sink(&self) -> TransportEventSink {
        TransportEventSink::new(self.this.clone())
    }

    /// Configured ICE servers, or the factory's defaults if none are configured
    pub(super) fn ice_servers(&self) -> Vec<IceServer> {
        if self.config.ice_servers.is_empty() {
            self.factory.default_ice_servers()
        } else {
            self.config.ice_servers.clone()
        }
    }

    fn create_transport_details(
        &mut self,
        id: &TransportId,
        component: IceComponent,
        secure: SecureTransportType,
    ) -> TransportDetails {
        let mut gatherer = self
            .factory
            .create_ice_gatherer(id, component, TransportEventSink::new(self.this.clone()));
        let ice = self
            .factory
            .create_ice_transport(id, component, TransportEventSink::new(self.this.clone()));

        let secure = match secure {
            SecureTransportType::DtlsSrtp => SecureTransport::Dtls {
                transport: self.factory.create_dtls_transport(
                    id,
                    component,
                    TransportEventSink::new(self.this.clone()),
                ),
                state: DtlsTransportState::New,
            },
            SecureTransportType::SdesSrtp => {
                SecureTransport::SrtpSdes(self.factory.create_srtp_sdes_transport(
                    id,
                    component,
                    TransportEventSink::new(self.this.clone()),
                ))
            }
        };

        let servers = self.ice_servers();
        gatherer.gather(&servers, self.config.ice_transport_policy);

        TransportDetails {
            gatherer,
            gatherer_state: IceGathererState::New,
            ice,
            ice_state: IceTransportState::New,
            candidates: vec![],
            end_of_candidates: false,
            secure: Some(secure),
        }
    }

    fn next_transport_id(&mut self) -> TransportId {
        next_free(&mut self.next_transport_id, "t", TransportId, |id| {
            self.transports.contains_key(id) || self.candidate_pool.contains_key(id)
        })
    }

    /// Pre-create transports until the pool holds `ice_candidate_pool_size` of them, surplus ones are closed.
    ///
    /// The pool is only filled before the first local description and discarded once negotiation completed.
    pub(super) fn fill_candidate_pool(&mut self) {
        let size = match self.current_local {
            Some(_) => 0,
            None => usize::from(self.config.ice_candidate_pool_size),
        };

        while self.candidate_pool.len() > size {
            if let Some((id, mut pooled)) = self.candidate_pool.pop_last() {
                log::debug!("closing pooled transport {id}");
                pooled.details.stop(false);
            }
        }

        if self.pending_local.is_some() {
            return;
        }

        while self.candidate_pool.len() < size {
            let id = self.next_transport_id();
            let secure = self.config.secure_transport;

            log::debug!("pre-gathering candidates on pooled transport {id}");

            let details = self.create_transport_details(&id, IceComponent::Rtp, secure);
            self.candidate_pool
                .insert(id, PooledTransport { secure, details });
        }
    }

    fn take_pooled_transport(
        &mut self,
        secure: SecureTransportType,
    ) -> Option<(TransportId, TransportDetails)> {
        let id = self
            .candidate_pool
            .iter()
            .find(|(_, pooled)| pooled.secure == secure)
            .map(|(id, _)| id.clone())?;

        let pooled = self.candidate_pool.remove(&id)?;
        Some((id, pooled.details))
    }

    /// Create a transport and start gathering candidates for it.
    ///
    /// `id` is used if given (transports offered by the peer), otherwise a pooled transport is taken or a new one
    /// is generated.
    pub(super) fn create_transport(
        &mut self,
        id: Option<TransportId>,
        negotiation: NegotiationState,
        with_rtcp: bool,
        secure: SecureTransportType,
    ) -> TransportId {
        let pooled = match &id {
            Some(id) => {
                // the peer picked the id of a pooled transport
                if let Some(mut pooled) = self.candidate_pool.remove(id) {
                    log::debug!("closing pooled transport {id}, its id is taken by the peer");
                    pooled.details.stop(false);
                }

                None
            }
            None => self.take_pooled_transport(secure),
        };

        let (id, rtp) = match (id, pooled) {
            (_, Some((id, rtp))) => {
                log::debug!("using pooled transport {id}");
                (id, rtp)
            }
            (id, None) => {
                let id = id.unwrap_or_else(|| self.next_transport_id());
                let rtp = self.create_transport_details(&id, IceComponent::Rtp, secure);
                (id, rtp)
            }
        };

        log::debug!("creating transport {id} (rtcp: {with_rtcp}, {secure:?})");

        let rtcp =
            with_rtcp.then(|| self.create_transport_details(&id, IceComponent::Rtcp, secure));

        self.transports.insert(
            id.clone(),
            TransportInfo {
                id: id.clone(),
                negotiation,
                rtp,
                rtcp,
                sctp: None,
                started: false,
                restarting: false,
                remote: None,
            },
        );

        id
    }

    /// Secure transport type to use for a transport, data channels always require DTLS
    pub(super) fn secure_transport_type(&self, carries_rtp: bool) -> SecureTransportType {
        if carries_rtp {
            self.config.secure_transport
        } else {
            SecureTransportType::DtlsSrtp
        }
    }

    /// Every transport has local ICE credentials available
    pub(super) fn local_parameters_ready(&self) -> bool {
        self.transports.values().all(|transport| {
            transport
                .details()
                .all(|details| details.gatherer.local_parameters().is_some())
        })
    }

    pub(super) fn local_transport_description(
        &self,
        transport: &TransportInfo,
        dtls_role: DtlsRole,
        use_mux: bool,
        include_rtcp: bool,
    ) -> TransportDescription {
        TransportDescription {
            id: transport.id.clone(),
            rtp: local_transport_parameters(&transport.rtp, dtls_role),
            rtcp: transport
                .rtcp
                .as_ref()
                .filter(|_| include_rtcp)
                .map(|rtcp| local_transport_parameters(rtcp, dtls_role)),
            use_mux,
        }
    }

    /// Stop everything running on the transport
    pub(super) fn stop_transport(transport: &mut TransportInfo) {
        log::debug!("stopping transport {}", transport.id);

        if let Some(sctp) = &mut transport.sctp {
            sctp.transport.stop();
        }

        let started = transport.started;

        for details in transport.details_mut() {
            details.stop(started);
        }
    }

    /// Remove transports no media line refers to anymore
    pub(super) fn remove_unused_transports(&mut self) {
        let rtp_lines = &self.rtp_media_lines;
        let sctp_lines = &self.sctp_media_lines;

        self.transports.retain(|id, transport| {
            let in_use = rtp_lines.values().any(|l| l.transport_id == *id)
                || sctp_lines.values().any(|l| l.transport_id == *id);

            if !in_use {
                Self::stop_transport(transport);
            }

            in_use
        });
    }

    /// Start the ICE and secure transports of a negotiated transport with the peer's parameters
    pub(super) fn start_transport(
        &mut self,
        id: &TransportId,
        remote: &TransportDescription,
        role: IceRole,
    ) {
        let Some(transport) = self.transports.get_mut(id) else {
            return;
        };

        transport.remote = Some(remote.clone());

        if remote.use_mux
            && let Some(mut rtcp) = transport.rtcp.take()
        {
            log::debug!("rtcp-mux negotiated on {id}, dropping rtcp transport");
            rtcp.stop(false);
        }

        if transport.started && !transport.restarting {
            return;
        }

        let restart = transport.started;
        transport.started = true;
        transport.restarting = false;

        let mut errors = vec![];

        let components = [
            (IceComponent::Rtp, Some(&remote.rtp)),
            (IceComponent::Rtcp, remote.rtcp.as_ref()),
        ];

        for (component, parameters) in components {
            let Some(details) = transport.component_mut(component) else {
                continue;
            };

            let Some(parameters) = parameters else {
                log::warn!("peer has no {component:?} parameters for transport {id}");
                continue;
            };

            let result = if restart {
                log::debug!("restarting ICE of {component:?} component of {id}");
                start_ice(details, parameters, role)
            } else {
                start_details(details, parameters, role)
            };

            if let Err(e) = result {
                log::warn!("failed to start {component:?} component of {id}, {e}");
                errors.push(e);
            }
        }

        for error in errors {
            self.notify(PeerConnectionEvent::TransportError {
                transport_id: id.clone(),
                error,
            });
        }
    }

    /// The media line candidates of the transport are reported with
    fn transport_media_line(&self, id: &TransportId) -> Option<(MediaLineId, usize)> {
        let rtp = self
            .rtp_media_lines
            .values()
            .filter(|l| l.transport_id == *id)
            .map(|l| (l.line_index, &l.id));
        let sctp = self
            .sctp_media_lines
            .values()
            .filter(|l| l.transport_id == *id)
            .map(|l| (l.line_index, &l.id));

        rtp.chain(sctp)
            .min()
            .map(|(index, id)| (id.clone(), index))
    }

    /// Transport a remote candidate is meant for, `None` if its media line is unknown or rejected
    fn candidate_transport(&self, candidate: &IceCandidateInit) -> Option<&TransportId> {
        let rtp = self
            .rtp_media_lines
            .values()
            .filter(|l| l.negotiation != NegotiationState::Rejected)
            .map(|l| (&l.id, l.line_index, &l.transport_id));
        let sctp = self
            .sctp_media_lines
            .values()
            .filter(|l| l.negotiation != NegotiationState::Rejected)
            .map(|l| (&l.id, l.line_index, &l.transport_id));
        let mut lines = rtp.chain(sctp);

        if let Some(mid) = &candidate.mid {
            lines
                .find(|(id, _, _)| *id == mid)
                .map(|(_, _, transport_id)| transport_id)
        } else {
            let line_index = candidate.line_index?;

            lines
                .find(|(_, index, _)| *index == line_index)
                .map(|(_, _, transport_id)| transport_id)
        }
    }

    /// Hand remote candidates to their ICE transports once these are running.
    ///
    /// Once negotiation settled, candidates for media lines which don't exist or were rejected are dropped.
    pub(super) fn deliver_pending_candidates(&mut self) {
        let settled = self.current_remote.is_some()
            && self.pending_local.is_none()
            && self.pending_remote.is_none();

        let mut remaining = VecDeque::new();

        while let Some(candidate) = self.pending_candidates.pop_front() {
            let Some(transport_id) = self.candidate_transport(&candidate).cloned() else {
                if settled {
                    log::debug!(
                        "dropping remote candidate for unknown media line (mid: {:?}, index: {:?})",
                        candidate.mid,
                        candidate.line_index
                    );
                } else {
                    remaining.push_back(candidate);
                }

                continue;
            };

            let Some(transport) = self
                .transports
                .get_mut(&transport_id)
                .filter(|t| t.started)
            else {
                remaining.push_back(candidate);
                continue;
            };

            match &candidate.candidate {
                Some(c) => {
                    if let Some(details) = transport.component_mut(c.component) {
                        log::trace!("adding remote candidate {c:?} to {transport_id}");
                        details.ice.add_remote_candidate(c);
                    }
                }
                None => {
                    for details in transport.details_mut() {
                        details.ice.end_of_remote_candidates();
                    }
                }
            }
        }

        self.pending_candidates = remaining;
    }

    pub(super) fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IceGatherer {
                transport_id,
                component,
                event,
            } => self.handle_gatherer_event(transport_id, component, event),
            TransportEvent::IceTransport {
                transport_id,
                component,
                event,
            } => {
                let Some(details) = self
                    .transports
                    .get_mut(&transport_id)
                    .and_then(|t| t.component_mut(component))
                else {
                    log::debug!("ice transport event for unknown transport {transport_id}");
                    return;
                };

                match event {
                    IceTransportEvent::StateChange(state) => {
                        log::debug!("{transport_id} {component:?} ice transport state {state:?}");
                        details.ice_state = state;
                    }
                    IceTransportEvent::CandidatePairChanged(pair) => {
                        log::debug!(
                            "{transport_id} {component:?} selected {} -> {}",
                            pair.local.address,
                            pair.remote.address
                        );
                    }
                    IceTransportEvent::CandidatePairAvailable(pair)
                    | IceTransportEvent::CandidatePairGone(pair) => {
                        log::trace!("{transport_id} {component:?} candidate pair {pair:?}");
                    }
                }
            }
            TransportEvent::Dtls {
                transport_id,
                component,
                event,
            } => {
                let Some(details) = self
                    .transports
                    .get_mut(&transport_id)
                    .and_then(|t| t.component_mut(component))
                else {
                    return;
                };

                let Some(SecureTransport::Dtls { state, .. }) = &mut details.secure else {
                    log::warn!("dtls event for non-dtls transport {transport_id}");
                    return;
                };

                match event {
                    DtlsEvent::StateChange(new) => {
                        log::debug!("{transport_id} {component:?} dtls state {new:?}");
                        *state = new;
                    }
                    DtlsEvent::Error(error) => {
                        *state = DtlsTransportState::Failed;
                        self.transport_error(transport_id, error);
                    }
                }
            }
            TransportEvent::SrtpSdes {
                transport_id,
                event,
                ..
            } => match event {
                SrtpSdesEvent::LifetimeRemaining {
                    least_key_percentage_remaining,
                    overall_percentage_remaining,
                } => {
                    log::debug!(
                        "{transport_id} srtp key lifetime remaining {least_key_percentage_remaining}% (overall {overall_percentage_remaining}%)"
                    );
                }
                SrtpSdesEvent::Error(error) => self.transport_error(transport_id, error),
            },
            TransportEvent::RtpListener {
                transport_id,
                event:
                    RtpListenerEvent::UnhandledRtp {
                        ssrc,
                        payload_type,
                        mid,
                        rid,
                    },
            } => self.handle_unhandled_rtp(transport_id, ssrc, payload_type, mid, rid),
            TransportEvent::Sctp {
                transport_id,
                event,
            } => self.handle_sctp_event(transport_id, event),
        }
    }

    fn transport_error(&mut self, transport_id: TransportId, error: TransportError) {
        log::warn!("transport {transport_id} reported an error, {error}");

        if !self.is_closing() {
            self.notify(PeerConnectionEvent::TransportError {
                transport_id,
                error,
            });
        }
    }

    fn handle_gatherer_event(
        &mut self,
        transport_id: TransportId,
        component: IceComponent,
        event: IceGathererEvent,
    ) {
        let line = self.transport_media_line(&transport_id);
        let closing = self.is_closing();

        let details = match self.transports.get_mut(&transport_id) {
            Some(transport) => transport.component_mut(component),
            None => self
                .candidate_pool
                .get_mut(&transport_id)
                .filter(|_| component == IceComponent::Rtp)
                .map(|pooled| &mut pooled.details),
        };

        let Some(details) = details else {
            log::debug!("gatherer event for unknown transport {transport_id}");
            return;
        };

        let candidate_event = |candidate: Option<IceCandidate>| IceCandidateInit {
            mid: line.as_ref().map(|(id, _)| id.clone()),
            line_index: line.as_ref().map(|(_, index)| *index),
            candidate,
        };

        let event = match event {
            IceGathererEvent::StateChange(state) => {
                details.gatherer_state = state;
                None
            }
            IceGathererEvent::CandidateAvailable(candidate) => {
                details.candidates.push(candidate.clone());
                Some(PeerConnectionEvent::IceCandidate(candidate_event(Some(
                    candidate,
                ))))
            }
            IceGathererEvent::CandidateComplete => {
                details.end_of_candidates = true;
                details.gatherer_state = IceGathererState::Complete;
                Some(PeerConnectionEvent::IceCandidate(candidate_event(None)))
            }
            IceGathererEvent::CandidateGone(candidate) => {
                details.candidates.retain(|c| *c != candidate);
                Some(PeerConnectionEvent::IceCandidateRemoved(candidate_event(
                    Some(candidate),
                )))
            }
            IceGathererEvent::Error(error) => {
                self.transport_error(transport_id, error);
                None
            }
        };

        // pooled transports have no media line to announce candidates with yet
        if let Some(event) = event
            && !closing
            && line.is_some()
        {
            self.notify(event);
        }
    }

    /// Assign the SSRC of an unknown RTP stream to an encoding of a receiver expecting it
    fn handle_unhandled_rtp(
        &mut self,
        transport_id: TransportId,
        ssrc: u32,
        payload_type: u8,
        mid: Option<MediaLineId>,
        rid: Option<String>,
    ) {
        let lines: Vec<_> = self
            .rtp_media_lines
            .values()
            .filter(|l| l.transport_id == transport_id)
            .filter(|l| mid.as_ref().is_none_or(|mid| *mid == l.id))
            .map(|l| (l.kind, l.receivers.clone()))
            .collect();

        for (kind, receiver_ids) in lines {
            for receiver_id in receiver_ids {
                let Some(receiver) = self.receivers.get_mut(&receiver_id) else {
                    continue;
                };

                let Some(parameters) = &mut receiver.parameters else {
                    continue;
                };

                let Some(fill) = pick_encoding_to_fill(Some(kind), payload_type, parameters) else {
                    continue;
                };

                if let Some(rid) = &rid
                    && parameters.encodings[fill.encoding_index]
                        .encoding_id
                        .as_ref()
                        .is_some_and(|id| id != rid)
                {
                    continue;
                }

                let encoding = &mut parameters.encodings[fill.encoding_index];

                match fill.codec_kind.role() {
                    CodecRole::Media | CodecRole::Supplemental => encoding.ssrc = Some(ssrc),
                    CodecRole::Rtx => {
                        if let Some(rtx) = &mut encoding.rtx {
                            rtx.ssrc = Some(ssrc);
                        }
                    }
                    CodecRole::Fec => {
                        if let Some(fec) = &mut encoding.fec {
                            fec.ssrc = Some(ssrc);
                        }
                    }
                }

                log::debug!(
                    "assigned ssrc {ssrc} ({}) to receiver {receiver_id}",
                    fill.supported_codec.name()
                );

                if let Some(rtp_receiver) = &mut receiver.receiver
                    && let Err(e) = rtp_receiver.receive(parameters)
                {
                    self.transport_error(transport_id, e);
                }

                return;
            }
        }

        log::debug!("no receiver on {transport_id} expects ssrc {ssrc} with payload type {payload_type}");
    }
}

fn local_transport_parameters(details: &TransportDetails, dtls_role: DtlsRole) -> TransportParameters {
    let (dtls, srtp_sdes) = match &details.secure {
        Some(SecureTransport::Dtls { transport, .. }) => {
            let mut parameters = transport.local_parameters();
            parameters.role = dtls_role;
            (Some(parameters), None)
        }
        Some(SecureTransport::SrtpSdes(transport)) => (None, Some(transport.local_parameters())),
        None => (None, None),
    };

    TransportParameters {
        ice: details.gatherer.local_parameters(),
        dtls,
        srtp_sdes,
        candidates: details.candidates.clone(),
        end_of_candidates: details.end_of_candidates,
    }
}

fn start_ice(
    details: &mut TransportDetails,
    remote: &TransportParameters,
    role: IceRole,
) -> Result<(), TransportError> {
    let ice = remote
        .ice
        .as_ref()
        .ok_or_else(|| TransportError::new(0, "missing remote ICE parameters"))?;

    details.ice.start(ice, role)?;

    for candidate in &remote.candidates {
        details.ice.add_remote_candidate(candidate);
    }

    if remote.end_of_candidates {
        details.ice.end_of_remote_candidates();
    }

    Ok(())
}

fn start_details(
    details: &mut TransportDetails,
    remote: &TransportParameters,
    role: IceRole,
) -> Result<(), TransportError> {
    start_ice(details, remote, role)?;

    match &mut details.secure {
        Some(SecureTransport::Dtls { transport, state }) => {
            let parameters = remote
                .dtls
                .as_ref()
                .ok_or_else(|| TransportError::new(0, "missing remote DTLS parameters"))?;

            transport.start(parameters)?;
            *state = DtlsTransportState::Connecting;
        }
        Some(SecureTransport::SrtpSdes(transport)) => {
            let parameters = remote
                .srtp_sdes
                .as_ref()
                .ok_or_else(|| TransportError::new(0, "missing remote SDES parameters"))?;

            transport.start(parameters)?;
        }
        None => {}
    }

    Ok(())
}
