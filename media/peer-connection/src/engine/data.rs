use super::State;
use crate::{
    DataChannel, DataChannelEvent, DataChannelState, NegotiationState, PeerConnectionEvent,
    TransportId,
    entities::{SctpInfo, SctpMediaLineInfo},
    transport::{SctpEvent, SctpTransportState},
};
use std::{collections::BTreeSet, sync::atomic::Ordering};

/// Port announced for the SCTP association
pub(super) const SCTP_PORT: u16 = 5000;

impl State {
    pub(super) fn add_data_channel(&mut self, channel: DataChannel) {
        log::debug!("adding data channel {:?}", channel.label());

        self.ensure_sctp_media_line();
        self.data_channels.insert(channel.handle(), channel);
        self.open_data_channels();
    }

    /// Create the SCTP media line with the first data channel
    pub(super) fn ensure_sctp_media_line(&mut self) {
        if !self.sctp_media_lines.is_empty() {
            return;
        }

        let transport_id = self.transport_for_new_line(None);
        let id = self.new_media_line_id();
        let line_index = self.next_line_index();

        log::debug!("creating sctp media line {id} on {transport_id}");

        self.sctp_media_lines.insert(
            id.clone(),
            SctpMediaLineInfo {
                id,
                line_index,
                transport_id,
                negotiation: NegotiationState::PendingOffer,
                port: SCTP_PORT,
                remote: None,
            },
        );
    }

    /// Create and start the SCTP transports of all agreed SCTP media lines
    pub(super) fn start_sctp_transports(&mut self) {
        let lines: Vec<_> = self
            .sctp_media_lines
            .values()
            .filter(|l| l.negotiation == NegotiationState::Agreed)
            .filter_map(|l| Some((l.transport_id.clone(), l.remote.clone()?)))
            .collect();

        for (transport_id, remote) in lines {
            let sink = self.sink();

            let Some(transport) = self.transports.get_mut(&transport_id) else {
                continue;
            };

            let sctp = transport.sctp.get_or_insert_with(|| SctpInfo {
                transport: self.factory.create_sctp_transport(&transport_id, sink),
                state: SctpTransportState::New,
                started: false,
            });

            if sctp.started {
                continue;
            }

            sctp.started = true;

            if let Err(e) = sctp.transport.start(&remote.capabilities, remote.port) {
                log::warn!("failed to start sctp transport on {transport_id}, {e}");
                self.notify(PeerConnectionEvent::TransportError {
                    transport_id,
                    error: e,
                });
            }
        }
    }

    /// The SCTP transport of the agreed SCTP media line, if it is connected
    fn connected_sctp_transport(&self) -> Option<&TransportId> {
        let line = self
            .sctp_media_lines
            .values()
            .find(|l| l.negotiation == NegotiationState::Agreed)?;

        let sctp = self.transports.get(&line.transport_id)?.sctp.as_ref()?;

        (sctp.state == SctpTransportState::Connected).then_some(&line.transport_id)
    }

    /// Bind all connecting channels to SCTP streams and open them
    pub(super) fn open_data_channels(&mut self) {
        let Some(transport_id) = self.connected_sctp_transport() else {
            return;
        };

        let Some(data_transport) = self
            .transports
            .get(transport_id)
            .and_then(|t| t.sctp.as_ref())
            .map(|sctp| sctp.transport.data_transport())
        else {
            return;
        };

        // The DTLS client (the answering side) uses even stream ids, the server odd ones
        let first = if self.is_offerer == Some(false) { 0 } else { 1 };

        let channels: Vec<_> = self.data_channels.values().cloned().collect();

        let mut used: BTreeSet<u16> = channels
            .iter()
            .filter_map(|c| c.parameters().id.or_else(|| c.id()))
            .collect();

        for channel in channels {
            if channel.is_bound() {
                continue;
            }

            let stream_id = match channel.parameters().id {
                Some(id) => id,
                None => {
                    let Some(id) = (first..u16::MAX)
                        .step_by(2)
                        .find(|id| !used.contains(id))
                    else {
                        log::warn!("no free sctp stream id for {:?}", channel.label());
                        continue;
                    };

                    used.insert(id);
                    id
                }
            };

            if !channel.bind(stream_id, data_transport.clone()) {
                continue;
            }

            if !channel.parameters().negotiated
                && let Err(e) = data_transport.open_stream(stream_id, channel.parameters())
            {
                log::warn!("failed to open data channel stream {stream_id}, {e}");

                self.notify_channel(&channel, DataChannelEvent::Error(e.into()));
                if let Some(event) = channel.set_closed() {
                    self.notify_channel(&channel, event);
                }
                self.data_channels.remove(&channel.handle());
                continue;
            }

            log::debug!("opened data channel {:?} on stream {stream_id}", channel.label());

            for event in channel.open() {
                self.notify_channel(&channel, event);
            }

            if channel.ready_state() == DataChannelState::Closed {
                self.data_channels.remove(&channel.handle());
            }
        }
    }

    /// Announce a close started by the user and reset the channel's stream
    pub(super) fn close_data_channel(
        &mut self,
        channel: DataChannel,
        new_state: DataChannelState,
    ) {
        let handle = channel.handle();

        if new_state == DataChannelState::Closed {
            self.data_channels.remove(&handle);
            self.notify_channel(&channel, DataChannelEvent::StateChanged(new_state));
            return;
        }

        // closed by the transport or shutdown in the meantime, which announced it
        if channel.ready_state() != DataChannelState::Closing {
            return;
        }

        self.notify_channel(&channel, DataChannelEvent::StateChanged(new_state));

        // closing completes once the transport reports the stream as closed
        if !self.is_closing() && channel.reset_stream() {
            return;
        }

        self.data_channels.remove(&handle);

        if let Some(event) = channel.set_closed() {
            self.notify_channel(&channel, event);
        }
    }

    /// Close all data channels, e.g. because the SCTP association is gone
    pub(super) fn close_all_data_channels(&mut self) {
        for channel in std::mem::take(&mut self.data_channels).into_values() {
            if let Some(event) = channel.set_closed() {
                self.notify_channel(&channel, event);
            }
        }
    }

    fn data_channel_by_stream(&self, stream_id: u16) -> Option<DataChannel> {
        self.data_channels
            .values()
            .find(|c| c.is_bound() && c.id() == Some(stream_id))
            .cloned()
    }

    pub(super) fn handle_sctp_event(&mut self, transport_id: TransportId, event: SctpEvent) {
        match event {
            SctpEvent::StateChange(state) => {
                let Some(sctp) = self
                    .transports
                    .get_mut(&transport_id)
                    .and_then(|t| t.sctp.as_mut())
                else {
                    return;
                };

                log::debug!("{transport_id} sctp state {state:?}");
                sctp.state = state;

                match state {
                    SctpTransportState::Connected => self.open_data_channels(),
                    SctpTransportState::Closed => self.close_all_data_channels(),
                    SctpTransportState::New | SctpTransportState::Connecting => {}
                }
            }
            SctpEvent::DataChannel {
                stream_id,
                mut parameters,
            } => {
                if self.is_closing() {
                    return;
                }

                let Some(inner) = self.this.upgrade() else {
                    return;
                };

                let Some(data_transport) = self
                    .transports
                    .get(&transport_id)
                    .and_then(|t| t.sctp.as_ref())
                    .map(|sctp| sctp.transport.data_transport())
                else {
                    return;
                };

                parameters.id = Some(stream_id);

                let channel = DataChannel::new(
                    inner.next_id(),
                    parameters,
                    inner.buffer_data_channels.load(Ordering::Acquire),
                    self.this.clone(),
                );

                log::debug!(
                    "peer opened data channel {:?} on stream {stream_id}",
                    channel.label()
                );

                channel.bind(stream_id, data_transport);
                self.data_channels.insert(channel.handle(), channel.clone());
                self.notify(PeerConnectionEvent::DataChannel(channel.clone()));

                for event in channel.open() {
                    self.notify_channel(&channel, event);
                }
            }
            SctpEvent::Message { stream_id, message } => {
                match self.data_channel_by_stream(stream_id) {
                    Some(channel) => {
                        self.notify_channel(&channel, DataChannelEvent::Message(message))
                    }
                    None => log::debug!("message for unknown sctp stream {stream_id}"),
                }
            }
            SctpEvent::Flushed { stream_id, bytes } => {
                if let Some(channel) = self.data_channel_by_stream(stream_id) {
                    channel.flushed(bytes);
                }
            }
            SctpEvent::StreamClosed { stream_id } => {
                let Some(channel) = self.data_channel_by_stream(stream_id) else {
                    return;
                };

                self.data_channels.remove(&channel.handle());

                if let Some(event) = channel.set_closed() {
                    self.notify_channel(&channel, event);
                }
            }
        }
    }
}
