use bytes::Bytes;
use common::{drive, make_peer, negotiate, record_events};
use ezk_peer_connection::{
    Configuration, DataChannel, DataChannelEvent, DataChannelParameters, DataChannelState,
    DataMessage, Error, NegotiationState, PeerConnection, PeerConnectionEvent,
    transport::{SctpEvent, SctpTransportState, TransportEvent},
};
use parking_lot::Mutex;
use std::sync::Arc;

mod common;

fn chat() -> DataChannelParameters {
    DataChannelParameters {
        label: "chat".into(),
        ..Default::default()
    }
}

fn record_channel(channel: &DataChannel) -> Arc<Mutex<Vec<DataChannelEvent>>> {
    let events = Arc::new(Mutex::new(vec![]));

    let recorder = events.clone();
    channel.subscribe(move |_: &DataChannel, event: &DataChannelEvent| {
        recorder.lock().push(event.clone());
    });

    events
}

fn states(events: &[DataChannelEvent]) -> Vec<DataChannelState> {
    events
        .iter()
        .filter_map(|e| match e {
            DataChannelEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn sctp_event(peer: &PeerConnection, mock: &common::Mock, event: SctpEvent) {
    let transport_id = peer.sctp_media_lines()[0].transport_id.clone();

    mock.sctp_sink(transport_id.as_str())
        .push(TransportEvent::Sctp {
            transport_id,
            event,
        });

    drive(peer);
}

#[test]
fn data_channel_opens_after_negotiation() {
    let (a, mock_a) = make_peer(Configuration::default());
    let (b, mock_b) = make_peer(Configuration::default());

    let channel = a.create_data_channel(chat()).unwrap();
    let events = record_channel(&channel);

    drive(&a);
    assert!(a.negotiation_needed());
    assert_eq!(a.sctp_media_lines().len(), 1);
    assert_eq!(channel.ready_state(), DataChannelState::Connecting);

    let (offer, answer) = negotiate(&a, &b);

    assert_eq!(offer.description.sctp_media_lines.len(), 1);
    assert_eq!(answer.description.sctp_media_lines.len(), 1);
    assert!(offer.description.rtp_media_lines.is_empty());

    for peer in [&a, &b] {
        let lines = peer.sctp_media_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].negotiation, NegotiationState::Agreed);
    }

    let transport_id = a.sctp_media_lines()[0].transport_id.clone();
    assert_eq!(
        mock_a.sctp_starts.lock().as_slice(),
        [(transport_id.clone(), Some(5000))]
    );
    assert_eq!(mock_b.sctp_starts.lock().len(), 1);

    // the association isn't up yet
    assert_eq!(channel.ready_state(), DataChannelState::Connecting);
    assert!(channel.id().is_none());

    sctp_event(&a, &mock_a, SctpEvent::StateChange(SctpTransportState::Connected));

    assert_eq!(channel.ready_state(), DataChannelState::Open);
    // the offering side uses odd stream ids
    assert_eq!(channel.id(), Some(1));
    assert_eq!(
        mock_a.data_transport(transport_id.as_str()).opened.lock().as_slice(),
        [(1, "chat".to_string())]
    );
    assert_eq!(states(&events.lock()), [DataChannelState::Open]);
}

#[test]
fn send_and_close() {
    let (a, mock_a) = make_peer(Configuration::default());
    let (b, _) = make_peer(Configuration::default());

    let channel = a.create_data_channel(chat()).unwrap();
    let events = record_channel(&channel);

    negotiate(&a, &b);
    sctp_event(&a, &mock_a, SctpEvent::StateChange(SctpTransportState::Connected));

    let transport_id = a.sctp_media_lines()[0].transport_id.to_string();
    let data = mock_a.data_transport(&transport_id);

    channel.send(DataMessage::Text("hello".into())).unwrap();
    channel
        .send(DataMessage::Binary(Bytes::from_static(&[1, 2, 3])))
        .unwrap();

    assert_eq!(channel.buffered_amount(), 8);
    assert_eq!(data.sent.lock().len(), 2);
    assert_eq!(data.sent.lock()[0], (1, DataMessage::Text("hello".into())));

    sctp_event(&a, &mock_a, SctpEvent::Flushed { stream_id: 1, bytes: 5 });
    assert_eq!(channel.buffered_amount(), 3);

    channel.close();
    assert_eq!(channel.ready_state(), DataChannelState::Closing);
    // announced by the next step, not on the closing thread
    assert_eq!(states(&events.lock()), [DataChannelState::Open]);
    assert!(data.reset.lock().is_empty());
    drive(&a);
    assert_eq!(data.reset.lock().as_slice(), [1]);

    sctp_event(&a, &mock_a, SctpEvent::StreamClosed { stream_id: 1 });
    assert_eq!(channel.ready_state(), DataChannelState::Closed);

    // closing again has no effect
    channel.close();
    drive(&a);

    assert_eq!(
        states(&events.lock()),
        [
            DataChannelState::Open,
            DataChannelState::Closing,
            DataChannelState::Closed
        ]
    );
    assert!(a.data_channels().is_empty());
    assert!(matches!(
        channel.send(DataMessage::Text("late".into())),
        Err(Error::InvalidState(..))
    ));
}

#[test]
fn closing_unbound_channel_is_announced_by_step() {
    let (a, _) = make_peer(Configuration::default());

    let channel = a.create_data_channel(chat()).unwrap();
    let events = record_channel(&channel);
    drive(&a);
    assert_eq!(a.data_channels().len(), 1);

    channel.close();
    assert_eq!(channel.ready_state(), DataChannelState::Closed);
    assert!(events.lock().is_empty());

    drive(&a);
    assert_eq!(states(&events.lock()), [DataChannelState::Closed]);
    assert!(a.data_channels().is_empty());
}

#[test]
fn sending_while_connecting_is_refused_by_default() {
    let (a, _) = make_peer(Configuration::default());

    let channel = a.create_data_channel(chat()).unwrap();

    assert!(matches!(
        channel.send(DataMessage::Text("early".into())),
        Err(Error::InvalidState(..))
    ));
}

#[test]
fn messages_sent_while_connecting_are_queued() {
    let (a, mock_a) = make_peer(Configuration {
        buffer_data_channel_while_connecting: true,
        ..Default::default()
    });
    let (b, _) = make_peer(Configuration::default());

    let channel = a.create_data_channel(chat()).unwrap();

    channel.send(DataMessage::Text("first".into())).unwrap();
    channel.send(DataMessage::Text("second".into())).unwrap();
    assert_eq!(channel.buffered_amount(), 11);

    negotiate(&a, &b);
    sctp_event(&a, &mock_a, SctpEvent::StateChange(SctpTransportState::Connected));

    let transport_id = a.sctp_media_lines()[0].transport_id.to_string();
    let sent: Vec<_> = mock_a
        .data_transport(&transport_id)
        .sent
        .lock()
        .iter()
        .map(|(_, message)| message.clone())
        .collect();

    assert_eq!(
        sent,
        [
            DataMessage::Text("first".into()),
            DataMessage::Text("second".into())
        ]
    );
}

#[test]
fn peer_opened_data_channel() {
    let (a, _) = make_peer(Configuration::default());
    let (b, mock_b) = make_peer(Configuration::default());
    let events = record_events(&b);

    a.create_data_channel(chat()).unwrap();
    negotiate(&a, &b);

    sctp_event(&b, &mock_b, SctpEvent::StateChange(SctpTransportState::Connected));
    sctp_event(
        &b,
        &mock_b,
        SctpEvent::DataChannel {
            stream_id: 1,
            parameters: chat(),
        },
    );

    let channel = events
        .lock()
        .iter()
        .find_map(|e| match e {
            PeerConnectionEvent::DataChannel(channel) => Some(channel.clone()),
            _ => None,
        })
        .expect("peer opened channel must be announced");

    assert_eq!(channel.label(), "chat");
    assert_eq!(channel.id(), Some(1));
    assert_eq!(channel.ready_state(), DataChannelState::Open);
    assert_eq!(b.data_channels().len(), 1);

    let messages = record_channel(&channel);
    sctp_event(
        &b,
        &mock_b,
        SctpEvent::Message {
            stream_id: 1,
            message: DataMessage::Text("hi".into()),
        },
    );

    assert!(matches!(
        messages.lock().as_slice(),
        [DataChannelEvent::Message(DataMessage::Text(text))] if text == "hi"
    ));
}

#[test]
fn negotiated_channel_skips_open_handshake() {
    let (a, mock_a) = make_peer(Configuration::default());
    let (b, _) = make_peer(Configuration::default());

    let channel = a
        .create_data_channel(DataChannelParameters {
            label: "control".into(),
            negotiated: true,
            id: Some(4),
            ..Default::default()
        })
        .unwrap();

    negotiate(&a, &b);
    sctp_event(&a, &mock_a, SctpEvent::StateChange(SctpTransportState::Connected));

    let transport_id = a.sctp_media_lines()[0].transport_id.to_string();

    assert_eq!(channel.ready_state(), DataChannelState::Open);
    assert_eq!(channel.id(), Some(4));
    assert!(mock_a.data_transport(&transport_id).opened.lock().is_empty());
}

#[test]
fn sctp_association_loss_closes_channels() {
    let (a, mock_a) = make_peer(Configuration::default());
    let (b, _) = make_peer(Configuration::default());

    let first = a.create_data_channel(chat()).unwrap();
    let second = a
        .create_data_channel(DataChannelParameters {
            label: "files".into(),
            ..Default::default()
        })
        .unwrap();

    negotiate(&a, &b);
    sctp_event(&a, &mock_a, SctpEvent::StateChange(SctpTransportState::Connected));

    // both channels got their own odd stream id
    let mut ids = vec![first.id().unwrap(), second.id().unwrap()];
    ids.sort();
    assert_eq!(ids, [1, 3]);

    sctp_event(&a, &mock_a, SctpEvent::StateChange(SctpTransportState::Closed));

    assert_eq!(first.ready_state(), DataChannelState::Closed);
    assert_eq!(second.ready_state(), DataChannelState::Closed);
    assert!(a.data_channels().is_empty());
}
