use common::{MockFactory, audio_track, drive, init_logger, make_peer, negotiate, record_events};
use ezk_peer_connection::{
    Configuration, DataChannelParameters, DataChannelState, Error, IceConnectionState,
    InternalState, PeerConnection, PeerConnectionEvent, PeerConnectionState, SignalingState,
    transport::{IceComponent, IceTransportState},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

mod common;

#[test]
fn close_fails_pending_operations() {
    let (a, _) = make_peer(Configuration::default());

    a.add_track(audio_track("mic"), vec![]).unwrap();
    let mut offer = a.create_offer(Default::default()).unwrap();

    a.close();
    drive(&a);

    assert_eq!(offer.try_result(), Some(Err(Error::Shutdown)));
    assert_eq!(a.internal_state(), InternalState::Shutdown);
    assert_eq!(a.signaling_state(), SignalingState::Closed);
    assert_eq!(a.connection_state(), PeerConnectionState::Closed);

    assert!(matches!(
        a.create_offer(Default::default()),
        Err(Error::InvalidState(..))
    ));
    assert!(matches!(
        a.add_track(audio_track("late"), vec![]),
        Err(Error::InvalidState(..))
    ));
}

#[test]
fn close_waits_for_ice_transports() {
    let (a, mock_a) = make_peer(Configuration::default());
    let (b, _) = make_peer(Configuration::default());
    let events = record_events(&a);

    a.add_track(audio_track("mic"), vec![]).unwrap();
    let channel = a
        .create_data_channel(DataChannelParameters {
            label: "chat".into(),
            ..Default::default()
        })
        .unwrap();

    negotiate(&a, &b);

    let transport_id = a.transports()[0].id.to_string();
    mock_a.push_ice_state(&transport_id, IceComponent::Rtp, IceTransportState::Connected);
    drive(&a);

    a.close();
    // the mock reports the ICE transport as closed asynchronously
    assert_eq!(a.internal_state(), InternalState::ShuttingDown);
    assert_eq!(channel.ready_state(), DataChannelState::Closed);
    assert!(mock_a.stopped_senders.lock().contains(&"mic".to_string()));

    drive(&a);

    assert_eq!(a.internal_state(), InternalState::Shutdown);
    assert!(a.transports().is_empty());
    assert!(a.senders().is_empty());
    assert_eq!(a.ice_connection_state(), IceConnectionState::Closed);

    // calling close again does nothing
    a.close();
    drive(&a);

    let events = events.lock();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(
                e,
                PeerConnectionEvent::ConnectionStateChanged(PeerConnectionState::Closed)
            ))
            .count(),
        1
    );
}

#[test]
fn unsubscribed_delegate_is_not_called() {
    let (a, _) = make_peer(Configuration::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_ = calls.clone();
    let subscription = a.subscribe(move |_: &PeerConnectionEvent| {
        calls_.fetch_add(1, Ordering::Relaxed);
    });

    subscription.cancel();

    a.add_track(audio_track("mic"), vec![]).unwrap();
    drive(&a);

    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn invalid_configuration_is_refused() {
    init_logger();

    let (factory, _) = MockFactory::new();
    let result = PeerConnection::new(
        Configuration {
            ice_servers: vec![ezk_peer_connection::IceServer {
                urls: vec!["turn:turn.example.org".into()],
                username: None,
                credential: None,
            }],
            ..Default::default()
        },
        factory,
    );

    assert!(matches!(result, Err(Error::InvalidParameters(..))));
}

#[tokio::test]
async fn spawned_driver_resolves_operations() {
    init_logger();

    let (factory_a, _) = MockFactory::new();
    let (factory_b, _) = MockFactory::new();

    let a = PeerConnection::spawn(Configuration::default(), factory_a).unwrap();
    let b = PeerConnection::spawn(Configuration::default(), factory_b).unwrap();

    a.add_track(audio_track("mic"), vec![]).unwrap();

    let offer = a.create_offer(Default::default()).unwrap().await.unwrap();
    a.set_local_description(offer.clone()).unwrap().await.unwrap();
    b.set_remote_description(offer).unwrap().await.unwrap();

    let answer = b.create_answer(Default::default()).unwrap().await.unwrap();
    b.set_local_description(answer.clone()).unwrap().await.unwrap();
    a.set_remote_description(answer).unwrap().await.unwrap();

    assert_eq!(a.signaling_state(), SignalingState::Stable);
    assert_eq!(b.signaling_state(), SignalingState::Stable);
    assert_eq!(b.receivers().len(), 1);

    let pending = b.create_offer(Default::default()).unwrap();
    b.close();

    assert_eq!(pending.await, Err(Error::Shutdown));
}
