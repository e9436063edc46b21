use crate::{Error, engine::Inner, transport::DataTransport};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

const BINARY_TYPES: [&str; 2] = ["blob", "arraybuffer"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelParameters {
    pub label: String,
    pub ordered: bool,
    /// Milliseconds a message may be retransmitted for
    pub max_packet_lifetime: Option<u32>,
    pub max_retransmits: Option<u32>,
    pub protocol: String,
    /// Negotiated out of band, no in-band open handshake. Requires `id`.
    pub negotiated: bool,
    pub id: Option<u16>,
}

impl Default for DataChannelParameters {
    fn default() -> Self {
        Self {
            label: String::new(),
            ordered: true,
            max_packet_lifetime: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            id: None,
        }
    }
}

impl DataChannelParameters {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_packet_lifetime.is_some() && self.max_retransmits.is_some() {
            return Err(Error::InvalidParameters(
                "max_packet_lifetime and max_retransmits are mutually exclusive".into(),
            ));
        }

        if self.negotiated && self.id.is_none() {
            return Err(Error::InvalidParameters(
                "negotiated data channels require an id".into(),
            ));
        }

        if self.id == Some(u16::MAX) {
            return Err(Error::InvalidParameters(
                "data channel id 65535 is reserved".into(),
            ));
        }

        if self.label.len() > usize::from(u16::MAX) || self.protocol.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidParameters(
                "label and protocol must not exceed 65535 bytes".into(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    Text(String),
    Binary(Bytes),
}

impl DataMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    StateChanged(DataChannelState),
    Message(DataMessage),
    Error(Error),
}

pub trait DataChannelDelegate: Send + Sync {
    fn on_event(&self, channel: &DataChannel, event: &DataChannelEvent);
}

impl<F> DataChannelDelegate for F
where
    F: Fn(&DataChannel, &DataChannelEvent) + Send + Sync,
{
    fn on_event(&self, channel: &DataChannel, event: &DataChannelEvent) {
        self(channel, event)
    }
}

/// A bidirectional message channel over one SCTP stream.
///
/// Starts out [`Connecting`](DataChannelState::Connecting) and opens once the SCTP association is up.
/// Cloning returns another handle to the same channel.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    handle: u64,
    parameters: DataChannelParameters,
    state: Mutex<ChannelState>,
    next_observer_id: AtomicU64,
    observers: Mutex<Vec<(u64, Arc<dyn DataChannelDelegate>)>>,
    engine: Weak<Inner>,
}

struct ChannelState {
    ready_state: DataChannelState,
    stream_id: Option<u16>,
    buffered_amount: u64,
    binary_type: &'static str,
    buffer_while_connecting: bool,
    transport: Option<Arc<dyn DataTransport>>,
    queued: VecDeque<DataMessage>,
}

impl DataChannel {
    pub(crate) fn new(
        handle: u64,
        parameters: DataChannelParameters,
        buffer_while_connecting: bool,
        engine: Weak<Inner>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                handle,
                state: Mutex::new(ChannelState {
                    ready_state: DataChannelState::Connecting,
                    stream_id: parameters.id,
                    buffered_amount: 0,
                    binary_type: BINARY_TYPES[0],
                    buffer_while_connecting,
                    transport: None,
                    queued: VecDeque::new(),
                }),
                parameters,
                next_observer_id: AtomicU64::new(0),
                observers: Mutex::new(vec![]),
                engine,
            }),
        }
    }

    pub(crate) fn handle(&self) -> u64 {
        self.inner.handle
    }

    pub fn label(&self) -> &str {
        &self.inner.parameters.label
    }

    pub fn parameters(&self) -> &DataChannelParameters {
        &self.inner.parameters
    }

    /// SCTP stream id, `None` until assigned
    pub fn id(&self) -> Option<u16> {
        self.inner.state.lock().stream_id
    }

    pub fn ready_state(&self) -> DataChannelState {
        self.inner.state.lock().ready_state
    }

    /// Bytes handed to the channel which have not been flushed to the network yet
    pub fn buffered_amount(&self) -> u64 {
        self.inner.state.lock().buffered_amount
    }

    pub fn binary_type(&self) -> &'static str {
        self.inner.state.lock().binary_type
    }

    /// Set to either `blob` or `arraybuffer`. This has no effect on the transport.
    pub fn set_binary_type(&self, binary_type: &str) -> Result<(), Error> {
        let binary_type = BINARY_TYPES
            .iter()
            .find(|t| **t == binary_type)
            .ok_or_else(|| {
                Error::InvalidParameters(format!("unsupported binary type {binary_type:?}"))
            })?;

        self.inner.state.lock().binary_type = binary_type;
        Ok(())
    }

    pub fn subscribe(&self, delegate: impl DataChannelDelegate + 'static) -> u64 {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((id, Arc::new(delegate)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.observers.lock().retain(|(i, _)| *i != id);
    }

    /// Send a message.
    ///
    /// Fails with [`Error::InvalidState`] unless the channel is open, or connecting with buffering enabled
    /// in the [`Configuration`](crate::Configuration).
    pub fn send(&self, message: DataMessage) -> Result<(), Error> {
        let mut state = self.inner.state.lock();

        match state.ready_state {
            DataChannelState::Open => {
                let (Some(transport), Some(stream_id)) = (&state.transport, state.stream_id) else {
                    return Err(Error::InvalidState("data channel has no transport".into()));
                };

                transport.send(stream_id, &message)?;
                state.buffered_amount += message.len() as u64;
                Ok(())
            }
            DataChannelState::Connecting if state.buffer_while_connecting => {
                state.buffered_amount += message.len() as u64;
                state.queued.push_back(message);
                Ok(())
            }
            ready_state => Err(Error::InvalidState(format!(
                "cannot send on data channel in state {ready_state:?}"
            ))),
        }
    }

    /// Close the channel. Calling this more than once has no effect.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();

        if matches!(
            state.ready_state,
            DataChannelState::Closing | DataChannelState::Closed
        ) {
            return;
        }

        let engine = self.inner.engine.upgrade();

        let new_state = if state.transport.is_some() && engine.is_some() {
            DataChannelState::Closing
        } else {
            state.queued.clear();
            DataChannelState::Closed
        };

        state.ready_state = new_state;
        drop(state);

        // the engine announces the change in order with its other events
        match engine {
            Some(engine) => engine.close_data_channel(self.clone(), new_state),
            None => self.dispatch(&DataChannelEvent::StateChanged(new_state)),
        }
    }

    pub(crate) fn dispatch(&self, event: &DataChannelEvent) {
        let observers: Vec<_> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        for observer in observers {
            observer.on_event(self, event);
        }
    }

    /// Assign the SCTP stream and transport. Returns false if the channel is already closed.
    pub(crate) fn bind(&self, stream_id: u16, transport: Arc<dyn DataTransport>) -> bool {
        let mut state = self.inner.state.lock();

        if state.ready_state == DataChannelState::Closed {
            return false;
        }

        state.stream_id = Some(stream_id);
        state.transport = Some(transport);
        true
    }

    /// Transition to open and send everything queued while connecting.
    ///
    /// If a queued message cannot be sent the channel is closed and its stream reset.
    pub(crate) fn open(&self) -> Vec<DataChannelEvent> {
        let mut state = self.inner.state.lock();

        if state.ready_state != DataChannelState::Connecting {
            return vec![];
        }

        let (Some(transport), Some(stream_id)) = (state.transport.clone(), state.stream_id) else {
            return vec![];
        };

        state.ready_state = DataChannelState::Open;

        let mut events = vec![DataChannelEvent::StateChanged(DataChannelState::Open)];

        while let Some(message) = state.queued.pop_front() {
            if let Err(e) = transport.send(stream_id, &message) {
                log::warn!("failed to send queued data channel message, closing channel, {e}");

                state.ready_state = DataChannelState::Closed;
                state.queued.clear();
                state.transport = None;
                drop(state);

                transport.reset_stream(stream_id);

                events.push(DataChannelEvent::Error(e.into()));
                events.push(DataChannelEvent::StateChanged(DataChannelState::Closed));
                return events;
            }
        }

        events
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.inner.state.lock().transport.is_some()
    }

    /// Ask the transport to close the stream, returns false if the channel isn't bound to one
    pub(crate) fn reset_stream(&self) -> bool {
        let state = self.inner.state.lock();

        let (Some(transport), Some(stream_id)) = (state.transport.clone(), state.stream_id) else {
            return false;
        };

        drop(state);

        transport.reset_stream(stream_id);
        true
    }

    pub(crate) fn flushed(&self, bytes: u64) {
        let mut state = self.inner.state.lock();
        state.buffered_amount = state.buffered_amount.saturating_sub(bytes);
    }

    /// Returns the state change event if the channel wasn't closed already
    pub(crate) fn set_closed(&self) -> Option<DataChannelEvent> {
        let mut state = self.inner.state.lock();

        if state.ready_state == DataChannelState::Closed {
            return None;
        }

        state.ready_state = DataChannelState::Closed;
        state.queued.clear();
        state.transport = None;

        Some(DataChannelEvent::StateChanged(DataChannelState::Closed))
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.inner.parameters.label)
            .field("handle", &self.inner.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(u16, DataMessage)>>,
    }

    impl DataTransport for RecordingTransport {
        fn open_stream(&self, _: u16, _: &DataChannelParameters) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, stream_id: u16, message: &DataMessage) -> Result<(), TransportError> {
            self.sent.lock().push((stream_id, message.clone()));
            Ok(())
        }

        fn reset_stream(&self, _: u16) {}
    }

    /// Accepts a limited number of messages, fails every send after that
    struct LimitedTransport {
        accept: Mutex<usize>,
        reset: Mutex<Vec<u16>>,
    }

    impl DataTransport for LimitedTransport {
        fn open_stream(&self, _: u16, _: &DataChannelParameters) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, _: u16, _: &DataMessage) -> Result<(), TransportError> {
            let mut accept = self.accept.lock();

            if *accept == 0 {
                return Err(TransportError::new(1, "send buffer full"));
            }

            *accept -= 1;
            Ok(())
        }

        fn reset_stream(&self, stream_id: u16) {
            self.reset.lock().push(stream_id);
        }
    }

    fn channel(buffer: bool) -> DataChannel {
        DataChannel::new(0, DataChannelParameters::default(), buffer, Weak::new())
    }

    fn record_states(channel: &DataChannel) -> Arc<Mutex<Vec<DataChannelState>>> {
        let states = Arc::new(Mutex::new(vec![]));
        let states_ = states.clone();

        channel.subscribe(move |_: &DataChannel, event: &DataChannelEvent| {
            if let DataChannelEvent::StateChanged(state) = event {
                states_.lock().push(*state);
            }
        });

        states
    }

    #[test]
    fn parameters_validation() {
        let both = DataChannelParameters {
            max_packet_lifetime: Some(100),
            max_retransmits: Some(3),
            ..Default::default()
        };
        assert!(matches!(both.validate(), Err(Error::InvalidParameters(..))));

        let negotiated = DataChannelParameters {
            negotiated: true,
            ..Default::default()
        };
        assert!(negotiated.validate().is_err());

        let negotiated = DataChannelParameters {
            negotiated: true,
            id: Some(4),
            ..Default::default()
        };
        assert!(negotiated.validate().is_ok());
    }

    #[test]
    fn send_while_connecting_fails_without_buffering() {
        let channel = channel(false);

        let result = channel.send(DataMessage::Text("hello".into()));
        assert!(matches!(result, Err(Error::InvalidState(..))));
        assert_eq!(channel.buffered_amount(), 0);
    }

    #[test]
    fn send_while_connecting_is_queued_with_buffering() {
        let channel = channel(true);
        let transport = Arc::new(RecordingTransport::default());

        channel.send(DataMessage::Text("hello".into())).unwrap();
        channel
            .send(DataMessage::Binary(Bytes::from_static(b"world!")))
            .unwrap();
        assert_eq!(channel.buffered_amount(), 11);

        assert!(channel.bind(1, transport.clone()));
        let events = channel.open();
        assert!(matches!(
            events[..],
            [DataChannelEvent::StateChanged(DataChannelState::Open)]
        ));

        let sent = transport.sent.lock();
        assert_eq!(
            *sent,
            vec![
                (1, DataMessage::Text("hello".into())),
                (1, DataMessage::Binary(Bytes::from_static(b"world!")))
            ]
        );
        drop(sent);

        // only a flush confirmation reduces the buffered amount
        assert_eq!(channel.buffered_amount(), 11);
        channel.flushed(5);
        assert_eq!(channel.buffered_amount(), 6);
    }

    #[test]
    fn failed_queued_send_closes_channel() {
        let channel = channel(true);
        let transport = Arc::new(LimitedTransport {
            accept: Mutex::new(1),
            reset: Mutex::new(vec![]),
        });

        for text in ["one", "two", "three"] {
            channel.send(DataMessage::Text(text.into())).unwrap();
        }
        assert_eq!(channel.buffered_amount(), 11);

        assert!(channel.bind(3, transport.clone()));
        let events = channel.open();

        assert!(matches!(
            events[..],
            [
                DataChannelEvent::StateChanged(DataChannelState::Open),
                DataChannelEvent::Error(Error::Transport(..)),
                DataChannelEvent::StateChanged(DataChannelState::Closed),
            ]
        ));
        assert_eq!(channel.ready_state(), DataChannelState::Closed);
        assert_eq!(*transport.reset.lock(), [3]);
        assert!(!channel.is_bound());

        // nothing was flushed, the buffered amount stays
        assert_eq!(channel.buffered_amount(), 11);
        assert!(channel.set_closed().is_none());
        assert!(matches!(
            channel.send(DataMessage::Text("four".into())),
            Err(Error::InvalidState(..))
        ));
    }

    #[test]
    fn send_on_closed_fails() {
        for buffer in [false, true] {
            let channel = channel(buffer);
            channel.close();

            assert_eq!(channel.ready_state(), DataChannelState::Closed);
            assert!(matches!(
                channel.send(DataMessage::Text("x".into())),
                Err(Error::InvalidState(..))
            ));
        }
    }

    #[test]
    fn close_is_idempotent() {
        let channel = channel(false);
        let states = record_states(&channel);

        channel.close();
        channel.close();

        assert_eq!(*states.lock(), vec![DataChannelState::Closed]);
        assert!(channel.set_closed().is_none());
    }

    #[test]
    fn binary_type() {
        let channel = channel(false);
        assert_eq!(channel.binary_type(), "blob");

        channel.set_binary_type("arraybuffer").unwrap();
        assert_eq!(channel.binary_type(), "arraybuffer");

        assert!(channel.set_binary_type("string").is_err());
        assert_eq!(channel.binary_type(), "arraybuffer");
    }
}
