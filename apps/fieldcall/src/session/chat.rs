use std::collections::VecDeque;
use std::sync::Arc;

use fieldcall_proto::{ChatMessage, Role};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::peer::{DataChannelEvent, DataChannelPrimitive, PeerError};

pub type ChatHandler = Box<dyn FnMut(ChatMessage) + Send + 'static>;

/// Text chat over the session's data channel.
///
/// Inbound messages go to one registered handler in arrival order; messages
/// that arrive before a handler exists are held and replayed to it. The
/// handler runs without the chat lock held, so it may call back into the
/// chat.
pub struct ChatChannel {
    inner: Arc<Mutex<ChatState>>,
}

struct ChatState {
    role: Role,
    channel: Option<Arc<dyn DataChannelPrimitive>>,
    handler: Option<ChatHandler>,
    pending: VecDeque<ChatMessage>,
    /// Set while a handler is running outside the lock.
    dispatching: bool,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl ChatChannel {
    pub fn new(role: Role) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChatState {
                role,
                channel: None,
                handler: None,
                pending: VecDeque::new(),
                dispatching: false,
                pump: None,
                closed: false,
            })),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    /// Binds the data channel for the current session. A channel that shows
    /// up after `close` belongs to a torn-down session and is closed
    /// instead.
    pub async fn attach(&self, channel: Arc<dyn DataChannelPrimitive>) {
        let mut events = channel.subscribe();
        let rejected = {
            let mut state = self.inner.lock();
            if state.closed {
                true
            } else {
                if let Some(previous) = state.pump.take() {
                    previous.abort();
                }
                state.channel = Some(Arc::clone(&channel));
                let inner = Arc::clone(&self.inner);
                let label = channel.label().to_string();
                state.pump = Some(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        match event {
                            DataChannelEvent::Open => {
                                tracing::debug!(target: "fieldcall::chat", label = %label, "chat channel open");
                            }
                            DataChannelEvent::Message(text) => match ChatMessage::decode(&text) {
                                Ok(message) => dispatch(&inner, Some(message)),
                                Err(err) => tracing::warn!(
                                    target: "fieldcall::chat",
                                    error = %err,
                                    "dropping malformed chat message"
                                ),
                            },
                            DataChannelEvent::Closed => {
                                tracing::debug!(target: "fieldcall::chat", label = %label, "chat channel closed");
                                break;
                            }
                        }
                    }
                }));
                false
            }
        };
        if rejected {
            tracing::debug!(
                target: "fieldcall::chat",
                label = channel.label(),
                "discarding data channel for a closed chat"
            );
            let _ = channel.close().await;
        }
    }

    /// Registers the inbound handler, replacing any earlier one.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(ChatMessage) + Send + 'static,
    {
        self.inner.lock().handler = Some(Box::new(handler));
        dispatch(&self.inner, None);
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .channel
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Sends `text` stamped with this side's role. `false` means the message
    /// was not handed to an open channel and the caller should say so.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        let message = ChatMessage::new(text, self.role());
        match self.try_send(&message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(target: "fieldcall::chat", error = %err, "chat message not sent");
                false
            }
        }
    }

    pub async fn try_send(&self, message: &ChatMessage) -> Result<(), SessionError> {
        let channel = self
            .inner
            .lock()
            .channel
            .clone()
            .ok_or_else(|| SessionError::Channel("no data channel".into()))?;
        if !channel.is_open() {
            return Err(SessionError::Channel(format!(
                "data channel {} is not open",
                channel.label()
            )));
        }
        let encoded = message.encode()?;
        channel
            .send_text(&encoded)
            .await
            .map_err(|err| SessionError::Channel(err.to_string()))
    }

    /// Closes the bound channel and refuses late attachments until
    /// [`ChatChannel::reopen`].
    pub async fn close(&self) -> Result<(), PeerError> {
        let channel = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.pending.clear();
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            state.channel.take()
        };
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Accepts a new channel again, sending as `role`; the registered
    /// handler is kept.
    pub fn reopen(&self, role: Role) {
        let mut state = self.inner.lock();
        state.closed = false;
        state.role = role;
    }
}

/// Queues `incoming` and drains the queue through the handler. Only one
/// caller drains at a time; the others just enqueue, which keeps delivery in
/// arrival order. A handler registered mid-drain takes over from the next
/// message.
fn dispatch(inner: &Mutex<ChatState>, incoming: Option<ChatMessage>) {
    let mut state = inner.lock();
    if let Some(message) = incoming {
        state.pending.push_back(message);
    }
    if state.dispatching {
        return;
    }
    let Some(mut handler) = state.handler.take() else {
        return;
    };
    state.dispatching = true;
    loop {
        if let Some(replacement) = state.handler.take() {
            handler = replacement;
        }
        let Some(message) = state.pending.pop_front() else {
            break;
        };
        drop(state);
        handler(message);
        state = inner.lock();
    }
    if state.handler.is_none() {
        state.handler = Some(handler);
    }
    state.dispatching = false;
}
