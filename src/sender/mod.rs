use crate::codec::{self, FrameError};
use crate::model::{EffectStatus, Notice, Request, RequestId, Response, Visibility};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

pub type Outbox = mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no live controller connection")]
    NotConnected,
    #[error("controller connection closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Thread-safe handle for writing frames to the controller.
///
/// Frames are encoded on the caller's thread and pushed into an outbox that a
/// single writer task drains onto the socket, so concurrent callers never
/// interleave bytes. Clones share the same outbox slot.
#[derive(Debug, Clone, Default)]
pub struct ResponseSender {
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl ResponseSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh outbox for a new connection and hand back its receiving end.
    pub fn attach(&self) -> Outbox {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.lock() = Some(tx);
        rx
    }

    pub fn detach(&self) {
        self.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn send(&self, response: &Response) -> Result<(), SendError> {
        self.send_frame(codec::encode(response)?)
    }

    pub fn notify(&self, notice: &Notice) -> Result<(), SendError> {
        self.send_frame(codec::encode(notice)?)
    }

    pub fn respond(
        &self,
        request: &Request,
        status: EffectStatus,
        message: impl Into<String>,
    ) -> Result<(), SendError> {
        self.send(&Response::new(request.id.clone(), status).with_message(message))
    }

    pub fn respond_timed(
        &self,
        request_id: &RequestId,
        status: EffectStatus,
        remaining: Duration,
        message: impl Into<String>,
    ) -> Result<(), SendError> {
        self.send(
            &Response::new(request_id.clone(), status)
                .with_remaining(remaining)
                .with_message(message),
        )
    }

    pub fn keep_alive(&self) -> Result<(), SendError> {
        self.send(&Response::keep_alive())
    }

    pub fn show_effect(&self, code: &str) -> Result<(), SendError> {
        self.effect_update(code, Visibility::Visible)
    }

    pub fn hide_effect(&self, code: &str) -> Result<(), SendError> {
        self.effect_update(code, Visibility::NotVisible)
    }

    pub fn enable_effect(&self, code: &str) -> Result<(), SendError> {
        self.effect_update(code, Visibility::Selectable)
    }

    pub fn disable_effect(&self, code: &str) -> Result<(), SendError> {
        self.effect_update(code, Visibility::NotSelectable)
    }

    fn effect_update(&self, code: &str, status: Visibility) -> Result<(), SendError> {
        self.notify(&Notice::EffectUpdate {
            code: code.to_string(),
            status,
        })
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SendError> {
        let mut slot = self.lock();
        let Some(tx) = slot.as_ref() else {
            return Err(SendError::NotConnected);
        };
        if tx.send(frame).is_err() {
            // Writer is gone; the connection manager will notice on its side.
            *slot = None;
            return Err(SendError::Closed);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<u8>>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
