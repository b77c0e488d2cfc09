//! Single-consumer command execution.
//!
//! `Dispatcher::poll` runs on the host's safe-mutation thread, takes at most
//! one queued request per call and runs its handler to completion before the
//! next one is looked at, so responses leave in arrival order.

use crate::model::{EffectStatus, Request, RequestId, Response};
use crate::queue::RequestQueue;
use crate::registry::HandlerRegistry;
use crate::scheduler::{ScheduleError, TimedEffect, TimedEffectScheduler};
use crate::sender::ResponseSender;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Flags raised by the host that gate dispatching and inform handlers.
#[derive(Debug, Clone)]
pub struct HostSignals {
    saving: Arc<AtomicBool>,
    time_frozen: Arc<AtomicBool>,
    can_spawn: Arc<AtomicBool>,
}

impl Default for HostSignals {
    fn default() -> Self {
        Self {
            saving: Arc::new(AtomicBool::new(false)),
            time_frozen: Arc::new(AtomicBool::new(false)),
            can_spawn: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl HostSignals {
    pub fn set_saving(&self, saving: bool) {
        self.saving.store(saving, Ordering::SeqCst);
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_time_frozen(&self, frozen: bool) -> bool {
        self.time_frozen.swap(frozen, Ordering::SeqCst)
    }

    pub fn is_time_frozen(&self) -> bool {
        self.time_frozen.load(Ordering::SeqCst)
    }

    pub fn set_can_spawn(&self, can_spawn: bool) {
        self.can_spawn.store(can_spawn, Ordering::SeqCst);
    }

    pub fn can_spawn(&self) -> bool {
        self.can_spawn.load(Ordering::SeqCst)
    }

    /// Whether shared application state may be mutated right now.
    pub fn is_safe(&self) -> bool {
        !self.is_saving() && !self.is_time_frozen()
    }
}

/// Host-side identifier of an entity a handler spawned.
pub type SpawnId = u64;

/// Entities spawned by handlers that must be removed before the host saves.
#[derive(Debug, Clone, Default)]
pub struct SpawnTracker {
    inner: Arc<Mutex<Vec<SpawnId>>>,
}

impl SpawnTracker {
    pub fn track(&self, id: SpawnId) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    /// Take every tracked id, oldest first.
    pub fn drain(&self) -> Vec<SpawnId> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a handler sees while it runs.
pub struct EffectContext<'a, S> {
    state: &'a mut S,
    sender: &'a ResponseSender,
    scheduler: &'a TimedEffectScheduler<S>,
    signals: &'a HostSignals,
    spawns: &'a SpawnTracker,
    responses: usize,
    scheduled: bool,
}

impl<'a, S: 'static> EffectContext<'a, S> {
    pub fn new(
        state: &'a mut S,
        sender: &'a ResponseSender,
        scheduler: &'a TimedEffectScheduler<S>,
        signals: &'a HostSignals,
        spawns: &'a SpawnTracker,
    ) -> Self {
        Self {
            state,
            sender,
            scheduler,
            signals,
            spawns,
            responses: 0,
            scheduled: false,
        }
    }

    /// Application state; only ever touched from the dispatch thread.
    pub fn state(&mut self) -> &mut S {
        &mut *self.state
    }

    pub fn respond(&mut self, request: &Request, status: EffectStatus, message: impl Into<String>) {
        self.responses += 1;
        if let Err(err) = self.sender.respond(request, status, message) {
            tracing::debug!(request_id = %request.id, ?status, error = %err, "response not sent");
        }
    }

    pub fn respond_timed(
        &mut self,
        request: &Request,
        status: EffectStatus,
        remaining: Duration,
        message: impl Into<String>,
    ) {
        self.responses += 1;
        if let Err(err) = self
            .sender
            .respond_timed(&request.id, status, remaining, message)
        {
            tracing::debug!(request_id = %request.id, ?status, error = %err, "response not sent");
        }
    }

    /// Hand a durational effect to the scheduler, which answers the request.
    pub fn schedule<E>(
        &mut self,
        request: &Request,
        effect: E,
        duration: Duration,
    ) -> Result<Duration, ScheduleError>
    where
        E: TimedEffect<S> + 'static,
    {
        self.scheduled = true;
        self.scheduler
            .enqueue(&mut *self.state, request.clone(), effect, duration)
    }

    pub fn is_running(&self, kind: &str) -> bool {
        self.scheduler.is_running(kind)
    }

    pub fn scheduler(&self) -> &TimedEffectScheduler<S> {
        self.scheduler
    }

    /// For effect visibility notices.
    pub fn sender(&self) -> &ResponseSender {
        self.sender
    }

    pub fn can_spawn(&self) -> bool {
        self.signals.can_spawn()
    }

    /// Remember a spawned entity so the host can remove it before saving.
    pub fn track_spawn(&self, id: SpawnId) {
        self.spawns.track(id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Host is saving or frozen; nothing was dequeued.
    Suspended,
    Idle,
    Dispatched(RequestId),
}

pub struct Dispatcher<S> {
    registry: Arc<HandlerRegistry<S>>,
    queue: RequestQueue,
    sender: ResponseSender,
    scheduler: Arc<TimedEffectScheduler<S>>,
    signals: HostSignals,
    spawns: SpawnTracker,
}

impl<S: 'static> Dispatcher<S> {
    pub fn new(
        registry: Arc<HandlerRegistry<S>>,
        queue: RequestQueue,
        sender: ResponseSender,
        scheduler: Arc<TimedEffectScheduler<S>>,
        signals: HostSignals,
    ) -> Self {
        Self {
            registry,
            queue,
            sender,
            scheduler,
            signals,
            spawns: SpawnTracker::default(),
        }
    }

    /// Run at most one queued request.
    pub fn poll(&self, state: &mut S) -> DispatchOutcome {
        if !self.signals.is_safe() {
            return DispatchOutcome::Suspended;
        }
        let Some(request) = self.queue.pop() else {
            return DispatchOutcome::Idle;
        };
        let id = request.id.clone();
        self.dispatch(state, request);
        DispatchOutcome::Dispatched(id)
    }

    /// Look up and run the handler for `request`. Never panics on handler failure.
    pub fn dispatch(&self, state: &mut S, request: Request) {
        let Some(handler) = self.registry.get(&request.code) else {
            tracing::warn!(request_id = %request.id, code = %request.code, "no handler for effect code");
            self.reply(
                Response::new(request.id.clone(), EffectStatus::Failure).with_message(format!(
                    "Could not find the effect delegate for ID \"{}\".",
                    request.code
                )),
            );
            return;
        };

        let mut ctx = EffectContext::new(
            state,
            &self.sender,
            &self.scheduler,
            &self.signals,
            &self.spawns,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut ctx, &request)));
        let (responses, scheduled) = (ctx.responses, ctx.scheduled);

        let failure = match outcome {
            Ok(Ok(())) => {
                if responses == 0 && !scheduled {
                    tracing::warn!(request_id = %request.id, code = %request.code, "handler returned without responding");
                } else if responses > 1 {
                    tracing::warn!(request_id = %request.id, code = %request.code, responses, "handler responded more than once");
                }
                return;
            }
            Ok(Err(err)) if scheduled && err.downcast_ref::<ScheduleError>().is_some() => {
                tracing::debug!(request_id = %request.id, error = %err, "timed effect not scheduled");
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        if responses > 0 {
            tracing::warn!(
                request_id = %request.id,
                code = %request.code,
                error = %failure,
                "effect handler failed after responding"
            );
            return;
        }
        tracing::warn!(
            request_id = %request.id,
            code = %request.code,
            error = %failure,
            "effect handler failed; asking controller to retry"
        );
        self.reply(Response::new(request.id, EffectStatus::Retry).with_message(failure));
    }

    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn spawns(&self) -> &SpawnTracker {
        &self.spawns
    }

    fn reply(&self, response: Response) {
        if let Err(err) = self.sender.send(&response) {
            tracing::debug!(status = ?response.status, error = %err, "response not sent");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
