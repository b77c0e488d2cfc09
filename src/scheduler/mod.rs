//! Durational effects driven by the host tick.
//!
//! Every live effect is an entry keyed by the request that created it. One
//! shared clock (`tick`) advances all unpaused entries; an entry whose
//! remaining time reaches zero is stopped, removed and reported `Finished`.
//! Remaining time never goes below zero and never moves while paused.

use crate::model::{EffectStatus, Request, RequestId};
use crate::sender::ResponseSender;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle hooks of a durational effect. `start` runs once before the first
/// `tick`, `stop` runs once after the last one.
pub trait TimedEffect<S>: Send {
    /// Effect type name, used for exclusivity and running queries.
    fn kind(&self) -> &str;

    /// Whether at most one effect of this kind may be live at a time.
    fn exclusive(&self) -> bool {
        false
    }

    fn start(&mut self, _state: &mut S) {}

    fn tick(&mut self, _state: &mut S) {}

    fn stop(&mut self, _state: &mut S) {}
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("The {kind} effect is already active.")]
    AlreadyActive { kind: String },
    #[error("request {0} already owns a timed effect")]
    DuplicateRequest(RequestId),
}

/// Read-only view of a live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub request_id: RequestId,
    pub kind: String,
    pub duration: Duration,
    pub remaining: Duration,
    pub paused: bool,
}

struct Entry<S> {
    request: Request,
    effect: Box<dyn TimedEffect<S>>,
    duration: Duration,
    remaining: Duration,
    paused: bool,
}

impl<S> Entry<S> {
    fn info(&self) -> EntryInfo {
        EntryInfo {
            request_id: self.request.id.clone(),
            kind: self.effect.kind().to_string(),
            duration: self.duration,
            remaining: self.remaining,
            paused: self.paused,
        }
    }
}

pub struct TimedEffectScheduler<S> {
    entries: Mutex<Vec<Entry<S>>>,
    sender: ResponseSender,
}

impl<S: 'static> TimedEffectScheduler<S> {
    pub fn new(sender: ResponseSender) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Start `effect` for `duration` on behalf of `request`.
    ///
    /// Responds `Success` with the duration on acceptance. A conflicting
    /// exclusive effect is answered with `Retry`, a reused request id with
    /// `Failure`; in both cases `start` is not called.
    pub fn enqueue<E>(
        &self,
        state: &mut S,
        request: Request,
        mut effect: E,
        duration: Duration,
    ) -> Result<Duration, ScheduleError>
    where
        E: TimedEffect<S> + 'static,
    {
        let kind = effect.kind().to_string();
        {
            let mut entries = self.lock();
            if entries.iter().any(|e| e.request.id == request.id) {
                drop(entries);
                self.reply(&request.id, EffectStatus::Failure, None, "Request already in progress.");
                return Err(ScheduleError::DuplicateRequest(request.id));
            }
            let conflict = entries
                .iter()
                .any(|e| e.effect.kind() == kind && (e.effect.exclusive() || effect.exclusive()));
            if conflict {
                drop(entries);
                let err = ScheduleError::AlreadyActive { kind };
                tracing::debug!(request_id = %request.id, error = %err, "timed effect rejected");
                self.reply(&request.id, EffectStatus::Retry, None, &err.to_string());
                return Err(err);
            }

            effect.start(state);
            entries.push(Entry {
                request: request.clone(),
                effect: Box::new(effect),
                duration,
                remaining: duration,
                paused: false,
            });
        }

        tracing::info!(
            request_id = %request.id,
            kind = %kind,
            duration_ms = duration.as_millis() as u64,
            "timed effect started"
        );
        self.reply(&request.id, EffectStatus::Success, Some(duration), "");
        Ok(duration)
    }

    /// Advance every unpaused entry by `elapsed`.
    pub fn tick(&self, state: &mut S, elapsed: Duration) {
        let finished = {
            let mut entries = self.lock();
            let mut finished = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                let entry = &mut entries[i];
                if entry.paused {
                    i += 1;
                    continue;
                }
                entry.remaining = entry.remaining.saturating_sub(elapsed);
                if entry.remaining.is_zero() {
                    finished.push(entries.remove(i));
                } else {
                    entry.effect.tick(state);
                    i += 1;
                }
            }
            finished
        };
        self.finish_entries(state, finished);
    }

    /// Pause matching entries. Already paused entries are left alone.
    pub fn pause_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&EntryInfo) -> bool,
    {
        self.set_paused(true, pred)
    }

    /// Resume matching entries. Entries that are not paused are left alone.
    pub fn resume_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&EntryInfo) -> bool,
    {
        self.set_paused(false, pred)
    }

    pub fn pause_all(&self) -> usize {
        self.pause_where(|_| true)
    }

    pub fn resume_all(&self) -> usize {
        self.resume_where(|_| true)
    }

    /// Extend every live entry, paused or not.
    pub fn add_time(&self, delta: Duration) -> usize {
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            entry.remaining = entry.remaining.saturating_add(delta);
            entry.duration = entry.duration.saturating_add(delta);
        }
        if !entries.is_empty() {
            tracing::debug!(delta_ms = delta.as_millis() as u64, count = entries.len(), "timed effects extended");
        }
        entries.len()
    }

    /// Shorten every live entry, clamped at zero. Entries that hit zero finish
    /// immediately. Returns how many entries finished.
    pub fn remove_time(&self, state: &mut S, delta: Duration) -> usize {
        let finished = {
            let mut entries = self.lock();
            let mut finished = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                let entry = &mut entries[i];
                entry.remaining = entry.remaining.saturating_sub(delta);
                if entry.remaining.is_zero() {
                    finished.push(entries.remove(i));
                } else {
                    i += 1;
                }
            }
            finished
        };
        let count = finished.len();
        self.finish_entries(state, finished);
        count
    }

    /// End one entry early through the normal finish path.
    pub fn finish(&self, state: &mut S, request_id: &RequestId) -> bool {
        let entry = {
            let mut entries = self.lock();
            entries
                .iter()
                .position(|e| &e.request.id == request_id)
                .map(|pos| entries.remove(pos))
        };
        match entry {
            Some(mut entry) => {
                entry.remaining = Duration::ZERO;
                self.finish_entries(state, vec![entry]);
                true
            }
            None => false,
        }
    }

    /// Stop everything without reporting; used on teardown.
    pub fn stop_all(&self, state: &mut S) -> usize {
        let drained: Vec<Entry<S>> = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for mut entry in drained {
            entry.effect.stop(state);
            tracing::debug!(request_id = %entry.request.id, "timed effect force-stopped");
        }
        count
    }

    pub fn is_running(&self, kind: &str) -> bool {
        self.lock().iter().any(|e| e.effect.kind() == kind)
    }

    pub fn is_running_where<F>(&self, pred: F) -> bool
    where
        F: Fn(&EntryInfo) -> bool,
    {
        self.lock().iter().any(|e| pred(&e.info()))
    }

    pub fn remaining(&self, request_id: &RequestId) -> Option<Duration> {
        self.lock()
            .iter()
            .find(|e| &e.request.id == request_id)
            .map(|e| e.remaining)
    }

    pub fn snapshot(&self) -> Vec<EntryInfo> {
        self.lock().iter().map(Entry::info).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn set_paused<F>(&self, paused: bool, pred: F) -> usize
    where
        F: Fn(&EntryInfo) -> bool,
    {
        let status = if paused {
            EffectStatus::Paused
        } else {
            EffectStatus::Resumed
        };
        let changed: Vec<(RequestId, Duration)> = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .filter(|e| e.paused != paused && pred(&e.info()))
                .map(|e| {
                    e.paused = paused;
                    (e.request.id.clone(), e.remaining)
                })
                .collect()
        };
        for (id, remaining) in &changed {
            self.reply(id, status, Some(*remaining), "");
        }
        if !changed.is_empty() {
            tracing::info!(?status, count = changed.len(), "timed effects toggled");
        }
        changed.len()
    }

    fn finish_entries(&self, state: &mut S, finished: Vec<Entry<S>>) {
        for mut entry in finished {
            entry.effect.stop(state);
            tracing::info!(
                request_id = %entry.request.id,
                kind = %entry.effect.kind(),
                "timed effect finished"
            );
            self.reply(&entry.request.id, EffectStatus::Finished, Some(Duration::ZERO), "");
        }
    }

    fn reply(&self, id: &RequestId, status: EffectStatus, remaining: Option<Duration>, message: &str) {
        let result = match remaining {
            Some(remaining) => self.sender.respond_timed(id, status, remaining, message),
            None => self
                .sender
                .send(&crate::model::Response::new(id.clone(), status).with_message(message)),
        };
        if let Err(err) = result {
            tracing::debug!(request_id = %id, ?status, error = %err, "timed effect response not sent");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
