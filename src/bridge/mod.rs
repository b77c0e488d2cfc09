//! Host-facing entry point.
//!
//! The host owns its state and its tick loop; it forwards lifecycle signals
//! here. Networking runs on a tokio runtime the host provides, everything that
//! touches state runs inside `on_tick` on the caller's thread.

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatch::{DispatchOutcome, Dispatcher, HostSignals, SpawnId};
use crate::model::RequestId;
use crate::queue::RequestQueue;
use crate::registry::HandlerRegistry;
use crate::scheduler::TimedEffectScheduler;
use crate::sender::ResponseSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Removes one tracked entity from host state.
pub type Despawn<S> = Box<dyn Fn(&mut S, SpawnId) + Send + Sync>;

pub struct EffectBridge<S> {
    config: ConnectionConfig,
    runtime: Handle,
    queue: RequestQueue,
    sender: ResponseSender,
    signals: HostSignals,
    scheduler: Arc<TimedEffectScheduler<S>>,
    dispatcher: Dispatcher<S>,
    connection: Option<(Arc<ConnectionManager>, JoinHandle<()>)>,
    despawn: Option<Despawn<S>>,
}

impl<S: 'static> EffectBridge<S> {
    pub fn new(config: ConnectionConfig, registry: HandlerRegistry<S>, runtime: Handle) -> Self {
        let queue = RequestQueue::new();
        let sender = ResponseSender::new();
        let signals = HostSignals::default();
        let scheduler = Arc::new(TimedEffectScheduler::new(sender.clone()));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            queue.clone(),
            sender.clone(),
            scheduler.clone(),
            signals.clone(),
        );
        Self {
            config,
            runtime,
            queue,
            sender,
            signals,
            scheduler,
            dispatcher,
            connection: None,
            despawn: None,
        }
    }

    /// Host callback that removes a tracked spawn; run for each one when saving begins.
    pub fn set_despawn<F>(&mut self, despawn: F)
    where
        F: Fn(&mut S, SpawnId) + Send + Sync + 'static,
    {
        self.despawn = Some(Box::new(despawn));
    }

    /// Start the connection supervisor. A no-op while one is already running;
    /// after teardown or exhausted retries it starts a fresh one.
    pub fn on_ready(&mut self) {
        if let Some((_, task)) = &self.connection {
            if !task.is_finished() {
                tracing::debug!("connection already running");
                return;
            }
        }

        let manager = Arc::new(ConnectionManager::new(
            self.config.clone(),
            self.queue.clone(),
            self.sender.clone(),
        ));
        let supervisor = manager.clone();
        let task = self.runtime.spawn(async move {
            if let Err(err) = supervisor.run().await {
                tracing::error!(error = %err, "controller link idle");
            }
        });
        self.connection = Some((manager, task));
    }

    /// Close the link, drop unprocessed commands and force-stop live effects.
    pub fn on_teardown(&mut self, state: &mut S) {
        if let Some((manager, _)) = self.connection.take() {
            manager.stop();
        }
        let dropped = self.queue.clear();
        let stopped = self.scheduler.stop_all(state);
        tracing::info!(dropped, stopped, "effect bridge torn down");
    }

    /// Suspend dispatch and remove every entity handlers spawned.
    pub fn on_saving_begin(&self, state: &mut S) {
        self.signals.set_saving(true);
        let spawned = self.dispatcher.spawns().drain();
        if spawned.is_empty() {
            return;
        }
        match &self.despawn {
            Some(despawn) => {
                for id in &spawned {
                    despawn(state, *id);
                }
                tracing::info!(count = spawned.len(), "removed tracked spawns before save");
            }
            None => tracing::warn!(count = spawned.len(), "tracked spawns dropped without a despawn callback"),
        }
    }

    pub fn on_saving_end(&self) {
        self.signals.set_saving(false);
    }

    /// Host simulation paused or resumed. Timed effects follow on transitions only.
    pub fn on_time_frozen(&self, frozen: bool) {
        let was_frozen = self.signals.set_time_frozen(frozen);
        if was_frozen == frozen {
            return;
        }
        let changed = if frozen {
            self.scheduler.pause_all()
        } else {
            self.scheduler.resume_all()
        };
        tracing::debug!(frozen, changed, "time freeze toggled");
    }

    /// Advance timed effects by `elapsed`, then run at most one queued command.
    pub fn on_tick(&self, state: &mut S, elapsed: Duration) -> DispatchOutcome {
        self.scheduler.tick(state, elapsed);
        self.dispatcher.poll(state)
    }

    pub fn set_can_spawn(&self, can_spawn: bool) {
        self.signals.set_can_spawn(can_spawn);
    }

    pub fn add_time(&self, delta: Duration) -> usize {
        self.scheduler.add_time(delta)
    }

    pub fn remove_time(&self, state: &mut S, delta: Duration) -> usize {
        self.scheduler.remove_time(state, delta)
    }

    pub fn finish(&self, state: &mut S, request_id: &RequestId) -> bool {
        self.scheduler.finish(state, request_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        match &self.connection {
            Some((manager, _)) => manager.state(),
            None => ConnectionState::Disconnected,
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn sender(&self) -> &ResponseSender {
        &self.sender
    }

    pub fn scheduler(&self) -> &TimedEffectScheduler<S> {
        &self.scheduler
    }

    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EffectContext;
    use crate::model::{EffectStatus, Request};
    use crate::registry::HandlerResult;
    use crate::scheduler::TimedEffect;
    use crate::sender::Outbox;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Counter {
        value: i32,
        ticks: u32,
        boosted: bool,
    }

    struct Boost;

    impl TimedEffect<Counter> for Boost {
        fn kind(&self) -> &str {
            "boost"
        }

        fn exclusive(&self) -> bool {
            true
        }

        fn start(&mut self, state: &mut Counter) {
            state.boosted = true;
        }

        fn tick(&mut self, state: &mut Counter) {
            state.ticks += 1;
        }

        fn stop(&mut self, state: &mut Counter) {
            state.boosted = false;
        }
    }

    fn bump(ctx: &mut EffectContext<'_, Counter>, request: &Request) -> HandlerResult {
        ctx.state().value += 1;
        ctx.respond(request, EffectStatus::Success, "");
        Ok(())
    }

    fn boost(ctx: &mut EffectContext<'_, Counter>, request: &Request) -> HandlerResult {
        let duration = request.duration_or(Duration::from_secs(1));
        ctx.schedule(request, Boost, duration)?;
        Ok(())
    }

    fn bridge() -> EffectBridge<Counter> {
        let mut registry = HandlerRegistry::new();
        registry.register("bump", bump).register("boost", boost);
        EffectBridge::new(ConnectionConfig::default(), registry, Handle::current())
    }

    fn statuses(outbox: &mut Outbox) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = outbox.try_recv() {
            let value: serde_json::Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
            out.push(value["status"].as_str().unwrap_or_default().to_string());
        }
        out
    }

    #[tokio::test]
    async fn tick_applies_one_command_per_call() {
        let bridge = bridge();
        let mut outbox = bridge.sender().attach();
        let mut state = Counter::default();
        bridge.queue().push(Request::new(1, "bump"));
        bridge.queue().push(Request::new(2, "bump"));

        assert_eq!(
            bridge.on_tick(&mut state, Duration::from_millis(16)),
            DispatchOutcome::Dispatched(RequestId::Number(1))
        );
        assert_eq!(state.value, 1);
        bridge.on_tick(&mut state, Duration::from_millis(16));
        assert_eq!(state.value, 2);
        assert_eq!(
            bridge.on_tick(&mut state, Duration::from_millis(16)),
            DispatchOutcome::Idle
        );
        assert_eq!(statuses(&mut outbox), vec!["Success", "Success"]);
    }

    #[tokio::test]
    async fn saving_holds_commands_until_it_ends() {
        let bridge = bridge();
        let mut state = Counter::default();
        bridge.queue().push(Request::new(1, "bump"));
        bridge.on_saving_begin(&mut state);
        assert_eq!(
            bridge.on_tick(&mut state, Duration::from_millis(16)),
            DispatchOutcome::Suspended
        );
        assert_eq!(state.value, 0);
        bridge.on_saving_end();
        bridge.on_tick(&mut state, Duration::from_millis(16));
        assert_eq!(state.value, 1);
    }

    #[tokio::test]
    async fn freeze_pauses_and_thaw_resumes_timed_effects() {
        let bridge = bridge();
        let mut outbox = bridge.sender().attach();
        let mut state = Counter::default();
        bridge
            .queue()
            .push(Request::new(5, "boost").with_duration(Duration::from_millis(100)));
        bridge.on_tick(&mut state, Duration::ZERO);
        assert!(state.boosted);

        bridge.on_time_frozen(true);
        bridge.on_time_frozen(true);
        bridge.on_tick(&mut state, Duration::from_millis(500));
        assert!(state.boosted);
        assert_eq!(
            bridge.scheduler().remaining(&RequestId::Number(5)),
            Some(Duration::from_millis(100))
        );

        bridge.on_time_frozen(false);
        bridge.on_tick(&mut state, Duration::from_millis(60));
        bridge.on_tick(&mut state, Duration::from_millis(60));
        assert!(!state.boosted);
        assert_eq!(state.ticks, 1);
        assert_eq!(
            statuses(&mut outbox),
            vec!["Success", "Paused", "Resumed", "Finished"]
        );
    }

    #[tokio::test]
    async fn teardown_drops_queue_and_stops_effects_silently() {
        let mut bridge = bridge();
        let mut outbox = bridge.sender().attach();
        let mut state = Counter::default();
        bridge.queue().push(Request::new(1, "boost"));
        bridge.on_tick(&mut state, Duration::ZERO);
        bridge.queue().push(Request::new(2, "bump"));

        bridge.on_teardown(&mut state);
        assert!(bridge.queue().is_empty());
        assert!(bridge.scheduler().is_empty());
        assert!(!state.boosted);
        assert_eq!(state.value, 0);
        assert_eq!(statuses(&mut outbox), vec!["Success"]);
    }

    #[tokio::test]
    async fn time_adjustments_pass_through() {
        let bridge = bridge();
        let mut state = Counter::default();
        bridge
            .queue()
            .push(Request::new(9, "boost").with_duration(Duration::from_millis(200)));
        bridge.on_tick(&mut state, Duration::ZERO);
        assert_eq!(bridge.add_time(Duration::from_millis(100)), 1);
        assert_eq!(
            bridge.scheduler().remaining(&RequestId::Number(9)),
            Some(Duration::from_millis(300))
        );
        assert_eq!(bridge.remove_time(&mut state, Duration::from_secs(1)), 1);
        assert!(!state.boosted);
    }

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig {
            port: listener.local_addr().unwrap().port(),
            ..ConnectionConfig::default()
        };
        let mut registry = HandlerRegistry::new();
        registry.register("bump", bump);
        let mut bridge = EffectBridge::new(config, registry, Handle::current());
        bridge.on_ready();
        bridge.on_ready();

        let (mut controller, _) = listener.accept().await.unwrap();
        controller
            .write_all(b"{\"id\":42,\"code\":\"bump\"}\0")
            .await
            .unwrap();

        let mut state = Counter::default();
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.value == 0 {
                bridge.on_tick(&mut state, Duration::from_millis(16));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut frame = Vec::new();
        loop {
            let byte = controller.read_u8().await.unwrap();
            if byte == 0 {
                break;
            }
            frame.push(byte);
        }
        let msg: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(msg, serde_json::json!({"requestId": 42, "status": "Success"}));
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);

        bridge.on_teardown(&mut state);
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn saving_removes_tracked_spawns() {
        let mut registry: HandlerRegistry<Counter> = HandlerRegistry::new();
        registry.register_fn("summon", |ctx, req| {
            ctx.state().value += 1;
            let id = ctx.state().value as SpawnId;
            ctx.track_spawn(id);
            ctx.respond(req, EffectStatus::Success, "");
            Ok(())
        });
        let mut bridge = EffectBridge::new(ConnectionConfig::default(), registry, Handle::current());
        bridge.set_despawn(|state: &mut Counter, _id| state.value -= 1);

        let mut state = Counter::default();
        bridge.queue().push(Request::new(1, "summon"));
        bridge.queue().push(Request::new(2, "summon"));
        bridge.on_tick(&mut state, Duration::ZERO);
        bridge.on_tick(&mut state, Duration::ZERO);
        assert_eq!(state.value, 2);

        bridge.on_saving_begin(&mut state);
        assert_eq!(state.value, 0);
        bridge.on_saving_end();
        bridge.on_saving_begin(&mut state);
        assert_eq!(state.value, 0);
    }
}
