//! A small player model with a ready-made handler set, used by the binary and
//! as a worked example of writing handlers and timed effects.

use crate::dispatch::{EffectContext, SpawnId};
use crate::model::{EffectStatus, Request};
use crate::registry::{EffectHandler, HandlerRegistry, HandlerResult};
use crate::scheduler::TimedEffect;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub name: String,
    pub health: i32,
    pub max_health: i32,
    pub stamina: f32,
    pub max_stamina: i32,
    pub money: u32,
    pub buffs: Vec<String>,
    pub location: String,
    pub monsters: Vec<(SpawnId, String)>,
    next_monster: SpawnId,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            name: "Farmer".to_string(),
            health: 100,
            max_health: 100,
            stamina: 270.0,
            max_stamina: 270,
            money: 500,
            buffs: Vec::new(),
            location: "Farm".to_string(),
            monsters: Vec::new(),
            next_monster: 0,
        }
    }
}

impl PlayerState {
    pub fn has_buff(&self, kind: &str) -> bool {
        self.buffs.iter().any(|b| b == kind)
    }
}

/// Despawn callback for the bridge. Unknown ids are ignored.
pub fn despawn(state: &mut PlayerState, id: SpawnId) {
    state.monsters.retain(|(monster, _)| *monster != id);
}

/// Exclusive buff that lives on the player while its entry is scheduled.
#[derive(Debug, Clone)]
pub struct TimedBuff {
    kind: &'static str,
}

impl TimedBuff {
    pub fn new(kind: &'static str) -> Self {
        Self { kind }
    }
}

impl TimedEffect<PlayerState> for TimedBuff {
    fn kind(&self) -> &str {
        self.kind
    }

    fn exclusive(&self) -> bool {
        true
    }

    fn start(&mut self, state: &mut PlayerState) {
        state.buffs.push(self.kind.to_string());
    }

    fn stop(&mut self, state: &mut PlayerState) {
        state.buffs.retain(|b| b != self.kind);
    }
}

struct GiveBuff {
    kind: &'static str,
    label: &'static str,
    default_duration: Duration,
}

impl EffectHandler<PlayerState> for GiveBuff {
    fn handle(&self, ctx: &mut EffectContext<'_, PlayerState>, request: &Request) -> HandlerResult {
        let duration = request.duration_or(self.default_duration);
        ctx.schedule(request, TimedBuff::new(self.kind), duration)?;
        let name = ctx.state().name.clone();
        tracing::info!(
            "{} gave {} the {} effect for {} seconds",
            request.viewer_name(),
            name,
            self.label,
            duration.as_secs()
        );
        Ok(())
    }
}

/// Handler set for [`PlayerState`].
pub fn registry() -> HandlerRegistry<PlayerState> {
    let mut registry = HandlerRegistry::new();

    for percent in [10, 25, 50] {
        registry
            .register_fn(format!("heal_{percent}"), move |ctx, req| heal_by(ctx, req, percent))
            .register_fn(format!("hurt_{percent}"), move |ctx, req| hurt_by(ctx, req, percent))
            .register_fn(format!("energize_{percent}"), move |ctx, req| energize_by(ctx, req, percent))
            .register_fn(format!("tire_{percent}"), move |ctx, req| tire_by(ctx, req, percent));
    }
    registry
        .register("heal_full", heal_full)
        .register("energize_full", energize_full);

    for amount in [100, 1000, 10000] {
        registry
            .register_fn(format!("give_money_{amount}"), move |ctx, req| give_money(ctx, req, amount))
            .register_fn(format!("remove_money_{amount}"), move |ctx, req| remove_money(ctx, req, amount));
    }

    for (code, kind, label, secs) in [
        ("give_buff_speed", "speed", "Speed Buff", 120),
        ("give_buff_darkness", "darkness", "Darkness", 30),
        ("give_buff_slime", "slime", "Slimed", 10),
        ("give_buff_frozen", "frozen", "Frozen", 10),
    ] {
        registry.register(
            code,
            GiveBuff {
                kind,
                label,
                default_duration: Duration::from_secs(secs),
            },
        );
    }

    for (code, monster) in [
        ("spawn_bat", "Bat"),
        ("spawn_fly", "Fly"),
        ("spawn_ghost", "Ghost"),
        ("spawn_slime", "Green Slime"),
        ("spawn_serpent", "Serpent"),
    ] {
        registry.register_fn(code, move |ctx, req| spawn_monster(ctx, req, monster));
    }

    registry
}

fn spawn_monster(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, monster: &str) -> HandlerResult {
    if !ctx.can_spawn() {
        let player = ctx.state();
        let message = format!(
            "Cannot spawn {monster} because {} is at {}",
            player.name, player.location
        );
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    let player = ctx.state();
    let id = player.next_monster;
    player.next_monster += 1;
    player.monsters.push((id, monster.to_string()));
    let name = player.name.clone();
    ctx.track_spawn(id);
    ctx.respond(req, EffectStatus::Success, "");
    tracing::info!("{} spawned a {} near {}", req.viewer_name(), monster, name);
    Ok(())
}

fn heal_by(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, percent: i32) -> HandlerResult {
    let player = ctx.state();
    if player.health == 0 {
        let message = format!("{} is currently dead", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    if player.health >= player.max_health {
        let message = format!("{} is already at maximum health", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    player.health = (player.health + player.max_health * percent / 100).min(player.max_health);
    tracing::info!("{} healed {} by {}%", req.viewer_name(), player.name, percent);
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}

fn heal_full(ctx: &mut EffectContext<'_, PlayerState>, req: &Request) -> HandlerResult {
    let player = ctx.state();
    let (status, message) = if player.health == 0 {
        (EffectStatus::Failure, format!("{} is currently dead", player.name))
    } else if player.health >= player.max_health {
        (
            EffectStatus::Failure,
            format!("{} is already at maximum health", player.name),
        )
    } else {
        player.health = player.max_health;
        tracing::info!("{} fully healed {}", req.viewer_name(), player.name);
        (EffectStatus::Success, String::new())
    };
    ctx.respond(req, status, message);
    Ok(())
}

fn hurt_by(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, percent: i32) -> HandlerResult {
    let player = ctx.state();
    if player.health == 0 {
        let message = format!("{} is already dead", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    player.health = (player.health - player.max_health * percent / 100).max(0);
    tracing::info!("{} hurt {} by {}%", req.viewer_name(), player.name, percent);
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}

fn energize_by(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, percent: i32) -> HandlerResult {
    let player = ctx.state();
    let max = player.max_stamina as f32;
    if player.stamina >= max {
        let message = format!("{} is already at maximum energy", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    player.stamina = (player.stamina + max * percent as f32 / 100.0).min(max);
    tracing::info!("{} energized {} by {}%", req.viewer_name(), player.name, percent);
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}

fn energize_full(ctx: &mut EffectContext<'_, PlayerState>, req: &Request) -> HandlerResult {
    let player = ctx.state();
    let max = player.max_stamina as f32;
    if player.stamina >= max {
        let message = format!("{} is already at maximum energy", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    player.stamina = max;
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}

fn tire_by(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, percent: i32) -> HandlerResult {
    let player = ctx.state();
    if player.stamina <= 0.0 {
        let message = format!("{} is already passed out", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    let drain = player.max_stamina as f32 * percent as f32 / 100.0;
    player.stamina = (player.stamina - drain).max(0.0);
    tracing::info!("{} tired {} by {}%", req.viewer_name(), player.name, percent);
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}

fn give_money(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, amount: u32) -> HandlerResult {
    let player = ctx.state();
    player.money = player.money.saturating_add(amount);
    tracing::info!("{} gave {} {} coins", req.viewer_name(), player.name, amount);
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}

fn remove_money(ctx: &mut EffectContext<'_, PlayerState>, req: &Request, amount: u32) -> HandlerResult {
    let player = ctx.state();
    if player.money == 0 {
        let message = format!("{} has no money", player.name);
        ctx.respond(req, EffectStatus::Failure, message);
        return Ok(());
    }
    player.money = player.money.saturating_sub(amount);
    tracing::info!("{} removed {} coins from {}", req.viewer_name(), amount, player.name);
    ctx.respond(req, EffectStatus::Success, "");
    Ok(())
}
