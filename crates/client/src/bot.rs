use glam::{Quat, Vec3};

use worldsync::{
    ClientDispatcher, DataValue, EffectRecord, EntityId, EntityKind, EntityPatch, EntitySpec,
    Owner, SyncError, SyncResult, Transform, TransformCache, Transport, World,
};

use crate::config::BotConfig;

const COUNTER_KEY: &str = "counter";
const ORBIT_RADIUS: f32 = 4.0;
const BUMP_INTERVAL_MS: u64 = 1_000;
const TELEPORT_INTERVAL_MS: u64 = 10_000;
const PING_INTERVAL_MS: u64 = 1_000;

/// Scripted client. Each tick it acts on its replica of the world and then
/// flushes whatever that produced.
pub struct Bot {
    client: ClientDispatcher,
    config: BotConfig,
    started_ms: Option<u64>,
    crates: Vec<EntityId>,
    claimed: Option<EntityId>,
    counter: i64,
    last_bump_ms: u64,
    last_teleport_ms: u64,
    last_ping_ms: u64,
    last_report_ms: u64,
    finished: bool,
}

impl Bot {
    pub fn new(config: BotConfig) -> Self {
        let client = ClientDispatcher::new(
            World::client(Box::new(TransformCache::new())),
            config.server,
            config.world_config(),
        );
        Self {
            client,
            config,
            started_ms: None,
            crates: Vec::new(),
            claimed: None,
            counter: 0,
            last_bump_ms: 0,
            last_teleport_ms: 0,
            last_ping_ms: 0,
            last_report_ms: 0,
            finished: false,
        }
    }

    pub fn client(&self) -> &ClientDispatcher {
        &self.client
    }

    pub fn connect(&mut self, now_ms: u64) {
        log::info!("connecting to {}", self.config.server);
        self.client.connect(now_ms);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle_packet(&mut self, data: &[u8], now_ms: u64) {
        self.client.handle_packet(data, now_ms);
    }

    pub fn tick<T: Transport>(&mut self, now_ms: u64, transport: &mut T) -> SyncResult<()> {
        if self.client.is_connected() && !self.finished {
            self.act(now_ms);
        }
        for reason in self.client.drain_rejections() {
            log::warn!("server rejected: {}", reason);
        }
        self.client.tick_once(now_ms, transport)
    }

    /// Gives back what the bot holds and leaves.
    pub fn wind_down(&mut self) {
        if self.finished {
            return;
        }
        if let Some(id) = self.claimed.take() {
            log_failure("release", self.client.release(id).map(drop));
        }
        for id in std::mem::take(&mut self.crates) {
            log_failure("remove", self.client.remove_entity(id).map(drop));
        }
        self.client.disconnect();
        self.finished = true;
        log::info!("disconnected");
    }

    fn act(&mut self, now_ms: u64) {
        let (Some(session), Some(player)) = (self.client.session_id(), self.client.player_id())
        else {
            return;
        };
        if self.client.world().get(player).is_none() {
            return;
        }

        let started = match self.started_ms {
            Some(started) => started,
            None => {
                self.setup(session, player);
                self.started_ms = Some(now_ms);
                now_ms
            }
        };
        let elapsed = now_ms.saturating_sub(started);

        log_failure("move", self.client.move_entity(player, orbit(elapsed)));

        let mine = Owner::Client(session);
        if let Some(id) = self
            .claimed
            .filter(|id| self.client.world().owner(*id) == Some(mine))
        {
            let base = self.client.world().get(id).map(|e| e.transform);
            if let Some(mut transform) = base {
                transform.position.y = (elapsed as f32 / 500.0).sin().abs();
                log_failure("move claimed", self.client.move_entity(id, transform));
            }
        }

        if now_ms.saturating_sub(self.last_bump_ms) >= BUMP_INTERVAL_MS {
            self.last_bump_ms = now_ms;
            self.bump_counters();
        }

        if now_ms.saturating_sub(self.last_teleport_ms) >= TELEPORT_INTERVAL_MS {
            self.last_teleport_ms = now_ms;
            log_failure(
                "teleport",
                self.client
                    .teleport(player, Vec3::new(0.0, 1.0, 0.0), Some(0.0))
                    .map(drop),
            );
        }

        if now_ms.saturating_sub(self.last_ping_ms) >= PING_INTERVAL_MS {
            self.last_ping_ms = now_ms;
            self.client.ping(now_ms);
        }

        if now_ms.saturating_sub(self.last_report_ms) >= self.config.report_interval_ms {
            self.last_report_ms = now_ms;
            self.report(player);
        }

        if elapsed >= self.config.run_secs * 1000 {
            self.wind_down();
        }
    }

    fn setup(&mut self, session: worldsync::SessionId, player: EntityId) {
        for i in 0..self.config.crates {
            let spec = EntitySpec::new(EntityKind::Model)
                .with_owner(Owner::Client(session))
                .with_transform(Transform::from_position(Vec3::new(i as f32 * 2.0, 0.0, 3.0)))
                .with_custom(COUNTER_KEY, DataValue::Int(0));
            match self.client.add_entity(spec) {
                Ok(id) => self.crates.push(id),
                Err(e) => log::warn!("could not add crate: {}", e),
            }
        }

        if self.config.claim_server_entity {
            let target = self
                .client
                .world()
                .entities()
                .find(|e| e.kind == EntityKind::App)
                .map(|e| e.id)
                .filter(|id| self.client.world().owner(*id) == Some(Owner::Server));
            if let Some(id) = target {
                log::info!("claiming {}", id);
                log_failure("claim", self.client.claim(id).map(drop));
                self.claimed = Some(id);
            }
        }

        let wave = EffectRecord::new().emote("wave").duration_ms(2_000).cancellable();
        log_failure("effect", self.client.apply_effect(player, wave).map(drop));
    }

    fn bump_counters(&mut self) {
        self.counter += 1;
        let present: Vec<EntityId> = self
            .crates
            .iter()
            .copied()
            .filter(|id| self.client.world().get(*id).is_some())
            .collect();
        for id in present {
            let patch = EntityPatch::new().set_custom(COUNTER_KEY, DataValue::Int(self.counter));
            log_failure("bump", self.client.modify_entity(id, patch).map(drop));
        }
    }

    fn report(&self, player: EntityId) {
        let world = self.client.world();
        let health = world
            .get(player)
            .and_then(|e| e.player.as_ref())
            .map(|p| p.health)
            .unwrap_or_default();
        log::info!(
            "tick {}: {} entities, health {}, rtt {:.1}ms, {} packets in / {} out",
            self.client.server_tick(),
            world.entity_count(),
            health,
            self.client.stats().rtt_ms,
            self.client.stats().packets_received,
            self.client.stats().packets_sent
        );
    }
}

/// Player position along a circle, facing the direction of travel.
fn orbit(elapsed_ms: u64) -> Transform {
    let angle = elapsed_ms as f32 / 1000.0;
    Transform {
        position: Vec3::new(angle.cos() * ORBIT_RADIUS, 1.0, angle.sin() * ORBIT_RADIUS),
        rotation: Quat::from_rotation_y(-angle),
        scale: Vec3::ONE,
    }
}

fn log_failure(action: &str, result: SyncResult<()>) {
    match result {
        Ok(()) => {}
        Err(e @ SyncError::Transport(_)) => log::warn!("{} failed: {}", action, e),
        Err(e) => log::debug!("{} skipped: {}", action, e),
    }
}
