//! Per-player transient status effects.
//!
//! A player is either without an effect or has exactly one active effect.
//! Each installed effect gets a fresh generation; a handle is only live while
//! its generation is the player's current one. Every way an effect can end
//! (expiry, cancel, supersede, entity removal) goes through `finish`, so the
//! end callback fires exactly once.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::EntityId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectRecord {
    pub anchor_id: Option<EntityId>,
    pub emote: Option<String>,
    /// Movement speed multiplier in `0.0..=1.0`.
    pub snare: Option<f32>,
    pub freeze: bool,
    pub turn: bool,
    pub duration_ms: Option<u64>,
    pub cancellable: bool,
}

impl EffectRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emote(mut self, emote: impl Into<String>) -> Self {
        self.emote = Some(emote.into());
        self
    }

    pub fn anchor(mut self, anchor: EntityId) -> Self {
        self.anchor_id = Some(anchor);
        self
    }

    pub fn snare(mut self, multiplier: f32) -> Self {
        self.snare = Some(multiplier.clamp(0.0, 1.0));
        self
    }

    pub fn freeze(mut self) -> Self {
        self.freeze = true;
        self
    }

    pub fn turn(mut self) -> Self {
        self.turn = true;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    /// Cancellable effects never freeze. Applied on every install.
    pub fn normalized(mut self) -> Self {
        if self.cancellable {
            self.freeze = false;
        }
        if let Some(snare) = self.snare {
            self.snare = Some(if snare.is_finite() { snare.clamp(0.0, 1.0) } else { 1.0 });
        }
        self
    }

    pub fn locks_movement(&self) -> bool {
        self.freeze || self.anchor_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Expired,
    Cancelled,
    Superseded,
    EntityRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectHandle {
    pub player: EntityId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectEnd {
    pub handle: EffectHandle,
    pub reason: EndReason,
    pub record: EffectRecord,
}

pub type OnEffectEnd = Box<dyn FnOnce(&EffectEnd) + Send>;

struct ActiveEffect {
    generation: u64,
    record: EffectRecord,
    started_at_ms: u64,
    on_end: Option<OnEffectEnd>,
}

#[derive(Default)]
pub struct EffectMachine {
    active: HashMap<EntityId, ActiveEffect>,
    next_generation: u64,
}

impl std::fmt::Debug for EffectMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectMachine")
            .field("active", &self.active.len())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}

impl EffectMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `record` on `player`. A previous effect ends first with
    /// `Superseded`, and its end is returned alongside the new handle.
    pub fn apply(
        &mut self,
        player: EntityId,
        record: EffectRecord,
        now_ms: u64,
        on_end: Option<OnEffectEnd>,
    ) -> (EffectHandle, Option<EffectEnd>) {
        let superseded = self.finish(player, EndReason::Superseded);

        self.next_generation += 1;
        let generation = self.next_generation;
        self.active.insert(
            player,
            ActiveEffect {
                generation,
                record: record.normalized(),
                started_at_ms: now_ms,
                on_end,
            },
        );

        (EffectHandle { player, generation }, superseded)
    }

    pub fn is_active(&self, handle: EffectHandle) -> bool {
        self.active
            .get(&handle.player)
            .is_some_and(|e| e.generation == handle.generation)
    }

    /// No-op for stale handles.
    pub fn cancel(&mut self, handle: EffectHandle) -> Option<EffectEnd> {
        if !self.is_active(handle) {
            return None;
        }
        self.finish(handle.player, EndReason::Cancelled)
    }

    pub fn end_for(&mut self, player: EntityId, reason: EndReason) -> Option<EffectEnd> {
        self.finish(player, reason)
    }

    /// Ends every effect whose duration has elapsed at `now_ms`.
    pub fn expire(&mut self, now_ms: u64) -> Vec<EffectEnd> {
        let mut due: Vec<EntityId> = self
            .active
            .iter()
            .filter(|(_, e)| {
                e.record
                    .duration_ms
                    .is_some_and(|d| now_ms.saturating_sub(e.started_at_ms) >= d)
            })
            .map(|(&player, _)| player)
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|player| self.finish(player, EndReason::Expired))
            .collect()
    }

    pub fn current(&self, player: EntityId) -> Option<(EffectHandle, &EffectRecord)> {
        self.active.get(&player).map(|e| {
            (
                EffectHandle {
                    player,
                    generation: e.generation,
                },
                &e.record,
            )
        })
    }

    /// Players whose current effect is anchored to `anchor`.
    pub fn anchored_to(&self, anchor: EntityId) -> Vec<EntityId> {
        let mut players: Vec<EntityId> = self
            .active
            .iter()
            .filter(|(_, e)| e.record.anchor_id == Some(anchor))
            .map(|(&player, _)| player)
            .collect();
        players.sort();
        players
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn finish(&mut self, player: EntityId, reason: EndReason) -> Option<EffectEnd> {
        let mut active = self.active.remove(&player)?;
        let end = EffectEnd {
            handle: EffectHandle {
                player,
                generation: active.generation,
            },
            reason,
            record: active.record,
        };
        if let Some(on_end) = active.on_end.take() {
            on_end(&end);
        }
        log::debug!("effect on {} ended: {:?}", player, reason);
        Some(end)
    }
}
