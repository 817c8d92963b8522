use std::collections::VecDeque;

use bevy::prelude::*;

use super::components::{HealthComponent, PositionComponent, VelocityComponent};
use super::events::{DamageEvent, MoveEvent, SpeakAttemptEvent};
use crate::scripting::{PendingEvents, Raised};

const MAX_CHAT_LINES: usize = 128;

#[derive(Clone, Debug, PartialEq)]
pub struct ChatLine {
    pub speaker: Option<Entity>,
    pub message: String,
}

#[derive(Resource, Default)]
pub struct ChatLog {
    pub lines: VecDeque<ChatLine>,
}

impl ChatLog {
    pub fn push(&mut self, line: ChatLine) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_CHAT_LINES {
            self.lines.pop_front();
        }
    }

    /// Newest `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(limit);
        self.lines
            .iter()
            .skip(skip)
            .map(|l| l.message.clone())
            .collect()
    }
}

pub fn integrate_velocity(
    time: Res<Time>,
    mut movers: Query<(Entity, &mut PositionComponent, &VelocityComponent)>,
    mut moves: ResMut<PendingEvents<MoveEvent>>,
) {
    let dt = time.delta_secs();
    if dt <= 0.0 {
        return;
    }
    for (entity, mut pos, vel) in &mut movers {
        if vel.x == 0.0 && vel.y == 0.0 {
            continue;
        }
        let old_position = pos.coordinates();
        pos.x += vel.x * dt;
        pos.y += vel.y * dt;
        moves.raise_local(
            entity,
            MoveEvent {
                old_position,
                new_position: pos.coordinates(),
            },
        );
    }
}

pub fn apply_damage(
    mut events: EventReader<Raised<DamageEvent>>,
    mut health: Query<&mut HealthComponent>,
) {
    for raised in events.read() {
        let Some(target) = raised.target else {
            continue;
        };
        let Ok(mut hp) = health.get_mut(target) else {
            continue;
        };
        let before = hp.current;
        hp.current = (hp.current - raised.event.amount).clamp(0.0, hp.max);
        if before > 0.0 && hp.current == 0.0 {
            info!("[LuaHost gameplay] Entity {target} was reduced to 0 health");
        }
    }
}

pub fn record_speech(
    mut events: EventReader<Raised<SpeakAttemptEvent>>,
    mut log: ResMut<ChatLog>,
) {
    for raised in events.read() {
        if raised.event.cancelled {
            debug!("[LuaHost gameplay] Speech from {:?} was cancelled", raised.target);
            continue;
        }
        log.push(ChatLine {
            speaker: raised.target,
            message: raised.event.message.clone(),
        });
    }
}
