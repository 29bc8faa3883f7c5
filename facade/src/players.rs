use std::collections::{HashMap, HashSet};

use bevy::prelude::*;

use crate::blocks::{ChunkColumn, Tool, WorldId};
use crate::view::manager::BlockViews;

pub struct PlayerPlugin;
impl Plugin for PlayerPlugin {
    fn build(&self, app: &mut App) {
        app.add_event::<PlayerEvent>()
            .init_resource::<LoadedChunks>()
            .add_systems(PreUpdate, handle_player_events);
    }
}

/// Player marker struct
#[derive(Component, Default)]
pub struct Player {
    pub username: String,
}

/// The world the player is currently in. Kept current by the host.
#[derive(Component, Deref, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentWorld(pub WorldId);

/// The tool held in the player's main hand, if any. Kept current by the host.
#[derive(Component, Deref, Debug, Default)]
pub struct MainHand(pub Option<Tool>);

/// Status effects that scale the player's block break speed. Kept current by the host and read
/// when a dig session starts.
#[derive(Component, Debug, Clone, Default)]
pub struct BreakContext {
    pub haste: u8,
    pub mining_fatigue: u8,
    pub underwater: bool,
    pub airborne: bool,
}

impl BreakContext {
    pub(crate) fn speed_factor(&self) -> f32 {
        let mut speed = 1.0 + 0.2 * self.haste as f32;
        speed *= 0.3f32.powi(self.mining_fatigue as i32);
        if self.underwater {
            speed /= 5.0;
        }
        if self.airborne {
            speed /= 5.0;
        }
        speed
    }
}

/// Player lifecycle notifications, sent by the host.
#[derive(Event, Debug, Clone, Copy)]
pub enum PlayerEvent {
    Connected {
        entity: Entity,
    },
    /// The player's connection dropped. Their dig sessions are destroyed and every view forgets
    /// them; this event must arrive before the entity is despawned.
    Disconnected {
        entity: Entity,
    },
    ChangedWorld {
        entity: Entity,
        from: WorldId,
        to: WorldId,
    },
}

/// Keeps track of which chunk columns each player's client currently has loaded. Targeted block
/// updates only go to clients that have the containing column loaded.
#[derive(Resource, Default)]
pub struct LoadedChunks {
    chunk_to_players: HashMap<ChunkColumn, HashSet<Entity>>,
    player_to_chunks: HashMap<Entity, HashSet<ChunkColumn>>,
}

impl LoadedChunks {
    pub fn mark_loaded(&mut self, player: Entity, column: ChunkColumn) {
        self.chunk_to_players
            .entry(column)
            .or_default()
            .insert(player);
        self.player_to_chunks
            .entry(player)
            .or_default()
            .insert(column);
    }

    pub fn mark_unloaded(&mut self, player: Entity, column: ChunkColumn) {
        if let Some(players) = self.chunk_to_players.get_mut(&column) {
            players.remove(&player);
            if players.is_empty() {
                self.chunk_to_players.remove(&column);
            }
        }
        if let Some(columns) = self.player_to_chunks.get_mut(&player) {
            columns.remove(&column);
            if columns.is_empty() {
                self.player_to_chunks.remove(&player);
            }
        }
    }

    pub fn forget_player(&mut self, player: Entity) {
        let Some(columns) = self.player_to_chunks.remove(&player) else {
            return;
        };
        for column in columns {
            if let Some(players) = self.chunk_to_players.get_mut(&column) {
                players.remove(&player);
                if players.is_empty() {
                    self.chunk_to_players.remove(&column);
                }
            }
        }
    }

    pub fn players(&self, column: &ChunkColumn) -> Option<&HashSet<Entity>> {
        self.chunk_to_players.get(column)
    }

    pub fn contains(&self, player: Entity, column: &ChunkColumn) -> bool {
        self.player_to_chunks
            .get(&player)
            .is_some_and(|columns| columns.contains(column))
    }
}

fn handle_player_events(mut views: BlockViews, mut player_events: EventReader<PlayerEvent>) {
    for event in player_events.read() {
        match event {
            PlayerEvent::Connected { .. } => {}
            PlayerEvent::Disconnected { entity } => {
                views.stop_digging(*entity);
                views.forget_player(*entity);
            }
            PlayerEvent::ChangedWorld { entity, .. } => {
                // The client drops its loaded chunks with the world. View membership survives;
                // overlays come back when the host applies them for the new world's chunks.
                views.loaded_chunks_mut().forget_player(*entity);
            }
        }
    }
}
