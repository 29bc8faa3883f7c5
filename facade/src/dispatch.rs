use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;

use bevy::math::IVec3;
use bevy::prelude::*;
use serde::Serialize;

use facade_protocol::{messages, ClientBound};

use crate::blocks::BlockPosition;
use crate::players::Player;

pub struct DispatchPlugin;
impl Plugin for DispatchPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<UpdateQueue>()
            .init_resource::<PacketSender>()
            .add_systems(Last, flush_update_queue);
    }
}

/// Delivery seam to the host's connection layer. The engine hands over fully framed messages
/// and never waits on the result; failures are the sink's to log and swallow.
pub trait PacketSink: Send + Sync + 'static {
    fn send(&self, player: Entity, message: Vec<u8>);
}

#[derive(Resource, Clone)]
pub struct PacketSender {
    sink: Arc<dyn PacketSink>,
}

impl Default for PacketSender {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl PacketSender {
    pub fn new(sink: impl PacketSink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn send(&self, player: Entity, message: Vec<u8>) {
        self.sink.send(player, message);
    }
}

/// Discards everything. Stands in until the host installs its sink.
struct NullSink;
impl PacketSink for NullSink {
    fn send(&self, _player: Entity, _message: Vec<u8>) {}
}

impl<T: PacketSink + ?Sized> PacketSink for Arc<T> {
    fn send(&self, player: Entity, message: Vec<u8>) {
        (**self).send(player, message);
    }
}

// MessageType (1 byte) + message length (4 bytes)
const HEADER_SIZE: usize = 5;

/// Frame a message as `[type][length][payload]`.
pub fn serialize_message<T: ClientBound + Serialize>(message: &T) -> Vec<u8> {
    let size = bincode::serialized_size(message).unwrap() as usize;

    let mut buffer = Vec::with_capacity(HEADER_SIZE + size);
    buffer.push(T::TYPE as u8);
    buffer.extend((size as u32).to_le_bytes());
    bincode::serialize_into(&mut buffer, message).unwrap();

    buffer
}

/// Where a queued packet lands for per-tick dedup. A later packet for the same slot replaces
/// the earlier one in place, keeping its position in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum UpdateSlot {
    Block(BlockPosition),
    Chunk(IVec3),
    Stage(BlockPosition),
    BlockEntity(i32),
    Effect(BlockPosition),
}

#[derive(Default)]
struct PlayerQueue {
    packets: Vec<messages::Packet>,
    slots: HashMap<UpdateSlot, usize>,
}

impl PlayerQueue {
    fn push(&mut self, slot: UpdateSlot, packet: messages::Packet) {
        match self.slots.entry(slot) {
            Entry::Occupied(entry) => {
                let index = *entry.get();
                // Chunk updates merge cell-wise, everything else is latest-wins wholesale.
                let merged = match (&mut self.packets[index], &packet) {
                    (
                        messages::Packet::BlockUpdates(existing),
                        messages::Packet::BlockUpdates(incoming),
                    ) => {
                        for cell in &incoming.blocks {
                            if let Some(slot) = existing
                                .blocks
                                .iter_mut()
                                .find(|(index, _, _)| *index == cell.0)
                            {
                                *slot = *cell;
                            } else {
                                existing.blocks.push(*cell);
                            }
                        }
                        true
                    }
                    _ => false,
                };
                if !merged {
                    self.packets[index] = packet;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.packets.len());
                self.packets.push(packet);
            }
        }
    }
}

/// Pending view updates, bundled into one frame per viewer when the tick flushes.
#[derive(Resource, Default)]
pub struct UpdateQueue {
    pending: HashMap<Entity, PlayerQueue>,
}

impl UpdateQueue {
    pub(crate) fn push(
        &mut self,
        player: Entity,
        slot: UpdateSlot,
        packet: impl Into<messages::Packet>,
    ) {
        self.pending.entry(player).or_default().push(slot, packet.into());
    }

    /// Number of packets waiting for `player` this tick.
    pub fn pending_for(&self, player: Entity) -> usize {
        self.pending
            .get(&player)
            .map_or(0, |queue| queue.packets.len())
    }
}

fn flush_update_queue(
    mut queue: ResMut<UpdateQueue>,
    sender: Res<PacketSender>,
    players: Query<(), With<Player>>,
) {
    for (player, player_queue) in queue.pending.drain() {
        if player_queue.packets.is_empty() {
            continue;
        }
        // A viewer that disconnected between enqueue and flush is filtered here.
        if !players.contains(player) {
            warn!(
                "Dropping {} view updates queued for offline player {player}",
                player_queue.packets.len()
            );
            continue;
        }

        let bundle = messages::Bundle {
            packets: player_queue.packets,
        };
        sender.send(player, serialize_message(&bundle));
    }
}
