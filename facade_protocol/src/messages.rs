use bevy::math::IVec3;

use serde::{Deserialize, Serialize};

use crate::{BlockId, ClientBound, MessageType};

/// Change a single block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    /// The position of the block that is to be changed.
    pub position: IVec3,
    pub block_id: BlockId,
    pub block_state: Option<u16>,
}

impl ClientBound for BlockChange {
    const TYPE: MessageType = MessageType::BlockChange;
}

/// Change individual blocks within one chunk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockUpdates {
    /// The minimum corner of the chunk that is to be changed.
    pub chunk_position: IVec3,
    /// A list of blocks to update, indexed within the chunk.
    pub blocks: Vec<(usize, BlockId, Option<u16>)>,
}

impl ClientBound for BlockUpdates {
    const TYPE: MessageType = MessageType::BlockUpdates;
}

/// Draw or clear the crack overlay of a block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockDestructionStage {
    /// The synthetic entity the overlay is attached to.
    pub entity_id: i32,
    pub position: IVec3,
    /// -1 clears the overlay, 0..=9 draws the cracks.
    pub stage: i8,
}

impl ClientBound for BlockDestructionStage {
    const TYPE: MessageType = MessageType::BlockDestructionStage;
}

/// Spawn the synthetic entity that carries a block's destruction overlay.
///
/// The id is drawn from the negative half of the entity id space so it can never collide with a
/// real entity the client tracks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpawnBlockEntity {
    pub entity_id: i32,
    pub position: IVec3,
}

impl ClientBound for SpawnBlockEntity {
    const TYPE: MessageType = MessageType::SpawnBlockEntity;
}

/// Remove a synthetic block entity together with any overlay attached to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoveBlockEntity {
    pub entity_id: i32,
}

impl ClientBound for RemoveBlockEntity {
    const TYPE: MessageType = MessageType::RemoveBlockEntity;
}

/// Play the break particle effect of a block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockBreakEffect {
    pub position: IVec3,
    /// The block the particles are sampled from.
    pub block_id: BlockId,
    pub block_state: Option<u16>,
}

impl ClientBound for BlockBreakEffect {
    const TYPE: MessageType = MessageType::BlockBreakEffect;
}

/// Everything sent to one client in one tick, delivered as a single frame so the client applies
/// it atomically.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Bundle {
    pub packets: Vec<Packet>,
}

impl ClientBound for Bundle {
    const TYPE: MessageType = MessageType::Bundle;
}

/// A message that can ride inside a [`Bundle`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    BlockChange(BlockChange),
    BlockUpdates(BlockUpdates),
    BlockDestructionStage(BlockDestructionStage),
    SpawnBlockEntity(SpawnBlockEntity),
    RemoveBlockEntity(RemoveBlockEntity),
    BlockBreakEffect(BlockBreakEffect),
}

impl From<BlockChange> for Packet {
    fn from(message: BlockChange) -> Self {
        Self::BlockChange(message)
    }
}

impl From<BlockUpdates> for Packet {
    fn from(message: BlockUpdates) -> Self {
        Self::BlockUpdates(message)
    }
}

impl From<BlockDestructionStage> for Packet {
    fn from(message: BlockDestructionStage) -> Self {
        Self::BlockDestructionStage(message)
    }
}

impl From<SpawnBlockEntity> for Packet {
    fn from(message: SpawnBlockEntity) -> Self {
        Self::SpawnBlockEntity(message)
    }
}

impl From<RemoveBlockEntity> for Packet {
    fn from(message: RemoveBlockEntity) -> Self {
        Self::RemoveBlockEntity(message)
    }
}

impl From<BlockBreakEffect> for Packet {
    fn from(message: BlockBreakEffect) -> Self {
        Self::BlockBreakEffect(message)
    }
}
