use std::collections::HashMap;

use crate::blocks::{BlockId, BlockState, Blocks, Tool, AIR};
use crate::ViewError;

/// Identifier of an interned [`ViewBlockData`] within one registry.
pub type ViewDataId = i16;

/// The predefined id for air overrides.
pub const AIR_ID: ViewDataId = -1;

/// A single overridden block as a viewer should perceive it.
///
/// Values are considered equal when their [serialization](Self::serialize) is equal; block data
/// is ephemeral, so identity goes through the canonical string rather than structural equality
/// of whatever produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewBlockData {
    /// A block from the game's block table, drawn exactly as the table describes it.
    Vanilla(VanillaBlockData),
    /// A block with its own break behaviour, drawn as an arbitrary wire state.
    Custom(CustomBlockData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VanillaBlockData {
    pub block_id: BlockId,
    /// Extra state bits, None for the block's default state.
    pub state: Option<BlockState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomBlockData {
    /// What the client is shown.
    pub wire_id: BlockId,
    pub wire_state: Option<BlockState>,
    /// Time to break in hardness units, None for unbreakable.
    pub hardness: Option<f32>,
    /// Whether destruction progress survives cancellation.
    pub resumable: bool,
    /// Tool categories that count as preferred; empty means every tool does.
    pub harvested_by: Vec<String>,
}

impl ViewBlockData {
    pub const AIR: ViewBlockData = ViewBlockData::Vanilla(VanillaBlockData {
        block_id: AIR,
        state: None,
    });

    pub fn vanilla(block_id: BlockId) -> Self {
        Self::Vanilla(VanillaBlockData {
            block_id,
            state: None,
        })
    }

    /// The canonical string identity of this value, used as the registry key.
    pub fn serialize(&self) -> String {
        match self {
            Self::Vanilla(vanilla) => {
                format!(
                    "vanilla:{}#{}",
                    vanilla.block_id,
                    vanilla.state.map_or(-1, |state| state.as_u16() as i32)
                )
            }
            Self::Custom(custom) => {
                let mut tools = custom.harvested_by.clone();
                tools.sort_unstable();
                format!(
                    "custom:{}#{}:h{}:r{}:t{}",
                    custom.wire_id,
                    custom.wire_state.map_or(-1, |state| state.as_u16() as i32),
                    custom.hardness.map_or(u32::MAX, f32::to_bits),
                    custom.resumable,
                    tools.join("+"),
                )
            }
        }
    }

    /// Time to break in hardness units, None for unbreakable blocks.
    pub fn hardness(&self, blocks: &Blocks) -> Option<f32> {
        match self {
            Self::Vanilla(vanilla) => blocks.get_config(&vanilla.block_id).hardness,
            Self::Custom(custom) => custom.hardness,
        }
    }

    /// Whether destruction progress survives a cancelled dig.
    pub fn resumable(&self) -> bool {
        match self {
            Self::Vanilla(_) => false,
            Self::Custom(custom) => custom.resumable,
        }
    }

    pub fn is_preferred_tool(&self, tool: &Tool, blocks: &Blocks) -> bool {
        match self {
            Self::Vanilla(vanilla) => blocks.get_config(&vanilla.block_id).is_preferred_tool(tool),
            Self::Custom(custom) => {
                custom.harvested_by.is_empty() || custom.harvested_by.contains(&tool.name)
            }
        }
    }

    /// What goes over the wire for this block.
    pub fn wire_state(&self, blocks: &Blocks) -> (BlockId, Option<u16>) {
        match self {
            Self::Vanilla(vanilla) => (
                vanilla.block_id,
                vanilla
                    .state
                    .map(BlockState::as_u16)
                    .or(blocks.get_config(&vanilla.block_id).default_state),
            ),
            Self::Custom(custom) => (custom.wire_id, custom.wire_state.map(BlockState::as_u16)),
        }
    }

    pub fn is_air(&self) -> bool {
        matches!(
            self,
            Self::Vanilla(VanillaBlockData {
                block_id: AIR,
                ..
            })
        )
    }
}

/// Interns [`ViewBlockData`] values to compact ids so views can store one i16 per cell.
///
/// Append-only between [`clear`](Self::clear) calls. [`AIR_ID`] is pre-bound; everything else is
/// assigned monotonically from 0, failing once the id space runs out.
#[derive(Debug, Clone)]
pub struct BlockDataRegistry {
    ids: HashMap<String, ViewDataId>,
    data: HashMap<ViewDataId, ViewBlockData>,
    next_id: ViewDataId,
}

impl Default for BlockDataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDataRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            ids: HashMap::new(),
            data: HashMap::new(),
            next_id: 0,
        };
        registry.bind_air();
        registry
    }

    fn bind_air(&mut self) {
        self.ids.insert(ViewBlockData::AIR.serialize(), AIR_ID);
        self.data.insert(AIR_ID, ViewBlockData::AIR);
    }

    /// The id bound to `data`'s serialization, assigning the next free one if it has none yet.
    pub fn intern(&mut self, data: &ViewBlockData) -> Result<ViewDataId, ViewError> {
        let key = data.serialize();

        if let Some(id) = self.ids.get(&key) {
            return Ok(*id);
        }
        if self.next_id == ViewDataId::MAX {
            return Err(ViewError::CapacityExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;

        self.ids.insert(key, id);
        self.data.insert(id, data.clone());

        Ok(id)
    }

    pub fn lookup(&self, id: ViewDataId) -> Option<&ViewBlockData> {
        self.data.get(&id)
    }

    /// Drops every mapping and re-binds air. Invalidates all previously assigned ids.
    pub fn clear(&mut self) {
        self.ids.clear();
        self.data.clear();
        self.next_id = 0;
        self.bind_air();
    }

    /// Distinct serializations interned, the reserved air entry included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
