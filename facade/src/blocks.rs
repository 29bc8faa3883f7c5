use std::{
    collections::{HashMap, HashSet},
    ops::{Add, AddAssign, Sub, SubAssign},
    path::Path,
};

use bevy::math::IVec3;
use bevy::prelude::*;
use serde::Deserialize;

pub use facade_protocol::BlockId;

/// Blocks per chunk edge.
pub const CHUNK_SIZE: usize = 16;

/// Air is always the first entry of the block table.
pub const AIR: BlockId = 0;

/// Opaque identifier of a world. The engine never interprets it, it only keys the spatial index
/// and send-time filtering with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldId(pub u64);

/// The configurations and ids of the blocks clients can be shown.
///
/// The host fills this in at startup, either from configuration files with [`Blocks::load`] or
/// directly with [`Blocks::new`]. Id 0 is always air.
#[derive(Resource, Debug)]
pub struct Blocks {
    // block id -> block config
    blocks: Vec<BlockConfig>,
    // block name -> block id
    ids: HashMap<String, BlockId>,
}

impl Default for Blocks {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Blocks {
    pub fn new(configs: Vec<BlockConfig>) -> Self {
        let mut blocks = Vec::with_capacity(configs.len() + 1);
        blocks.push(BlockConfig::air());
        for config in configs {
            if config.name == "air" {
                continue;
            }
            blocks.push(config);
        }

        let ids = blocks
            .iter()
            .enumerate()
            .map(|(id, config)| (config.name.clone(), id as BlockId))
            .collect();

        Self { blocks, ids }
    }

    /// Read every json block config below `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Self {
        fn walk_dir<P: AsRef<Path>>(dir: P) -> Vec<std::path::PathBuf> {
            let mut files = Vec::new();

            let directory = std::fs::read_dir(dir).expect(
                "Could not read files from block configuration directory, make sure it is present",
            );

            for entry in directory {
                let file_path = entry
                    .expect("Failed to read a path while loading the block configs")
                    .path();

                if file_path.is_dir() {
                    let sub_files = walk_dir(&file_path);
                    files.extend(sub_files);
                } else {
                    files.push(file_path);
                }
            }

            files
        }

        let mut configs = Vec::new();
        for file_path in walk_dir(dir) {
            let file = match std::fs::File::open(&file_path) {
                Ok(f) => f,
                Err(e) => panic!(
                    "Failed to open block config.\nPath: {}\nError: {}",
                    file_path.display(),
                    e
                ),
            };

            let config: BlockConfig = match serde_json::from_reader(file) {
                Ok(c) => c,
                Err(e) => panic!(
                    "Failed to read block config at path: '{}'\nError: {}",
                    file_path.display(),
                    e
                ),
            };

            configs.push(config);
        }

        Self::new(configs)
    }

    pub fn get_config(&self, block_id: &BlockId) -> &BlockConfig {
        return &self.blocks[*block_id as usize];
    }

    #[track_caller]
    pub fn get_id(&self, block_name: &str) -> BlockId {
        match self.ids.get(block_name) {
            Some(b) => *b,
            None => panic!("No block with name '{}'", block_name),
        }
    }

    pub fn contains_block(&self, block_name: &str) -> bool {
        return self.ids.contains_key(block_name);
    }

    pub fn asset_ids(&self) -> HashMap<String, BlockId> {
        return self.ids.clone();
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockConfig {
    /// Name of the block
    pub name: String,
    /// How long it takes to break the block in hardness units, None if the block should not be
    /// breakable. e.g. water, air
    #[serde(default)]
    pub hardness: Option<f32>,
    /// Which tool categories will break this block faster.
    #[serde(default)]
    pub tools: HashSet<String>,
    /// Extra state bits sent for the block when a view stores none itself.
    #[serde(default)]
    pub default_state: Option<u16>,
}

impl BlockConfig {
    fn air() -> Self {
        Self {
            name: "air".to_owned(),
            hardness: None,
            tools: HashSet::new(),
            default_state: None,
        }
    }

    pub fn is_preferred_tool(&self, tool: &Tool) -> bool {
        self.tools.contains(&tool.name)
    }
}

/// A held item that can speed up block breaking.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tool {
    /// Tool category, e.g. "pickaxe"
    pub name: String,
    /// Break speed factor against blocks the tool is preferred for.
    pub efficiency: f32,
}

/// Extra block state bits as the wire protocol understands them. Opaque to the engine, it only
/// forwards them.
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub struct BlockState(pub u16);

impl BlockState {
    pub fn new() -> Self {
        return Self(0);
    }

    pub fn as_u16(self) -> u16 {
        return self.0;
    }
}

#[derive(Component, Deref, DerefMut, Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BlockPosition(pub IVec3);

impl BlockPosition {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self(IVec3::new(x, y, z))
    }

    pub fn as_chunk_index(&self) -> usize {
        // Getting the last 4 bits will output 0->CHUNK_SIZE for both positive and negative
        // numbers because of two's complement.
        let position = self.0 & (CHUNK_SIZE - 1) as i32;
        return (position.x << 8 | position.z << 4 | position.y) as usize;
    }

    /// The minimum corner of the chunk containing this block.
    pub fn chunk_min(&self) -> IVec3 {
        // Removing bits_of(CHUNK_SIZE) - 1 is rounding down to nearest CHUNK_SIZE divisible.
        return self.0 & !(CHUNK_SIZE - 1) as i32;
    }
}

impl From<IVec3> for BlockPosition {
    fn from(value: IVec3) -> Self {
        Self(value)
    }
}

impl From<usize> for BlockPosition {
    fn from(index: usize) -> Self {
        assert!(index < CHUNK_SIZE.pow(3));
        const MASK: usize = CHUNK_SIZE - 1;
        BlockPosition(IVec3 {
            x: index as i32 >> 8,
            z: (index >> 4 & MASK) as i32,
            y: (index & MASK) as i32,
        })
    }
}

impl Add<BlockPosition> for BlockPosition {
    type Output = BlockPosition;

    fn add(self, rhs: BlockPosition) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Add<IVec3> for BlockPosition {
    type Output = BlockPosition;

    fn add(self, rhs: IVec3) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<IVec3> for BlockPosition {
    #[inline]
    fn add_assign(&mut self, rhs: IVec3) {
        self.0.add_assign(rhs);
    }
}

impl Sub<BlockPosition> for BlockPosition {
    type Output = BlockPosition;

    fn sub(self, rhs: BlockPosition) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Sub<IVec3> for BlockPosition {
    type Output = BlockPosition;

    fn sub(self, rhs: IVec3) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<IVec3> for BlockPosition {
    #[inline]
    fn sub_assign(&mut self, rhs: IVec3) {
        self.0.sub_assign(rhs);
    }
}

/// Spatial index key: the 16×16 column of blocks at (x, z) within a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkColumn {
    pub world: WorldId,
    pub x: i32,
    pub z: i32,
}

impl ChunkColumn {
    pub fn new(world: WorldId, x: i32, z: i32) -> Self {
        Self { world, x, z }
    }

    /// The column containing `position`.
    pub fn containing(world: WorldId, position: BlockPosition) -> Self {
        Self {
            world,
            // Arithmetic shift rounds towards negative infinity.
            x: position.x >> 4,
            z: position.z >> 4,
        }
    }
}
