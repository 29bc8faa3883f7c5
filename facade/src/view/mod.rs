use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use bevy::math::{IVec3, UVec3};
use bevy::prelude::*;

use crate::blocks::{BlockPosition, ChunkColumn, WorldId};
use crate::data::{BlockDataRegistry, ViewBlockData, ViewDataId};
use crate::digging::DigManager;
use crate::ViewError;

pub mod manager;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a [`BlockView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl ViewId {
    pub(crate) fn next() -> Self {
        Self(NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockViewType {
    /// Short-lived view, dropped wholesale when its purpose passes.
    Transient,
    /// Long-lived view kept registered for the lifetime of the process.
    Persistent,
    /// Marker for a view still under construction. The manager rejects it everywhere.
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockBreakMode {
    #[default]
    Enabled,
    Disabled,
    /// Only blocks placed by players at runtime may be broken.
    NewOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockPlacementMode {
    #[default]
    Enabled,
    Disabled,
}

/// What happens when players interact with in-bounds cells that hold no override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmanagedBlockBehavior {
    /// The interaction falls through to the authoritative world.
    Allow,
    /// The interaction is cancelled; clients never get to act on authoritative blocks inside
    /// the view.
    #[default]
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockViewOptions {
    pub break_mode: BlockBreakMode,
    pub placement_mode: BlockPlacementMode,
    pub unmanaged_block_behavior: UnmanagedBlockBehavior,
}

/// A packet recipient: a single player, or a group entity whose [`AudienceMembers`] resolve to
/// players, possibly through nested groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Player(Entity),
    Group(Entity),
}

/// Members of a group audience. Entries may be player entities or further group entities.
#[derive(Component, Default, Deref, DerefMut)]
pub struct AudienceMembers(pub HashSet<Entity>);

/// A rectangular, world-anchored volume of client-side block overrides.
///
/// Overrides are stored per relative cell as ids interned in the view's own
/// [`BlockDataRegistry`]; absent cells mean "no override", which is distinct from an explicit
/// air override. The underlying world is never touched.
pub struct BlockView {
    id: ViewId,
    world: WorldId,
    origin: BlockPosition,
    dimensions: UVec3,
    view_type: BlockViewType,
    options: BlockViewOptions,
    owner: Option<Entity>,
    pub(crate) registry: BlockDataRegistry,
    // Relative position -> interned id.
    pub(crate) overrides: HashMap<BlockPosition, ViewDataId>,
    // Cells written through place_block, for BlockBreakMode::NewOnly.
    pub(crate) player_placed: HashSet<BlockPosition>,
    pub(crate) audiences: HashSet<Audience>,
    pub(crate) dig: DigManager,
}

impl BlockView {
    pub fn new(
        world: WorldId,
        origin: BlockPosition,
        dimensions: UVec3,
        view_type: BlockViewType,
        options: BlockViewOptions,
    ) -> Self {
        Self {
            id: ViewId::next(),
            world,
            origin,
            dimensions,
            view_type,
            options,
            owner: None,
            registry: BlockDataRegistry::new(),
            overrides: HashMap::new(),
            player_placed: HashSet::new(),
            audiences: HashSet::new(),
            dig: DigManager::default(),
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    pub fn origin(&self) -> BlockPosition {
        self.origin
    }

    pub fn dimensions(&self) -> UVec3 {
        self.dimensions
    }

    pub fn view_type(&self) -> BlockViewType {
        self.view_type
    }

    pub fn options(&self) -> BlockViewOptions {
        self.options
    }

    pub fn owner(&self) -> Option<Entity> {
        self.owner
    }

    /// Owner is informational only, nothing in the engine keys off it.
    pub fn set_owner(&mut self, owner: Option<Entity>) {
        self.owner = owner;
    }

    pub fn registry(&self) -> &BlockDataRegistry {
        &self.registry
    }

    pub fn audiences(&self) -> impl Iterator<Item = &Audience> {
        self.audiences.iter()
    }

    pub fn dig_manager(&self) -> &DigManager {
        &self.dig
    }

    pub fn check_bounds(&self, position: BlockPosition) -> Result<(), ViewError> {
        if self.is_inside(position) {
            Ok(())
        } else {
            Err(ViewError::OutOfBounds)
        }
    }

    /// Half-open on every axis: the origin corner is inside, origin + dimensions is not.
    pub fn is_inside(&self, position: BlockPosition) -> bool {
        let min = self.origin.0;
        let max = min + self.dimensions.as_ivec3();
        position.cmpge(min).all() && position.cmplt(max).all()
    }

    pub fn relative_position(&self, position: BlockPosition) -> BlockPosition {
        position - self.origin
    }

    pub fn world_position(&self, relative: BlockPosition) -> BlockPosition {
        self.origin + relative
    }

    /// The override at `position`, if the cell holds one.
    pub fn get(&self, position: BlockPosition) -> Option<&ViewBlockData> {
        if !self.is_inside(position) {
            return None;
        }
        let id = self.overrides.get(&self.relative_position(position))?;
        self.registry.lookup(*id)
    }

    /// Whether the cell holds an override.
    pub fn is_managed(&self, position: BlockPosition) -> bool {
        self.is_inside(position)
            && self
                .overrides
                .contains_key(&self.relative_position(position))
    }

    /// Whether the cell is inside the view but shows the authoritative world.
    pub fn is_original_content(&self, position: BlockPosition) -> bool {
        self.is_inside(position)
            && !self
                .overrides
                .contains_key(&self.relative_position(position))
    }

    /// Whether a player interaction with this cell should be cancelled because the cell shows
    /// authoritative content the view wants to keep inert.
    pub fn cancels_unmanaged_interaction(&self, position: BlockPosition) -> bool {
        self.options.unmanaged_block_behavior == UnmanagedBlockBehavior::Cancel
            && self.is_original_content(position)
    }

    /// Writes the override without telling anyone. Packet and event emitting writes go through
    /// [`BlockViews`](manager::BlockViews).
    pub(crate) fn set_raw(
        &mut self,
        position: BlockPosition,
        data: &ViewBlockData,
    ) -> Result<ViewDataId, ViewError> {
        self.check_bounds(position)?;
        let id = self.registry.intern(data)?;
        let relative = self.relative_position(position);
        self.overrides.insert(relative, id);
        self.player_placed.remove(&relative);
        Ok(id)
    }

    /// All managed blocks within `radius` of `center`, spherically measured.
    pub fn nearby_blocks(
        &self,
        center: BlockPosition,
        radius: i32,
    ) -> HashMap<BlockPosition, ViewBlockData> {
        let mut data = HashMap::new();
        let radius_squared = (radius * radius) as f64;

        for x in -radius..=radius {
            for y in -radius..=radius {
                for z in -radius..=radius {
                    let position = center + IVec3::new(x, y, z);
                    if !self.is_managed(position) {
                        continue;
                    }
                    let delta = (position - center).as_dvec3();
                    if delta.length_squared() > radius_squared {
                        continue;
                    }
                    if let Some(block) = self.get(position) {
                        data.insert(position, block.clone());
                    }
                }
            }
        }
        data
    }

    /// Every position of the bounding box, in world coordinates.
    pub fn positions(&self) -> impl Iterator<Item = BlockPosition> + '_ {
        let origin = self.origin;
        let dimensions = self.dimensions;
        (0..dimensions.x as i32).flat_map(move |x| {
            (0..dimensions.y as i32).flat_map(move |y| {
                (0..dimensions.z as i32).map(move |z| origin + IVec3::new(x, y, z))
            })
        })
    }

    /// World positions of every cell holding an override.
    pub fn overridden_positions(&self) -> impl Iterator<Item = BlockPosition> + '_ {
        self.overrides.keys().map(|relative| self.origin + *relative)
    }

    /// Every chunk column the bounding box overlaps.
    pub fn chunk_columns(&self) -> impl Iterator<Item = ChunkColumn> + '_ {
        let world = self.world;
        let (min_x, max_x, min_z, max_z) = if self.dimensions.x == 0
            || self.dimensions.y == 0
            || self.dimensions.z == 0
        {
            (0, -1, 0, -1)
        } else {
            (
                self.origin.x >> 4,
                (self.origin.x + self.dimensions.x as i32 - 1) >> 4,
                self.origin.z >> 4,
                (self.origin.z + self.dimensions.z as i32 - 1) >> 4,
            )
        };

        (min_x..=max_x)
            .flat_map(move |x| (min_z..=max_z).map(move |z| ChunkColumn::new(world, x, z)))
    }

    /// A detached copy with the same override contents, anchored at `new_origin`. The copy has a
    /// fresh id, no audiences and no destruction state.
    pub fn copy(&self, new_origin: BlockPosition, view_type: BlockViewType) -> BlockView {
        BlockView {
            id: ViewId::next(),
            world: self.world,
            origin: new_origin,
            dimensions: self.dimensions,
            view_type,
            options: self.options,
            owner: self.owner,
            registry: self.registry.clone(),
            overrides: self.overrides.clone(),
            player_placed: self.player_placed.clone(),
            audiences: HashSet::new(),
            dig: DigManager::default(),
        }
    }
}
