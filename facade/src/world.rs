use std::sync::Arc;

use bevy::prelude::*;

use crate::blocks::{BlockId, BlockPosition, WorldId};

/// Authoritative block states, supplied by the host.
///
/// The engine only ever reads this, and only to restore what a client should see where no
/// override applies. It never writes through it.
pub trait AuthoritativeWorld: Send + Sync + 'static {
    /// The block at `position`, or None if its chunk is not loaded host-side.
    fn block(&self, world: WorldId, position: BlockPosition) -> Option<(BlockId, Option<u16>)>;
}

#[derive(Resource, Clone)]
pub struct WorldSource(pub Arc<dyn AuthoritativeWorld>);

impl Default for WorldSource {
    fn default() -> Self {
        Self(Arc::new(UnloadedWorld))
    }
}

impl WorldSource {
    pub fn new(world: impl AuthoritativeWorld) -> Self {
        Self(Arc::new(world))
    }

    pub fn block(&self, world: WorldId, position: BlockPosition) -> Option<(BlockId, Option<u16>)> {
        self.0.block(world, position)
    }
}

/// Stand-in source that reports every chunk as unloaded.
#[derive(Debug)]
pub struct UnloadedWorld;

impl AuthoritativeWorld for UnloadedWorld {
    fn block(&self, _world: WorldId, _position: BlockPosition) -> Option<(BlockId, Option<u16>)> {
        None
    }
}
