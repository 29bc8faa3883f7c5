//! A server-authoritative, client-side block view engine.
//!
//! Views are rectangular volumes of per-cell block overrides that exist only in packets: the
//! engine synthesises what each viewer's client should see, drives per-player block destruction
//! overlays, and never touches the authoritative world. The host embeds [`FacadePlugin`] into
//! its bevy `App`, inserts its own [`Blocks`](blocks::Blocks) table,
//! [`WorldSource`](world::WorldSource) and [`PacketSender`](dispatch::PacketSender), and drives
//! the engine through the [`BlockViews`](view::manager::BlockViews) system parameter.
//!
//! Nothing is persisted by design; a restart drops every view.

pub mod blocks;
pub mod data;
pub mod digging;
pub mod dispatch;
pub mod events;
pub mod players;
pub mod view;
pub mod world;

/// Wire messages the engine emits.
#[doc(inline)]
pub use facade_protocol as protocol;

use bevy::prelude::*;
use thiserror::Error;

/// Enables the whole view engine: view registry, destruction sessions, outbound batching and
/// player bookkeeping.
pub struct FacadePlugin;
impl Plugin for FacadePlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<EngineSettings>()
            .init_resource::<Time>()
            .init_resource::<blocks::Blocks>()
            .init_resource::<world::WorldSource>()
            .add_plugins((
                view::manager::ViewPlugin,
                digging::DiggingPlugin,
                dispatch::DispatchPlugin,
                players::PlayerPlugin,
            ));
    }
}

/// Engine tunables. Insert before [`FacadePlugin`] to override the defaults.
#[derive(Resource, Debug, Clone)]
pub struct EngineSettings {
    /// Milliseconds to break one hardness unit of block bare-handed.
    pub base_break_ms: f32,
    /// Seconds between overlay re-sends for paused destruction progress.
    pub dig_sync_interval: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_break_ms: 1500.0,
            dig_sync_interval: 60.0,
        }
    }
}

/// Failures surfaced by view operations. All of them are recovered by the caller, the engine
/// never unwinds across a tick. Send failures are not here: those are logged and swallowed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewError {
    #[error("coordinate is outside the view bounds")]
    OutOfBounds,
    #[error("the cell holds no override")]
    NoSuchBlock,
    #[error("the block data registry is out of ids")]
    CapacityExhausted,
    #[error("placeholder views cannot be registered or viewed")]
    IsPlaceholder,
    #[error("a view with the same id is already registered")]
    DuplicateView,
    #[error("no registered view with this id")]
    UnknownView,
    #[error("the dig session belongs to another player")]
    Unauthorized,
    #[error("an event subscriber cancelled the operation")]
    Cancelled,
}

pub mod prelude {
    pub use crate::blocks::{
        BlockConfig, BlockId, BlockPosition, BlockState, Blocks, ChunkColumn, Tool, WorldId, AIR,
    };
    pub use crate::data::{
        BlockDataRegistry, CustomBlockData, VanillaBlockData, ViewBlockData, ViewDataId, AIR_ID,
    };
    pub use crate::digging::{BreakSpeedModifiers, DigManager, DigRecord, DigSession, MAX_STAGE};
    pub use crate::dispatch::{PacketSender, PacketSink, UpdateQueue};
    pub use crate::events::{
        TriggerSource, ViewBlockBreakEvent, ViewBlockDigEvent, ViewBlockPlaceEvent,
        ViewBlockSetEvent, ViewCallbacks,
    };
    pub use crate::players::{
        BreakContext, CurrentWorld, LoadedChunks, MainHand, Player, PlayerEvent,
    };
    pub use crate::view::manager::{BlockViews, ViewManager};
    pub use crate::view::{
        Audience, AudienceMembers, BlockBreakMode, BlockPlacementMode, BlockView,
        BlockViewOptions, BlockViewType, UnmanagedBlockBehavior, ViewId,
    };
    pub use crate::world::{AuthoritativeWorld, WorldSource};
    pub use crate::{EngineSettings, FacadePlugin, ViewError};
}
