use bevy::prelude::*;

use crate::blocks::BlockPosition;
use crate::data::ViewBlockData;
use crate::digging::MAX_STAGE;
use crate::view::ViewId;

/// The cause of a view block break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Player,
    Effect,
    Command,
    Script,
}

impl TriggerSource {
    pub fn is_player(self) -> bool {
        self == TriggerSource::Player
    }

    pub fn is_effect(self) -> bool {
        self == TriggerSource::Effect
    }
}

/// An override was written into a view. Informational, cannot be cancelled.
#[derive(Debug)]
pub struct ViewBlockSetEvent {
    pub view: ViewId,
    pub position: BlockPosition,
    pub data: ViewBlockData,
}

/// A view block is about to break. Cancelling keeps the cell as it is and rolls the breaking
/// player's client back.
#[derive(Debug)]
pub struct ViewBlockBreakEvent {
    pub view: ViewId,
    pub player: Entity,
    pub position: BlockPosition,
    /// The state of the cell before the break.
    pub original: ViewBlockData,
    /// The state the cell takes after the break. Subscribers may rewrite it.
    pub output: ViewBlockData,
    pub trigger_source: Option<TriggerSource>,
    pub cancelled: bool,
}

impl ViewBlockBreakEvent {
    /// An absent trigger counts as a player action.
    pub fn is_player_triggered(&self) -> bool {
        self.trigger_source.map_or(true, TriggerSource::is_player)
    }
}

/// A block is about to be placed into a view. Cancelling keeps the cell as it is.
#[derive(Debug)]
pub struct ViewBlockPlaceEvent {
    pub view: ViewId,
    pub player: Entity,
    pub position: BlockPosition,
    /// What is being placed. Subscribers may rewrite it.
    pub data: ViewBlockData,
    /// The view block the placement happened against, if it was one.
    pub placed_against: Option<ViewBlockData>,
    pub cancelled: bool,
}

/// A destruction overlay is about to move to a new stage. Subscribers may rewrite the stage;
/// it is clamped to -1..=9 after dispatch.
#[derive(Debug)]
pub struct ViewBlockDigEvent {
    pub view: ViewId,
    pub player: Entity,
    pub position: BlockPosition,
    pub data: ViewBlockData,
    pub stage: i8,
}

type Handler<E> = Box<dyn Fn(&mut E) + Send + Sync + 'static>;

/// Subscribers to the view events, run synchronously in registration order. A subscriber that
/// cancels an event halts propagation and prevents the state commit.
#[derive(Resource, Default)]
pub struct ViewCallbacks {
    block_set: Vec<Handler<ViewBlockSetEvent>>,
    block_break: Vec<Handler<ViewBlockBreakEvent>>,
    block_place: Vec<Handler<ViewBlockPlaceEvent>>,
    block_dig: Vec<Handler<ViewBlockDigEvent>>,
}

impl ViewCallbacks {
    pub fn on_block_set(&mut self, handler: impl Fn(&mut ViewBlockSetEvent) + Send + Sync + 'static) {
        self.block_set.push(Box::new(handler));
    }

    pub fn on_block_break(
        &mut self,
        handler: impl Fn(&mut ViewBlockBreakEvent) + Send + Sync + 'static,
    ) {
        self.block_break.push(Box::new(handler));
    }

    pub fn on_block_place(
        &mut self,
        handler: impl Fn(&mut ViewBlockPlaceEvent) + Send + Sync + 'static,
    ) {
        self.block_place.push(Box::new(handler));
    }

    pub fn on_block_dig(&mut self, handler: impl Fn(&mut ViewBlockDigEvent) + Send + Sync + 'static) {
        self.block_dig.push(Box::new(handler));
    }

    pub(crate) fn dispatch_block_set(&self, event: &mut ViewBlockSetEvent) {
        for handler in &self.block_set {
            handler(event);
        }
    }

    pub(crate) fn dispatch_block_break(&self, event: &mut ViewBlockBreakEvent) {
        for handler in &self.block_break {
            handler(event);
            if event.cancelled {
                break;
            }
        }
    }

    pub(crate) fn dispatch_block_place(&self, event: &mut ViewBlockPlaceEvent) {
        for handler in &self.block_place {
            handler(event);
            if event.cancelled {
                break;
            }
        }
    }

    pub(crate) fn dispatch_block_dig(&self, event: &mut ViewBlockDigEvent) {
        for handler in &self.block_dig {
            handler(event);
        }
        event.stage = event.stage.clamp(-1, MAX_STAGE);
    }
}
