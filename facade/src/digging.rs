use std::collections::HashMap;

use bevy::prelude::*;
use rand::Rng as _;

use crate::blocks::{BlockPosition, Tool};
use crate::data::ViewBlockData;
use crate::players::BreakContext;
use crate::view::manager::BlockViews;
use crate::EngineSettings;

/// The highest crack overlay stage the client can draw. -1 clears the overlay.
pub const MAX_STAGE: i8 = 9;

pub struct DiggingPlugin;
impl Plugin for DiggingPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<BreakSpeedModifiers>()
            .add_systems(Startup, setup_overlay_sync)
            .add_systems(Update, (update_dig_sessions, sync_dig_overlays).chain());
    }
}

/// Scales the speed at which a tool breaks a view block. Modifiers run in registration order,
/// each seeing the previous one's output.
pub type BreakSpeedModifier =
    Box<dyn Fn(&ViewBlockData, Option<&Tool>, &BreakContext, f32) -> f32 + Send + Sync + 'static>;

#[derive(Resource, Default)]
pub struct BreakSpeedModifiers {
    modifiers: Vec<BreakSpeedModifier>,
}

impl BreakSpeedModifiers {
    pub fn register(
        &mut self,
        modifier: impl Fn(&ViewBlockData, Option<&Tool>, &BreakContext, f32) -> f32
            + Send
            + Sync
            + 'static,
    ) {
        self.modifiers.push(Box::new(modifier));
    }

    pub fn apply(
        &self,
        data: &ViewBlockData,
        tool: Option<&Tool>,
        context: &BreakContext,
        base_speed: f32,
    ) -> f32 {
        self.modifiers
            .iter()
            .fold(base_speed, |speed, modifier| modifier(data, tool, context, speed))
    }
}

/// The crack stage shown after `total_ms` of a `full_break_ms` dig. Ceiling rounding: stage 0
/// appears only at exactly zero progress.
pub(crate) fn stage_for(total_ms: u64, full_break_ms: u64) -> i8 {
    if full_break_ms == 0 {
        return MAX_STAGE;
    }
    let fraction = total_ms as f32 / full_break_ms as f32;
    (fraction * 9.0).ceil().min(MAX_STAGE as f32) as i8
}

/// A running timer for one player breaking one cell.
#[derive(Debug, Clone)]
pub struct DigSession {
    pub(crate) player: Entity,
    pub(crate) started_at_ms: u64,
    pub(crate) base_accumulated_ms: u64,
    pub(crate) full_break_ms: u64,
    pub(crate) speed_multiplier: f32,
    /// Stage of the last emitted overlay packet; updates are diff-only.
    pub(crate) last_stage: i8,
}

impl DigSession {
    pub(crate) fn total_ms(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.started_at_ms);
        self.base_accumulated_ms + (elapsed as f32 * self.speed_multiplier.max(0.0)) as u64
    }

    pub fn player(&self) -> Entity {
        self.player
    }

    pub fn full_break_ms(&self) -> u64 {
        self.full_break_ms
    }
}

/// The destruction state of one cell within a view.
#[derive(Debug)]
pub struct DigRecord {
    /// Synthetic entity carrying the overlay, negative and unique within the view.
    pub(crate) entity_id: i32,
    pub(crate) last_damager: Option<Entity>,
    pub(crate) session: Option<DigSession>,
    /// Progress carried across pauses of resumable blocks.
    pub(crate) accumulated_ms: u64,
    /// -1 while no overlay is shown for a paused cell.
    pub(crate) last_stage: i8,
}

impl DigRecord {
    pub(crate) fn new(entity_id: i32) -> Self {
        Self {
            entity_id,
            last_damager: None,
            session: None,
            accumulated_ms: 0,
            last_stage: -1,
        }
    }

    pub fn entity_id(&self) -> i32 {
        self.entity_id
    }

    pub fn last_damager(&self) -> Option<Entity> {
        self.last_damager
    }

    pub fn session(&self) -> Option<&DigSession> {
        self.session.as_ref()
    }

    pub fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms
    }

    pub fn last_stage(&self) -> i8 {
        self.last_stage
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }
}

/// Tracks partial destruction for the cells of one view. Owned by the view; dropping the view
/// drops every record with it.
#[derive(Debug, Default)]
pub struct DigManager {
    pub(crate) records: HashMap<BlockPosition, DigRecord>,
}

impl DigManager {
    /// Positions with destruction state, active or paused.
    pub fn positions(&self) -> impl Iterator<Item = &BlockPosition> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = (&BlockPosition, &DigRecord)> {
        self.records.iter()
    }

    pub fn record(&self, position: &BlockPosition) -> Option<&DigRecord> {
        self.records.get(position)
    }

    /// A fresh overlay entity id: negative, and not in use by any record of this view. Global
    /// uniqueness is not needed, the id space is per-client.
    pub(crate) fn new_entity_id(&self) -> i32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = -1 - rng.gen_range(0..i32::MAX);
            if !self.records.values().any(|record| record.entity_id == id) {
                return id;
            }
        }
    }

    /// Forcibly ends every session without callbacks. Used when the owning view closes.
    pub(crate) fn destroy_all(&mut self) {
        for record in self.records.values_mut() {
            record.session = None;
        }
    }
}

fn setup_overlay_sync(mut commands: Commands, settings: Res<EngineSettings>) {
    commands.insert_resource(OverlaySyncTimer(Timer::from_seconds(
        settings.dig_sync_interval,
        TimerMode::Repeating,
    )));
}

#[derive(Resource, Deref, DerefMut)]
struct OverlaySyncTimer(Timer);

fn update_dig_sessions(mut views: BlockViews) {
    views.tick_dig_sessions();
}

// Clients drop overlays on packet loss or chunk reloads; re-emitting the paused stages once a
// minute recovers them, and sweeps out records that no longer show anything.
fn sync_dig_overlays(
    time: Res<Time>,
    mut timer: ResMut<OverlaySyncTimer>,
    mut views: BlockViews,
) {
    timer.tick(time.delta());
    if timer.just_finished() {
        views.sync_dig_overlays();
    }
}
