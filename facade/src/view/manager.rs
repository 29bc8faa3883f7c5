use std::collections::{HashMap, HashSet};

use bevy::ecs::system::SystemParam;
use bevy::math::IVec3;
use bevy::prelude::*;

use facade_protocol::messages;

use crate::blocks::{BlockId, BlockPosition, Blocks, ChunkColumn, WorldId, AIR};
use crate::data::ViewBlockData;
use crate::digging::{stage_for, BreakSpeedModifiers, DigRecord, DigSession, MAX_STAGE};
use crate::dispatch::{UpdateQueue, UpdateSlot};
use crate::events::{
    TriggerSource, ViewBlockBreakEvent, ViewBlockDigEvent, ViewBlockPlaceEvent, ViewBlockSetEvent,
    ViewCallbacks,
};
use crate::players::{BreakContext, CurrentWorld, LoadedChunks, MainHand, Player};
use crate::view::{
    Audience, AudienceMembers, BlockBreakMode, BlockPlacementMode, BlockView, BlockViewType,
    UnmanagedBlockBehavior, ViewId,
};
use crate::world::WorldSource;
use crate::{EngineSettings, ViewError};

pub struct ViewPlugin;
impl Plugin for ViewPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<ViewManager>()
            .init_resource::<ViewCallbacks>();
    }
}

/// Registry of every active view: which chunk columns they overlap and which players can see
/// them.
///
/// Lives for the whole core lifetime. Lookups are cheap intersections; writes happen on the
/// game-tick domain only.
#[derive(Resource, Default)]
pub struct ViewManager {
    pub(crate) views: HashMap<ViewId, BlockView>,
    pub(crate) chunk_index: HashMap<ChunkColumn, HashSet<ViewId>>,
    pub(crate) player_visibility: HashMap<Entity, HashSet<ViewId>>,
}

impl ViewManager {
    /// Indexes the view under every chunk column its bounding box overlaps.
    pub fn register(&mut self, view: BlockView) -> Result<ViewId, ViewError> {
        if view.view_type() == BlockViewType::Placeholder {
            return Err(ViewError::IsPlaceholder);
        }
        if self.views.contains_key(&view.id()) {
            return Err(ViewError::DuplicateView);
        }

        let id = view.id();
        for column in view.chunk_columns() {
            self.chunk_index.entry(column).or_default().insert(id);
        }
        self.views.insert(id, view);

        Ok(id)
    }

    /// Removes the view from every index and hands it back. Active dig sessions are destroyed
    /// without callbacks. Audiences are not reset, callers decide what the clients should keep
    /// seeing.
    pub fn unregister(&mut self, view_id: ViewId) -> Result<BlockView, ViewError> {
        let mut view = self.views.remove(&view_id).ok_or(ViewError::UnknownView)?;

        for column in view.chunk_columns() {
            if let Some(ids) = self.chunk_index.get_mut(&column) {
                ids.remove(&view_id);
                if ids.is_empty() {
                    self.chunk_index.remove(&column);
                }
            }
        }
        self.player_visibility.retain(|_, views| {
            views.remove(&view_id);
            !views.is_empty()
        });

        view.dig.destroy_all();

        Ok(view)
    }

    pub fn is_registered(&self, view_id: ViewId) -> bool {
        self.views.contains_key(&view_id)
    }

    pub fn view(&self, view_id: ViewId) -> Option<&BlockView> {
        self.views.get(&view_id)
    }

    pub fn views(&self) -> impl Iterator<Item = &BlockView> {
        self.views.values()
    }

    pub fn views_in_chunk(&self, column: ChunkColumn) -> impl Iterator<Item = &BlockView> {
        self.chunk_index
            .get(&column)
            .into_iter()
            .flatten()
            .filter_map(|id| self.views.get(id))
    }

    pub fn views_in_chunk_for_player(
        &self,
        player: Entity,
        column: ChunkColumn,
    ) -> impl Iterator<Item = &BlockView> {
        let visible = self.player_visibility.get(&player);
        self.views_in_chunk(column)
            .filter(move |view| visible.is_some_and(|views| views.contains(&view.id())))
    }

    pub fn views_containing_block(
        &self,
        world: WorldId,
        position: BlockPosition,
    ) -> impl Iterator<Item = &BlockView> {
        self.views_in_chunk(ChunkColumn::containing(world, position))
            .filter(move |view| view.world() == world && view.is_inside(position))
    }

    pub fn views_visible_to_player(&self, player: Entity) -> impl Iterator<Item = &BlockView> {
        self.player_visibility
            .get(&player)
            .into_iter()
            .flatten()
            .filter_map(|id| self.views.get(id))
    }

    pub fn views_visible_to_player_containing_block(
        &self,
        player: Entity,
        world: WorldId,
        position: BlockPosition,
    ) -> impl Iterator<Item = &BlockView> {
        let visible = self.player_visibility.get(&player);
        self.views_containing_block(world, position)
            .filter(move |view| visible.is_some_and(|views| views.contains(&view.id())))
    }
}

/// What a bulk section send carries for each cell.
#[derive(Clone, Copy)]
enum SectionContent {
    /// The view's overrides.
    Overrides,
    /// The authoritative world, restoring what the client would see without the view.
    Authoritative,
}

/// Every view operation that talks to clients or fires callbacks. Systems take this instead of
/// juggling the underlying resources; reads that touch nothing client-facing live on
/// [`ViewManager`] and are reachable through [`Self::manager`].
#[derive(SystemParam)]
pub struct BlockViews<'w, 's> {
    manager: ResMut<'w, ViewManager>,
    queue: ResMut<'w, UpdateQueue>,
    loaded: ResMut<'w, LoadedChunks>,
    callbacks: Res<'w, ViewCallbacks>,
    blocks: Res<'w, Blocks>,
    world_source: Res<'w, WorldSource>,
    modifiers: Res<'w, BreakSpeedModifiers>,
    settings: Res<'w, EngineSettings>,
    time: Res<'w, Time>,
    players: Query<
        'w,
        's,
        (
            &'static CurrentWorld,
            Option<&'static MainHand>,
            Option<&'static BreakContext>,
        ),
        With<Player>,
    >,
    groups: Query<'w, 's, &'static AudienceMembers>,
}

fn push_to(
    queue: &mut UpdateQueue,
    targets: &[Entity],
    slot: UpdateSlot,
    packet: impl Into<messages::Packet>,
) {
    let packet = packet.into();
    for player in targets {
        queue.push(*player, slot, packet.clone());
    }
}

fn overlay_replay(
    view: &BlockView,
    only_column: Option<(i32, i32)>,
) -> Vec<(i32, BlockPosition, i8)> {
    view.dig
        .records()
        .filter_map(|(position, record)| {
            if let Some((x, z)) = only_column {
                if position.x >> 4 != x || position.z >> 4 != z {
                    return None;
                }
            }
            let stage = record
                .session()
                .map_or(record.last_stage(), |session| session.last_stage);
            (stage >= 0).then_some((record.entity_id(), *position, stage))
        })
        .collect()
}

impl BlockViews<'_, '_> {
    pub fn manager(&self) -> &ViewManager {
        &self.manager
    }

    pub fn loaded_chunks(&self) -> &LoadedChunks {
        &self.loaded
    }

    pub fn loaded_chunks_mut(&mut self) -> &mut LoadedChunks {
        &mut self.loaded
    }

    pub fn register(&mut self, view: BlockView) -> Result<ViewId, ViewError> {
        self.manager.register(view)
    }

    pub fn unregister(&mut self, view_id: ViewId) -> Result<BlockView, ViewError> {
        self.manager.unregister(view_id)
    }

    pub fn view(&self, view_id: ViewId) -> Result<&BlockView, ViewError> {
        self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)
    }

    fn now_ms(&self) -> u64 {
        self.time.elapsed().as_millis() as u64
    }

    // --- audience resolution -------------------------------------------------------------

    fn collect_entity(
        &self,
        entity: Entity,
        world: WorldId,
        out: &mut Vec<Entity>,
        visited: &mut HashSet<Entity>,
    ) {
        if !visited.insert(entity) {
            return;
        }
        if let Ok((current_world, _, _)) = self.players.get(entity) {
            // Disconnected players despawn, so reaching here means online. Packets only make
            // sense for viewers in the view's world.
            if current_world.0 == world {
                out.push(entity);
            }
            return;
        }
        if let Ok(members) = self.groups.get(entity) {
            for member in members.iter() {
                self.collect_entity(*member, world, out, visited);
            }
            return;
        }
        debug!("Audience member {entity} is neither an online player nor a group, skipping");
    }

    /// The online players an audience resolves to, restricted to `world`.
    fn audience_players(&self, audience: &Audience, world: WorldId) -> Vec<Entity> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let (Audience::Player(entity) | Audience::Group(entity)) = audience;
        self.collect_entity(*entity, world, &mut out, &mut visited);
        out
    }

    /// The flattened set of online players currently viewing `view`.
    fn viewers_of(&self, view: &BlockView) -> Vec<Entity> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        for audience in &view.audiences {
            let (Audience::Player(entity) | Audience::Group(entity)) = audience;
            self.collect_entity(*entity, view.world(), &mut out, &mut visited);
        }
        out
    }

    /// Viewers whose client has the chunk column loaded.
    fn viewers_seeing(&self, view: &BlockView, column: ChunkColumn) -> Vec<Entity> {
        let mut players = self.viewers_of(view);
        players.retain(|player| self.loaded.contains(*player, &column));
        players
    }

    // --- overrides -----------------------------------------------------------------------

    /// The override at `position` in the given view.
    pub fn get_block(
        &self,
        view_id: ViewId,
        position: BlockPosition,
    ) -> Result<Option<&ViewBlockData>, ViewError> {
        Ok(self.view(view_id)?.get(position))
    }

    /// Writes an override and shows it to every viewer that has the chunk loaded.
    pub fn set_block(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
        data: ViewBlockData,
        emit_event: bool,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        view.check_bounds(position)?;
        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);

        if emit_event {
            let mut event = ViewBlockSetEvent {
                view: view_id,
                position,
                data: data.clone(),
            };
            self.callbacks.dispatch_block_set(&mut event);
        }

        let view = self.manager.views.get_mut(&view_id).unwrap();
        view.set_raw(position, &data)?;

        let wire = data.wire_state(&self.blocks);
        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Block(position),
            messages::BlockChange {
                position: position.0,
                block_id: wire.0,
                block_state: wire.1,
            },
        );

        Ok(())
    }

    /// Batched form of [`Self::set_block`]: writes coalesce into one chunk update per affected
    /// chunk. Nothing commits if any position is out of bounds.
    pub fn set_blocks(
        &mut self,
        view_id: ViewId,
        blocks: HashMap<BlockPosition, ViewBlockData>,
        emit_events: bool,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        for position in blocks.keys() {
            view.check_bounds(*position)?;
        }
        let world = view.world();

        let mut column_targets: HashMap<ChunkColumn, Vec<Entity>> = HashMap::new();
        for position in blocks.keys() {
            let column = ChunkColumn::containing(world, *position);
            if !column_targets.contains_key(&column) {
                let targets = self.viewers_seeing(view, column);
                column_targets.insert(column, targets);
            }
        }

        if emit_events {
            for (position, data) in &blocks {
                let mut event = ViewBlockSetEvent {
                    view: view_id,
                    position: *position,
                    data: data.clone(),
                };
                self.callbacks.dispatch_block_set(&mut event);
            }
        }

        let mut chunk_cells: HashMap<IVec3, Vec<(usize, BlockId, Option<u16>)>> = HashMap::new();
        let view = self.manager.views.get_mut(&view_id).unwrap();
        for (position, data) in &blocks {
            view.set_raw(*position, data)?;
            let wire = data.wire_state(&self.blocks);
            chunk_cells
                .entry(position.chunk_min())
                .or_default()
                .push((position.as_chunk_index(), wire.0, wire.1));
        }

        for (chunk_position, cells) in chunk_cells {
            let column = ChunkColumn::new(world, chunk_position.x >> 4, chunk_position.z >> 4);
            let Some(targets) = column_targets.get(&column) else {
                continue;
            };
            push_to(
                &mut self.queue,
                targets,
                UpdateSlot::Chunk(chunk_position),
                messages::BlockUpdates {
                    chunk_position,
                    blocks: cells,
                },
            );
        }

        Ok(())
    }

    /// Breaks an overridden cell: cancellable event, then the event's output (air unless a
    /// subscriber rewrote it) replaces the override. Clears any destruction state of the cell.
    pub fn break_block(
        &mut self,
        view_id: ViewId,
        player: Entity,
        position: BlockPosition,
        play_animation: bool,
        emit_event: bool,
        trigger_source: Option<TriggerSource>,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        view.check_bounds(position)?;
        let Some(original) = view.get(position).cloned() else {
            return Err(ViewError::NoSuchBlock);
        };

        let player_triggered = trigger_source.map_or(true, TriggerSource::is_player);
        if player_triggered {
            match view.options().break_mode {
                BlockBreakMode::Enabled => {}
                BlockBreakMode::Disabled => return Err(ViewError::Cancelled),
                BlockBreakMode::NewOnly => {
                    let relative = view.relative_position(position);
                    if !view.player_placed.contains(&relative) {
                        return Err(ViewError::Cancelled);
                    }
                }
            }
        }

        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);

        let mut output = ViewBlockData::AIR;
        if emit_event {
            let mut event = ViewBlockBreakEvent {
                view: view_id,
                player,
                position,
                original: original.clone(),
                output,
                trigger_source,
                cancelled: false,
            };
            self.callbacks.dispatch_block_break(&mut event);
            if event.cancelled {
                // The breaking player's client already predicts the break; show them the truth
                // again.
                self.refresh_block_for(view_id, &Audience::Player(player), position)?;
                return Err(ViewError::Cancelled);
            }
            output = event.output;
        }

        let wire_original = original.wire_state(&self.blocks);
        let wire_output = output.wire_state(&self.blocks);

        let view = self.manager.views.get_mut(&view_id).unwrap();
        view.set_raw(position, &output)?;
        let removed_record = view.dig.records.remove(&position);

        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Block(position),
            messages::BlockChange {
                position: position.0,
                block_id: wire_output.0,
                block_state: wire_output.1,
            },
        );
        if play_animation {
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::Effect(position),
                messages::BlockBreakEffect {
                    position: position.0,
                    block_id: wire_original.0,
                    block_state: wire_original.1,
                },
            );
        }
        if let Some(record) = removed_record {
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::Stage(position),
                messages::BlockDestructionStage {
                    entity_id: record.entity_id(),
                    position: position.0,
                    stage: -1,
                },
            );
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::BlockEntity(record.entity_id()),
                messages::RemoveBlockEntity {
                    entity_id: record.entity_id(),
                },
            );
        }

        Ok(())
    }

    /// Places an override on behalf of a player. The cell is remembered as player-placed, which
    /// is what `BlockBreakMode::NewOnly` gates breaks on.
    pub fn place_block(
        &mut self,
        view_id: ViewId,
        player: Entity,
        position: BlockPosition,
        data: ViewBlockData,
        placed_against: Option<BlockPosition>,
        emit_event: bool,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        view.check_bounds(position)?;
        if view.options().placement_mode == BlockPlacementMode::Disabled {
            return Err(ViewError::Cancelled);
        }
        let placed_against = placed_against.and_then(|against| view.get(against).cloned());
        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);

        let mut data = data;
        if emit_event {
            let mut event = ViewBlockPlaceEvent {
                view: view_id,
                player,
                position,
                data,
                placed_against,
                cancelled: false,
            };
            self.callbacks.dispatch_block_place(&mut event);
            if event.cancelled {
                self.refresh_block_for(view_id, &Audience::Player(player), position)?;
                return Err(ViewError::Cancelled);
            }
            data = event.data;
        }

        let wire = data.wire_state(&self.blocks);
        let view = self.manager.views.get_mut(&view_id).unwrap();
        view.set_raw(position, &data)?;
        let relative = view.relative_position(position);
        view.player_placed.insert(relative);

        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Block(position),
            messages::BlockChange {
                position: position.0,
                block_id: wire.0,
                block_state: wire.1,
            },
        );

        Ok(())
    }

    /// Re-sends what the cell currently shows to every viewer seeing its chunk.
    pub fn refresh_block(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        view.check_bounds(position)?;
        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);
        self.refresh_to_targets(view_id, position, targets)
    }

    /// Re-sends what the cell currently shows, to one audience only.
    pub fn refresh_block_for(
        &mut self,
        view_id: ViewId,
        audience: &Audience,
        position: BlockPosition,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        view.check_bounds(position)?;
        let column = ChunkColumn::containing(view.world(), position);
        let mut targets = self.audience_players(audience, view.world());
        targets.retain(|player| self.loaded.contains(*player, &column));
        self.refresh_to_targets(view_id, position, targets)
    }

    fn refresh_to_targets(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
        targets: Vec<Entity>,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let wire = match view.get(position) {
            Some(data) => data.wire_state(&self.blocks),
            None => match self.world_source.block(view.world(), position) {
                Some(wire) => wire,
                None => {
                    warn!("Cannot refresh {position:?}, its chunk is not loaded host-side");
                    return Ok(());
                }
            },
        };
        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Block(position),
            messages::BlockChange {
                position: position.0,
                block_id: wire.0,
                block_state: wire.1,
            },
        );
        Ok(())
    }

    // --- bulk client sync ----------------------------------------------------------------

    /// Sends every override to the audience, one chunk update per occupied chunk, plus the
    /// current destruction overlays.
    pub fn apply(&mut self, view_id: ViewId, audience: &Audience) -> Result<(), ViewError> {
        self.sync_audience(view_id, audience, None, SectionContent::Overrides)
    }

    pub fn apply_chunk(
        &mut self,
        view_id: ViewId,
        audience: &Audience,
        chunk_x: i32,
        chunk_z: i32,
    ) -> Result<(), ViewError> {
        self.sync_audience(
            view_id,
            audience,
            Some((chunk_x, chunk_z)),
            SectionContent::Overrides,
        )
    }

    /// Restores the authoritative world for the audience, clearing the overlay client-side.
    pub fn reset(&mut self, view_id: ViewId, audience: &Audience) -> Result<(), ViewError> {
        self.sync_audience(view_id, audience, None, SectionContent::Authoritative)
    }

    pub fn reset_chunk(
        &mut self,
        view_id: ViewId,
        audience: &Audience,
        chunk_x: i32,
        chunk_z: i32,
    ) -> Result<(), ViewError> {
        self.sync_audience(
            view_id,
            audience,
            Some((chunk_x, chunk_z)),
            SectionContent::Authoritative,
        )
    }

    fn sync_audience(
        &mut self,
        view_id: ViewId,
        audience: &Audience,
        only_column: Option<(i32, i32)>,
        content: SectionContent,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let players = self.audience_players(audience, view.world());
        if players.is_empty() {
            return Ok(());
        }

        let sections = self.view_sections(view, only_column, content);
        let overlays = overlay_replay(view, only_column);

        for (chunk_position, cells) in sections {
            push_to(
                &mut self.queue,
                &players,
                UpdateSlot::Chunk(chunk_position),
                messages::BlockUpdates {
                    chunk_position,
                    blocks: cells,
                },
            );
        }
        for (entity_id, position, stage) in overlays {
            match content {
                SectionContent::Overrides => {
                    push_to(
                        &mut self.queue,
                        &players,
                        UpdateSlot::BlockEntity(entity_id),
                        messages::SpawnBlockEntity {
                            entity_id,
                            position: position.0,
                        },
                    );
                    push_to(
                        &mut self.queue,
                        &players,
                        UpdateSlot::Stage(position),
                        messages::BlockDestructionStage {
                            entity_id,
                            position: position.0,
                            stage,
                        },
                    );
                }
                SectionContent::Authoritative => {
                    push_to(
                        &mut self.queue,
                        &players,
                        UpdateSlot::Stage(position),
                        messages::BlockDestructionStage {
                            entity_id,
                            position: position.0,
                            stage: -1,
                        },
                    );
                    push_to(
                        &mut self.queue,
                        &players,
                        UpdateSlot::BlockEntity(entity_id),
                        messages::RemoveBlockEntity { entity_id },
                    );
                }
            }
        }

        Ok(())
    }

    fn view_sections(
        &self,
        view: &BlockView,
        only_column: Option<(i32, i32)>,
        content: SectionContent,
    ) -> HashMap<IVec3, Vec<(usize, BlockId, Option<u16>)>> {
        let mut sections: HashMap<IVec3, Vec<(usize, BlockId, Option<u16>)>> = HashMap::new();

        // With Cancel semantics the client must never see authoritative blocks inside the view,
        // so unmanaged cells go over the wire as explicit air. With Allow they are skipped.
        let fill_unmanaged =
            view.options().unmanaged_block_behavior == UnmanagedBlockBehavior::Cancel;
        let positions: Vec<BlockPosition> = if fill_unmanaged {
            view.positions().collect()
        } else {
            view.overridden_positions().collect()
        };

        for position in positions {
            if let Some((x, z)) = only_column {
                if position.x >> 4 != x || position.z >> 4 != z {
                    continue;
                }
            }
            let wire = match content {
                SectionContent::Overrides => match view.get(position) {
                    Some(data) => data.wire_state(&self.blocks),
                    None => (AIR, None),
                },
                SectionContent::Authoritative => self
                    .world_source
                    .block(view.world(), position)
                    .unwrap_or((AIR, None)),
            };
            sections
                .entry(position.chunk_min())
                .or_default()
                .push((position.as_chunk_index(), wire.0, wire.1));
        }

        sections
    }

    // --- audience membership -------------------------------------------------------------

    /// Adds an audience, syncing the overrides to it first when `apply` is set.
    pub fn add_audience(
        &mut self,
        view_id: ViewId,
        audience: Audience,
        apply: bool,
    ) -> Result<bool, ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        if view.view_type() == BlockViewType::Placeholder {
            return Err(ViewError::IsPlaceholder);
        }
        if apply {
            self.apply(view_id, &audience)?;
        }
        let view = self.manager.views.get_mut(&view_id).unwrap();
        Ok(view.audiences.insert(audience))
    }

    /// Removes an audience, restoring the authoritative world for it when `reset` is set.
    pub fn remove_audience(
        &mut self,
        view_id: ViewId,
        audience: &Audience,
        reset: bool,
    ) -> Result<bool, ViewError> {
        let view = self.manager.views.get_mut(&view_id).ok_or(ViewError::UnknownView)?;
        if !view.audiences.remove(audience) {
            return Ok(false);
        }
        if reset {
            self.reset(view_id, audience)?;
        }
        Ok(true)
    }

    /// Makes the view visible to the player: audience membership plus the visibility index.
    pub fn add_player_to_view(
        &mut self,
        player: Entity,
        view_id: ViewId,
    ) -> Result<(), ViewError> {
        self.add_audience(view_id, Audience::Player(player), true)?;
        self.manager
            .player_visibility
            .entry(player)
            .or_default()
            .insert(view_id);
        Ok(())
    }

    pub fn remove_player_from_view(
        &mut self,
        player: Entity,
        view_id: ViewId,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        if view.view_type() == BlockViewType::Placeholder {
            return Err(ViewError::IsPlaceholder);
        }
        self.remove_audience(view_id, &Audience::Player(player), true)?;
        if let Some(views) = self.manager.player_visibility.get_mut(&player) {
            views.remove(&view_id);
            if views.is_empty() {
                self.manager.player_visibility.remove(&player);
            }
        }
        Ok(())
    }

    /// Every view forgets the player: visibility, audience membership, loaded chunks. No resets
    /// are sent, the client is gone.
    pub(crate) fn forget_player(&mut self, player: Entity) {
        self.loaded.forget_player(player);
        self.manager.player_visibility.remove(&player);
        for view in self.manager.views.values_mut() {
            view.audiences.remove(&Audience::Player(player));
        }
    }

    // --- destruction ---------------------------------------------------------------------

    /// Emits a raw destruction-stage packet for the cell to every viewer seeing its chunk.
    /// Stage -1 clears the overlay.
    pub fn set_block_progress(
        &mut self,
        view_id: ViewId,
        entity_id: i32,
        position: BlockPosition,
        stage: i8,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let stage = stage.clamp(-1, MAX_STAGE);
        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);
        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Stage(position),
            messages::BlockDestructionStage {
                entity_id,
                position: position.0,
                stage,
            },
        );
        Ok(())
    }

    fn break_time_ms(&self, data: &ViewBlockData, player: Entity) -> Option<u64> {
        let hardness = data.hardness(&self.blocks)?;

        let default_context = BreakContext::default();
        let (tool, context) = match self.players.get(player) {
            Ok((_, main_hand, context)) => (
                main_hand.and_then(|hand| hand.0.as_ref()),
                context.unwrap_or(&default_context),
            ),
            Err(_) => (None, &default_context),
        };

        let mut speed = 1.0;
        if let Some(tool) = tool {
            if data.is_preferred_tool(tool, &self.blocks) {
                speed *= tool.efficiency;
            }
        }
        speed = self.modifiers.apply(data, tool, context, speed);
        speed *= context.speed_factor();

        if speed <= 0.0 {
            return None;
        }
        Some(((hardness.max(0.0) * self.settings.base_break_ms) / speed) as u64)
    }

    /// Starts a destruction session at the cell. Returns false when a session is already
    /// running there or the block is unbreakable.
    pub fn start_digging(
        &mut self,
        view_id: ViewId,
        player: Entity,
        position: BlockPosition,
        speed_multiplier: f32,
    ) -> Result<bool, ViewError> {
        let now = self.now_ms();

        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let Some(data) = view.get(position).cloned() else {
            return Err(ViewError::NoSuchBlock);
        };
        if view.dig.record(&position).is_some_and(DigRecord::is_active) {
            return Ok(false);
        }
        let Some(full_break_ms) = self.break_time_ms(&data, player) else {
            return Ok(false);
        };

        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);
        let base_accumulated_ms = view
            .dig
            .record(&position)
            .map_or(0, DigRecord::accumulated_ms);
        let is_new = view.dig.record(&position).is_none();

        // The overlay resumes at the carried progress, forced even if the stage is unchanged.
        let stage = stage_for(base_accumulated_ms, full_break_ms);
        let mut event = ViewBlockDigEvent {
            view: view_id,
            player,
            position,
            data,
            stage,
        };
        self.callbacks.dispatch_block_dig(&mut event);
        let stage = event.stage;

        let view = self.manager.views.get_mut(&view_id).unwrap();
        let entity_id = match view.dig.record(&position) {
            Some(record) => record.entity_id(),
            None => view.dig.new_entity_id(),
        };
        let record = view
            .dig
            .records
            .entry(position)
            .or_insert_with(|| DigRecord::new(entity_id));
        record.last_damager = Some(player);
        record.session = Some(DigSession {
            player,
            started_at_ms: now,
            base_accumulated_ms,
            full_break_ms,
            speed_multiplier,
            last_stage: stage,
        });

        if is_new {
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::BlockEntity(entity_id),
                messages::SpawnBlockEntity {
                    entity_id,
                    position: position.0,
                },
            );
        }
        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Stage(position),
            messages::BlockDestructionStage {
                entity_id,
                position: position.0,
                stage,
            },
        );

        Ok(true)
    }

    /// Cancels the player's session at the cell. Progress survives on resumable blocks, the
    /// overlay clears otherwise.
    pub fn cancel_digging(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
        player: Entity,
    ) -> Result<(), ViewError> {
        self.end_session(view_id, position, player, false)?;
        Ok(())
    }

    /// Completes the player's session at the cell and breaks the block.
    pub fn complete_digging(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
        player: Entity,
    ) -> Result<(), ViewError> {
        if self.end_session(view_id, position, player, true)? {
            self.break_block(view_id, player, position, true, true, None)?;
        }
        Ok(())
    }

    /// Ends the active session at the cell. Returns whether one actually ended; a session held
    /// by a different player is left alone with an error.
    fn end_session(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
        player: Entity,
        block_was_broken: bool,
    ) -> Result<bool, ViewError> {
        let now = self.now_ms();

        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let Some(record) = view.dig.record(&position) else {
            return Ok(false);
        };
        let Some(session) = record.session() else {
            return Ok(false);
        };
        if record.last_damager() != Some(player) {
            return Err(ViewError::Unauthorized);
        }

        let total_ms = session.total_ms(now);
        let last_stage = session.last_stage;
        let entity_id = record.entity_id();
        let resumable = view.get(position).is_some_and(ViewBlockData::resumable);
        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);

        let view = self.manager.views.get_mut(&view_id).unwrap();
        let record = view.dig.records.get_mut(&position).unwrap();
        record.session = None;

        if !block_was_broken && resumable && total_ms > 0 {
            record.last_stage = last_stage;
            record.accumulated_ms = record.accumulated_ms.max(total_ms);
        } else {
            view.dig.records.remove(&position);
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::Stage(position),
                messages::BlockDestructionStage {
                    entity_id,
                    position: position.0,
                    stage: -1,
                },
            );
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::BlockEntity(entity_id),
                messages::RemoveBlockEntity { entity_id },
            );
        }

        Ok(true)
    }

    /// Forcibly ends every session the player holds, across all views, skipping callbacks.
    /// Used on disconnect.
    pub fn stop_digging(&mut self, player: Entity) {
        let mut held: Vec<(ViewId, BlockPosition)> = Vec::new();
        for (view_id, view) in self.manager.views.iter() {
            for (position, record) in view.dig.records() {
                if record.is_active() && record.last_damager() == Some(player) {
                    held.push((*view_id, *position));
                }
            }
        }

        for (view_id, position) in held {
            let Some(view) = self.manager.views.get(&view_id) else {
                continue;
            };
            let Some(record) = view.dig.record(&position) else {
                continue;
            };
            let entity_id = record.entity_id();
            let keep = record.last_stage() >= 0;
            let column = ChunkColumn::containing(view.world(), position);
            let targets = self.viewers_seeing(view, column);

            let view = self.manager.views.get_mut(&view_id).unwrap();
            let record = view.dig.records.get_mut(&position).unwrap();
            record.session = None;
            if !keep {
                view.dig.records.remove(&position);
                push_to(
                    &mut self.queue,
                    &targets,
                    UpdateSlot::BlockEntity(entity_id),
                    messages::RemoveBlockEntity { entity_id },
                );
            }
        }
    }

    /// Clears the cell's destruction record and overlay, unless a session is running there.
    pub fn reset_dig_block(
        &mut self,
        view_id: ViewId,
        position: BlockPosition,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let Some(record) = view.dig.record(&position) else {
            return Ok(());
        };
        if record.is_active() {
            return Ok(());
        }
        let entity_id = record.entity_id();
        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);

        let view = self.manager.views.get_mut(&view_id).unwrap();
        view.dig.records.remove(&position);

        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Stage(position),
            messages::BlockDestructionStage {
                entity_id,
                position: position.0,
                stage: -1,
            },
        );
        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::BlockEntity(entity_id),
            messages::RemoveBlockEntity { entity_id },
        );
        Ok(())
    }

    /// Shows paused destruction progress at the cell without starting a timer. Only resumable
    /// blocks hold on to partial progress, everything else is left untouched.
    pub fn simulate_partial_break(
        &mut self,
        view_id: ViewId,
        player: Entity,
        position: BlockPosition,
        fraction: f32,
    ) -> Result<(), ViewError> {
        let view = self.manager.views.get(&view_id).ok_or(ViewError::UnknownView)?;
        let Some(data) = view.get(position).cloned() else {
            return Err(ViewError::NoSuchBlock);
        };
        if !data.resumable() {
            return Ok(());
        }
        let Some(full_break_ms) = self.break_time_ms(&data, player) else {
            return Ok(());
        };

        let fraction = fraction.clamp(0.0, 1.0);
        let accumulated_ms = (fraction * full_break_ms as f32) as u64;
        let stage = (fraction * 9.0).ceil() as i8;

        let column = ChunkColumn::containing(view.world(), position);
        let targets = self.viewers_seeing(view, column);
        let is_new = view.dig.record(&position).is_none();

        let view = self.manager.views.get_mut(&view_id).unwrap();
        let entity_id = match view.dig.record(&position) {
            Some(record) => record.entity_id(),
            None => view.dig.new_entity_id(),
        };
        let record = view
            .dig
            .records
            .entry(position)
            .or_insert_with(|| DigRecord::new(entity_id));
        record.last_damager = Some(player);
        record.accumulated_ms = accumulated_ms;
        record.last_stage = stage;

        if is_new {
            push_to(
                &mut self.queue,
                &targets,
                UpdateSlot::BlockEntity(entity_id),
                messages::SpawnBlockEntity {
                    entity_id,
                    position: position.0,
                },
            );
        }
        push_to(
            &mut self.queue,
            &targets,
            UpdateSlot::Stage(position),
            messages::BlockDestructionStage {
                entity_id,
                position: position.0,
                stage,
            },
        );

        Ok(())
    }

    /// Advances every active session: diff-only stage packets, completion once the full break
    /// time is reached. Sessions whose override vanished are dropped quietly.
    pub(crate) fn tick_dig_sessions(&mut self) {
        let now = self.now_ms();

        enum Tick {
            Complete(Entity),
            Stage(Entity, ViewBlockData, i8),
            Vanished,
        }

        let mut actions = Vec::new();
        for (view_id, view) in self.manager.views.iter() {
            for (position, record) in view.dig.records() {
                let Some(session) = record.session() else {
                    continue;
                };
                let Some(data) = view.get(*position) else {
                    actions.push((*view_id, *position, Tick::Vanished));
                    continue;
                };
                let total_ms = session.total_ms(now);
                if total_ms >= session.full_break_ms {
                    actions.push((*view_id, *position, Tick::Complete(session.player)));
                } else {
                    let stage = stage_for(total_ms, session.full_break_ms);
                    if stage != session.last_stage {
                        actions.push((
                            *view_id,
                            *position,
                            Tick::Stage(session.player, data.clone(), stage),
                        ));
                    }
                }
            }
        }

        for (view_id, position, action) in actions {
            match action {
                Tick::Complete(player) => {
                    match self.complete_digging(view_id, position, player) {
                        Ok(()) | Err(ViewError::Cancelled) => {}
                        Err(error) => {
                            warn!("Failed to complete dig session at {position:?}: {error}");
                        }
                    }
                }
                Tick::Stage(player, data, stage) => {
                    let mut event = ViewBlockDigEvent {
                        view: view_id,
                        player,
                        position,
                        data,
                        stage,
                    };
                    self.callbacks.dispatch_block_dig(&mut event);
                    let stage = event.stage;

                    let Some(view) = self.manager.views.get(&view_id) else {
                        continue;
                    };
                    let Some(record) = view.dig.record(&position) else {
                        continue;
                    };
                    if !record.is_active() {
                        continue;
                    }
                    let entity_id = record.entity_id();
                    let column = ChunkColumn::containing(view.world(), position);
                    let targets = self.viewers_seeing(view, column);

                    let view = self.manager.views.get_mut(&view_id).unwrap();
                    if let Some(session) = view
                        .dig
                        .records
                        .get_mut(&position)
                        .and_then(|record| record.session.as_mut())
                    {
                        session.last_stage = stage;
                    }
                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::Stage(position),
                        messages::BlockDestructionStage {
                            entity_id,
                            position: position.0,
                            stage,
                        },
                    );
                }
                Tick::Vanished => {
                    let Some(view) = self.manager.views.get(&view_id) else {
                        continue;
                    };
                    let Some(record) = view.dig.record(&position) else {
                        continue;
                    };
                    let entity_id = record.entity_id();
                    let column = ChunkColumn::containing(view.world(), position);
                    let targets = self.viewers_seeing(view, column);

                    let view = self.manager.views.get_mut(&view_id).unwrap();
                    view.dig.records.remove(&position);

                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::Stage(position),
                        messages::BlockDestructionStage {
                            entity_id,
                            position: position.0,
                            stage: -1,
                        },
                    );
                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::BlockEntity(entity_id),
                        messages::RemoveBlockEntity { entity_id },
                    );
                }
            }
        }
    }

    /// Re-emits the overlay of every paused record and sweeps out the ones that show nothing
    /// anymore. Runs on a coarse timer to recover clients from packet loss.
    pub(crate) fn sync_dig_overlays(&mut self) {
        enum Sync {
            Evict,
            EvictWithClear,
            Reemit,
        }

        let mut actions = Vec::new();
        for (view_id, view) in self.manager.views.iter() {
            for (position, record) in view.dig.records() {
                if record.is_active() {
                    continue;
                }
                let action = if record.accumulated_ms() == 0 && record.last_stage() < 0 {
                    Sync::Evict
                } else if view.get(*position).is_none() {
                    // The override is gone; a paused record for it can never resume.
                    Sync::EvictWithClear
                } else {
                    Sync::Reemit
                };
                actions.push((*view_id, *position, action));
            }
        }

        for (view_id, position, action) in actions {
            let Some(view) = self.manager.views.get(&view_id) else {
                continue;
            };
            let Some(record) = view.dig.record(&position) else {
                continue;
            };
            let entity_id = record.entity_id();
            let last_stage = record.last_stage();
            let column = ChunkColumn::containing(view.world(), position);
            let targets = self.viewers_seeing(view, column);

            match action {
                Sync::Evict => {
                    let view = self.manager.views.get_mut(&view_id).unwrap();
                    view.dig.records.remove(&position);
                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::BlockEntity(entity_id),
                        messages::RemoveBlockEntity { entity_id },
                    );
                }
                Sync::EvictWithClear => {
                    let view = self.manager.views.get_mut(&view_id).unwrap();
                    view.dig.records.remove(&position);
                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::Stage(position),
                        messages::BlockDestructionStage {
                            entity_id,
                            position: position.0,
                            stage: -1,
                        },
                    );
                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::BlockEntity(entity_id),
                        messages::RemoveBlockEntity { entity_id },
                    );
                }
                Sync::Reemit => {
                    push_to(
                        &mut self.queue,
                        &targets,
                        UpdateSlot::Stage(position),
                        messages::BlockDestructionStage {
                            entity_id,
                            position: position.0,
                            stage: last_stage,
                        },
                    );
                }
            }
        }
    }
}
