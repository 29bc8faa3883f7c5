use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bevy::ecs::system::SystemState;
use bevy::math::UVec3;
use bevy::prelude::*;

use facade::prelude::*;
use facade::protocol::{messages, MessageType};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<(Entity, Vec<u8>)>>,
}

impl PacketSink for RecordingSink {
    fn send(&self, player: Entity, message: Vec<u8>) {
        self.frames.lock().unwrap().push((player, message));
    }
}

fn decode(frame: &[u8]) -> messages::Bundle {
    assert_eq!(frame[0], MessageType::Bundle as u8);
    let length = u32::from_le_bytes(frame[1..5].try_into().unwrap()) as usize;
    assert_eq!(frame.len(), 5 + length);
    bincode::deserialize(&frame[5..]).unwrap()
}

struct Harness {
    app: App,
    sink: Arc<RecordingSink>,
}

const W1: WorldId = WorldId(1);

fn harness() -> Harness {
    let mut app = App::new();
    let sink = Arc::new(RecordingSink::default());
    app.insert_resource(PacketSender::new(sink.clone()));
    app.insert_resource(Blocks::new(vec![
        BlockConfig {
            name: "stone".to_owned(),
            hardness: Some(1.0),
            tools: HashSet::from(["pickaxe".to_owned()]),
            default_state: None,
        },
        BlockConfig {
            name: "dirt".to_owned(),
            hardness: Some(0.5),
            tools: HashSet::new(),
            default_state: None,
        },
    ]));
    app.add_plugins(FacadePlugin);
    Harness { app, sink }
}

impl Harness {
    fn spawn_player(&mut self, name: &str, world: WorldId) -> Entity {
        self.app
            .world_mut()
            .spawn((
                Player {
                    username: name.to_owned(),
                },
                CurrentWorld(world),
                MainHand::default(),
                BreakContext::default(),
            ))
            .id()
    }

    fn load_column(&mut self, player: Entity, world: WorldId, position: BlockPosition) {
        self.app
            .world_mut()
            .resource_mut::<LoadedChunks>()
            .mark_loaded(player, ChunkColumn::containing(world, position));
    }

    fn views<R>(&mut self, f: impl FnOnce(&mut BlockViews) -> R) -> R {
        let mut state: SystemState<BlockViews> = SystemState::new(self.app.world_mut());
        let mut views = state.get_mut(self.app.world_mut());
        f(&mut views)
    }

    fn block_id(&self, name: &str) -> BlockId {
        self.app.world().resource::<Blocks>().get_id(name)
    }

    fn tick(&mut self) {
        self.app.update();
    }

    fn advance(&mut self, ms: u64) {
        self.app
            .world_mut()
            .resource_mut::<Time>()
            .advance_by(Duration::from_millis(ms));
        self.app.update();
    }

    fn drain(&self) -> Vec<(Entity, messages::Bundle)> {
        self.sink
            .frames
            .lock()
            .unwrap()
            .drain(..)
            .map(|(player, frame)| (player, decode(&frame)))
            .collect()
    }

    fn drain_for(&self, player: Entity) -> Vec<messages::Packet> {
        self.drain()
            .into_iter()
            .filter(|(receiver, _)| *receiver == player)
            .flat_map(|(_, bundle)| bundle.packets)
            .collect()
    }
}

fn allowing_options() -> BlockViewOptions {
    BlockViewOptions {
        unmanaged_block_behavior: UnmanagedBlockBehavior::Allow,
        ..Default::default()
    }
}

fn test_view(origin: BlockPosition) -> BlockView {
    BlockView::new(
        W1,
        origin,
        UVec3::new(3, 3, 3),
        BlockViewType::Transient,
        allowing_options(),
    )
}

fn custom_block(wire_id: BlockId, hardness: f32, resumable: bool) -> ViewBlockData {
    ViewBlockData::Custom(CustomBlockData {
        wire_id,
        wire_state: None,
        hardness: Some(hardness),
        resumable,
        harvested_by: Vec::new(),
    })
}

fn stages_of(packets: &[messages::Packet]) -> Vec<i8> {
    packets
        .iter()
        .filter_map(|packet| match packet {
            messages::Packet::BlockDestructionStage(stage) => Some(stage.stage),
            _ => None,
        })
        .collect()
}

// S1: a single override reaches exactly the audience that sees the chunk, once, and fires the
// set notification.
#[test]
fn single_override_visibility() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let p2 = h.spawn_player("p2", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);
    h.load_column(p2, W1, target);

    let set_events = Arc::new(AtomicUsize::new(0));
    {
        let counter = set_events.clone();
        h.app
            .world_mut()
            .resource_mut::<ViewCallbacks>()
            .on_block_set(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
    }

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, ViewBlockData::vanilla(stone), true)
            .unwrap();
    });
    h.tick();

    let frames = h.drain();
    let p1_packets: Vec<_> = frames
        .iter()
        .filter(|(receiver, _)| *receiver == p1)
        .flat_map(|(_, bundle)| bundle.packets.clone())
        .collect();
    assert_eq!(
        p1_packets,
        vec![messages::Packet::BlockChange(messages::BlockChange {
            position: target.0,
            block_id: stone,
            block_state: None,
        })]
    );
    // P2 is not an audience yet
    assert!(frames.iter().all(|(receiver, _)| *receiver != p2));
    assert_eq!(set_events.load(Ordering::SeqCst), 1);
}

// S2: joining the audience replays the overrides as one section update per occupied chunk,
// containing exactly the overridden cells.
#[test]
fn audience_apply_emits_chunk_section() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let p2 = h.spawn_player("p2", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);
    h.load_column(p2, W1, target);

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, ViewBlockData::vanilla(stone), true)
            .unwrap();
        id
    });
    h.tick();
    h.drain();

    h.views(|views| views.add_player_to_view(p2, id).unwrap());
    h.tick();

    let p2_packets = h.drain_for(p2);
    assert_eq!(
        p2_packets,
        vec![messages::Packet::BlockUpdates(messages::BlockUpdates {
            chunk_position: target.chunk_min(),
            blocks: vec![(target.as_chunk_index(), stone, None)],
        })]
    );
}

// S3: a full dig session emits stages 0..=9 in order, breaks the block through the cancellable
// event, and evicts the record.
#[test]
fn dig_completion() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 202);
    h.load_column(p1, W1, target);

    let break_events: Arc<Mutex<Vec<(ViewBlockData, ViewBlockData)>>> =
        Arc::new(Mutex::new(Vec::new()));
    {
        let log = break_events.clone();
        h.app
            .world_mut()
            .resource_mut::<ViewCallbacks>()
            .on_block_break(move |event| {
                log.lock()
                    .unwrap()
                    .push((event.original.clone(), event.output.clone()));
            });
    }

    let stone = h.block_id("stone");
    let block = custom_block(stone, 1.0, false);
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views.set_block(id, target, block.clone(), false).unwrap();
        id
    });
    h.tick();
    h.drain();

    // hardness 1.0 -> 1500 ms bare-handed
    assert!(h
        .views(|views| views.start_digging(id, p1, target, 1.0))
        .unwrap());
    h.tick();
    for _ in 0..15 {
        h.advance(100);
    }

    let packets = h.drain_for(p1);
    let stages = stages_of(&packets);
    let progress: Vec<i8> = stages.iter().copied().filter(|stage| *stage >= 0).collect();
    assert_eq!(progress, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    // The overlay clears when the block breaks
    assert_eq!(stages.last(), Some(&-1));
    assert!(packets.iter().any(|packet| matches!(
        packet,
        messages::Packet::BlockChange(change) if change.block_id == AIR
    )));

    let breaks = break_events.lock().unwrap();
    assert_eq!(breaks.len(), 1);
    assert_eq!(breaks[0].0, block);
    assert_eq!(breaks[0].1, ViewBlockData::AIR);
    drop(breaks);

    h.views(|views| {
        assert!(views.view(id).unwrap().dig_manager().record(&target).is_none());
        assert_eq!(views.view(id).unwrap().get(target), Some(&ViewBlockData::AIR));
    });
}

// S4 + resumability law: cancelled progress on a resumable block survives and the second
// session finishes the remainder without a second break event.
#[test]
fn dig_cancel_and_resume() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);

    let break_count = Arc::new(AtomicUsize::new(0));
    {
        let counter = break_count.clone();
        h.app
            .world_mut()
            .resource_mut::<ViewCallbacks>()
            .on_block_break(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
    }

    let stone = h.block_id("stone");
    // full_break_ms = 1000
    let block = custom_block(stone, 2.0 / 3.0, true);
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views.set_block(id, target, block, false).unwrap();
        id
    });
    h.tick();

    assert!(h
        .views(|views| views.start_digging(id, p1, target, 1.0))
        .unwrap());
    h.tick();
    h.advance(400);

    h.views(|views| views.cancel_digging(id, target, p1).unwrap());
    h.views(|views| {
        let record = views.view(id).unwrap().dig_manager().record(&target).unwrap();
        assert!(!record.is_active());
        assert_eq!(record.accumulated_ms(), 400);
        assert_eq!(record.last_stage(), 4);
    });
    assert_eq!(break_count.load(Ordering::SeqCst), 0);

    assert!(h
        .views(|views| views.start_digging(id, p1, target, 1.0))
        .unwrap());
    h.tick();
    h.advance(700);

    // completion at 400 + 700 = 1100 ms total, exactly one break
    assert_eq!(break_count.load(Ordering::SeqCst), 1);
    h.views(|views| {
        assert!(views.view(id).unwrap().dig_manager().record(&target).is_none());
    });
}

// Non-resumable blocks lose their progress on cancel and the record is evicted.
#[test]
fn cancel_resets_non_resumable_blocks() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 65, 201);
    h.load_column(p1, W1, target);

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, custom_block(stone, 1.0, false), false)
            .unwrap();
        id
    });
    h.tick();
    h.drain();

    assert!(h
        .views(|views| views.start_digging(id, p1, target, 1.0))
        .unwrap());
    h.tick();
    h.advance(600);
    h.views(|views| views.cancel_digging(id, target, p1).unwrap());
    h.tick();

    h.views(|views| {
        assert!(views.view(id).unwrap().dig_manager().record(&target).is_none());
    });
    let packets = h.drain_for(p1);
    assert!(stages_of(&packets).contains(&-1));
    assert!(packets
        .iter()
        .any(|packet| matches!(packet, messages::Packet::RemoveBlockEntity(_))));
}

// S5 + authorisation property: another player cannot complete someone else's session.
#[test]
fn cross_player_authorisation() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let p2 = h.spawn_player("p2", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);
    h.load_column(p2, W1, target);

    let break_count = Arc::new(AtomicUsize::new(0));
    {
        let counter = break_count.clone();
        h.app
            .world_mut()
            .resource_mut::<ViewCallbacks>()
            .on_block_break(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
    }

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, custom_block(stone, 1.0, true), false)
            .unwrap();
        id
    });

    assert!(h
        .views(|views| views.start_digging(id, p1, target, 1.0))
        .unwrap());
    h.advance(200);

    assert_eq!(
        h.views(|views| views.complete_digging(id, target, p2)),
        Err(ViewError::Unauthorized)
    );
    assert_eq!(
        h.views(|views| views.cancel_digging(id, target, p2)),
        Err(ViewError::Unauthorized)
    );
    assert_eq!(break_count.load(Ordering::SeqCst), 0);
    h.views(|views| {
        let record = views.view(id).unwrap().dig_manager().record(&target).unwrap();
        assert!(record.is_active());
        assert_eq!(record.last_damager(), Some(p1));
    });
}

// S6: placeholders never make it into the manager.
#[test]
fn placeholder_rejection() {
    let mut h = harness();
    let placeholder = BlockView::new(
        W1,
        BlockPosition::new(0, 0, 0),
        UVec3::new(2, 2, 2),
        BlockViewType::Placeholder,
        BlockViewOptions::default(),
    );
    let id = placeholder.id();
    assert_eq!(
        h.views(|views| views.register(placeholder).unwrap_err()),
        ViewError::IsPlaceholder
    );
    // Never registered, so it cannot be targeted either
    let p1 = h.spawn_player("p1", W1);
    assert_eq!(
        h.views(|views| views.add_player_to_view(p1, id).unwrap_err()),
        ViewError::UnknownView
    );
}

// Property 3: player visibility and audience membership imply each other.
#[test]
fn visibility_consistency() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| views.register(view).unwrap());

    h.views(|views| views.add_player_to_view(p1, id).unwrap());
    h.views(|views| {
        assert!(views
            .manager()
            .views_visible_to_player(p1)
            .any(|view| view.id() == id));
        assert!(views
            .view(id)
            .unwrap()
            .audiences()
            .any(|audience| *audience == Audience::Player(p1)));
    });

    h.views(|views| views.remove_player_from_view(p1, id).unwrap());
    h.views(|views| {
        assert_eq!(views.manager().views_visible_to_player(p1).count(), 0);
        assert_eq!(views.view(id).unwrap().audiences().count(), 0);
    });
}

// Property 5: simulating the same paused progress twice leaves the record as after once.
#[test]
fn simulated_progress_is_idempotent() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, custom_block(stone, 1.0, true), false)
            .unwrap();
        id
    });

    h.views(|views| views.simulate_partial_break(id, p1, target, 0.5).unwrap());
    let first = h.views(|views| {
        let record = views.view(id).unwrap().dig_manager().record(&target).unwrap();
        (
            record.entity_id(),
            record.accumulated_ms(),
            record.last_stage(),
            record.is_active(),
        )
    });
    assert_eq!(first.1, 750);
    assert_eq!(first.2, 5);
    assert!(!first.3);

    h.views(|views| views.simulate_partial_break(id, p1, target, 0.5).unwrap());
    let second = h.views(|views| {
        let record = views.view(id).unwrap().dig_manager().record(&target).unwrap();
        (
            record.entity_id(),
            record.accumulated_ms(),
            record.last_stage(),
            record.is_active(),
        )
    });
    assert_eq!(first, second);
}

// Property 8: applying and resetting an audience produce packet-for-packet opposing frames.
#[test]
fn audience_symmetry() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let p2 = h.spawn_player("p2", W1);
    let origin = BlockPosition::new(8, 64, 0);
    let inside = BlockPosition::new(9, 64, 1);
    // Spans chunk columns (0, 0) and (1, 0)
    let across = BlockPosition::new(17, 64, 1);
    h.load_column(p1, W1, inside);
    h.load_column(p1, W1, across);

    let stone = h.block_id("stone");
    let view = BlockView::new(
        W1,
        origin,
        UVec3::new(12, 2, 4),
        BlockViewType::Transient,
        allowing_options(),
    );
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, inside, ViewBlockData::vanilla(stone), false)
            .unwrap();
        views
            .set_block(id, across, custom_block(stone, 1.0, true), false)
            .unwrap();
        id
    });
    // A paused overlay that apply/reset must replay and clear
    h.views(|views| views.simulate_partial_break(id, p1, across, 0.4).unwrap());
    h.tick();
    h.drain();

    h.views(|views| {
        assert!(views.add_audience(id, Audience::Player(p2), true).unwrap());
    });
    h.tick();
    let applied = h.drain_for(p2);

    h.views(|views| {
        assert!(views
            .remove_audience(id, &Audience::Player(p2), true)
            .unwrap());
    });
    h.tick();
    let reset = h.drain_for(p2);

    assert_eq!(applied.len(), reset.len());

    let count = |packets: &[messages::Packet]| {
        let mut updates = 0;
        let mut stages = 0;
        let mut spawns = 0;
        let mut removes = 0;
        for packet in packets {
            match packet {
                messages::Packet::BlockUpdates(_) => updates += 1,
                messages::Packet::BlockDestructionStage(_) => stages += 1,
                messages::Packet::SpawnBlockEntity(_) => spawns += 1,
                messages::Packet::RemoveBlockEntity(_) => removes += 1,
                _ => {}
            }
        }
        (updates, stages, spawns, removes)
    };
    let (applied_updates, applied_stages, applied_spawns, _) = count(&applied);
    let (reset_updates, reset_stages, _, reset_removes) = count(&reset);
    // Two occupied chunks either way
    assert_eq!(applied_updates, 2);
    assert_eq!(applied_updates, reset_updates);
    assert_eq!(applied_stages, reset_stages);
    assert_eq!(applied_spawns, reset_removes);
    // Reset clears the overlay that apply drew
    assert!(stages_of(&reset).contains(&-1));
}

// A cancelled break commits nothing and rolls the breaking player's client back.
#[test]
fn cancelled_break_rolls_back() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);

    h.app
        .world_mut()
        .resource_mut::<ViewCallbacks>()
        .on_block_break(|event| event.cancelled = true);

    let stone = h.block_id("stone");
    let block = ViewBlockData::vanilla(stone);
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views.set_block(id, target, block.clone(), false).unwrap();
        id
    });
    h.tick();
    h.drain();

    assert_eq!(
        h.views(|views| views.break_block(id, p1, target, true, true, None)),
        Err(ViewError::Cancelled)
    );
    h.tick();

    h.views(|views| {
        assert_eq!(views.view(id).unwrap().get(target), Some(&block));
    });
    // The rollback re-sends the surviving override
    let packets = h.drain_for(p1);
    assert_eq!(
        packets,
        vec![messages::Packet::BlockChange(messages::BlockChange {
            position: target.0,
            block_id: stone,
            block_state: None,
        })]
    );
}

// Subscribers may rewrite the break output; the rewritten block is what commits and ships.
#[test]
fn break_output_is_mutable() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);

    let dirt = h.block_id("dirt");
    h.app
        .world_mut()
        .resource_mut::<ViewCallbacks>()
        .on_block_break(move |event| event.output = ViewBlockData::vanilla(dirt));

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, ViewBlockData::vanilla(stone), false)
            .unwrap();
        id
    });
    h.tick();
    h.drain();

    h.views(|views| {
        views
            .break_block(id, p1, target, false, true, Some(TriggerSource::Command))
            .unwrap();
    });
    h.tick();

    h.views(|views| {
        assert_eq!(
            views.view(id).unwrap().get(target),
            Some(&ViewBlockData::vanilla(dirt))
        );
    });
    let packets = h.drain_for(p1);
    assert!(packets.iter().any(|packet| matches!(
        packet,
        messages::Packet::BlockChange(change) if change.block_id == dirt
    )));
}

// Viewers without the containing chunk loaded get no targeted updates.
#[test]
fn unloaded_chunks_receive_nothing() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    // No load_column for p1

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_audience(id, Audience::Player(p1), false).unwrap();
        views
            .set_block(id, target, ViewBlockData::vanilla(stone), false)
            .unwrap();
    });
    h.tick();
    assert!(h.drain_for(p1).is_empty());
}

// A viewer that disconnects between enqueue and flush is dropped at flush time.
#[test]
fn disconnected_viewers_are_filtered_at_flush() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, ViewBlockData::vanilla(stone), false)
            .unwrap();
    });
    h.app.world_mut().despawn(p1);
    h.tick();
    assert!(h.drain().is_empty());
}

// Disconnects destroy the player's sessions without callbacks and drop them from every view.
#[test]
fn disconnect_stops_sessions_and_forgets_the_player() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    let id = h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_player_to_view(p1, id).unwrap();
        views
            .set_block(id, target, custom_block(stone, 1.0, true), false)
            .unwrap();
        id
    });
    assert!(h
        .views(|views| views.start_digging(id, p1, target, 1.0))
        .unwrap());

    h.app.world_mut().send_event(PlayerEvent::Disconnected { entity: p1 });
    h.tick();

    h.views(|views| {
        // No overlay was ever persisted, so the record is gone entirely
        assert!(views.view(id).unwrap().dig_manager().record(&target).is_none());
        assert_eq!(views.view(id).unwrap().audiences().count(), 0);
        assert_eq!(views.manager().views_visible_to_player(p1).count(), 0);
    });
}

// Group audiences resolve through nested members, once per player.
#[test]
fn group_audiences_flatten_to_players() {
    let mut h = harness();
    let p1 = h.spawn_player("p1", W1);
    let p2 = h.spawn_player("p2", W1);
    let target = BlockPosition::new(101, 64, 201);
    h.load_column(p1, W1, target);
    h.load_column(p2, W1, target);

    let inner = h
        .app
        .world_mut()
        .spawn(AudienceMembers(HashSet::from([p2])))
        .id();
    let group = h
        .app
        .world_mut()
        .spawn(AudienceMembers(HashSet::from([p1, p2, inner])))
        .id();

    let stone = h.block_id("stone");
    let view = test_view(BlockPosition::new(100, 64, 200));
    h.views(|views| {
        let id = views.register(view).unwrap();
        views.add_audience(id, Audience::Group(group), false).unwrap();
        views
            .set_block(id, target, ViewBlockData::vanilla(stone), false)
            .unwrap();
    });
    h.tick();

    let frames = h.drain();
    assert_eq!(frames.len(), 2);
    let receivers: HashSet<Entity> = frames.iter().map(|(receiver, _)| *receiver).collect();
    assert_eq!(receivers, HashSet::from([p1, p2]));
    // p2 appears in two member sets but gets exactly one packet
    for (_, bundle) in frames {
        assert_eq!(bundle.packets.len(), 1);
    }
}
