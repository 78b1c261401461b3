//! Per-tick replication cost at various session and entity counts
//!
//! Run with: cargo bench --bench pvs_scaling

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sightline_server::config::PvsConfig;
use sightline_server::net::transport::NullTransport;
use sightline_server::pvs::system::PvsSystem;
use sightline_server::util::vec2::Vec2;
use sightline_server::world::{EntityUid, InMemoryWorld, DEFAULT_VIS_MASK};
use uuid::Uuid;

const ARENA: f32 = 400.0;

struct Scene {
    system: PvsSystem,
    world: InMemoryWorld,
    movers: Vec<EntityUid>,
    rng: StdRng,
    tick: u32,
}

impl Scene {
    /// `entities` randomly placed on one map, one player per session
    fn new(sessions: usize, entities: usize, culling: bool) -> Self {
        let config = PvsConfig {
            culling_enabled: culling,
            ..PvsConfig::default()
        };
        let system = PvsSystem::new(config, Arc::new(NullTransport)).expect("valid config");
        let sink = system.sink();
        let mut world = InMemoryWorld::with_sink(sink.clone());
        let mut rng = StdRng::seed_from_u64(42);
        let map = world.spawn_map();

        let mut movers = Vec::with_capacity(entities);
        for _ in 0..entities {
            let pos = Vec2::new(rng.gen_range(-ARENA..ARENA), rng.gen_range(-ARENA..ARENA));
            let uid = world.spawn(map, pos);
            // Roughly one in four carries an item
            if rng.gen_bool(0.25) {
                world.spawn(uid, Vec2::ZERO);
            }
            movers.push(uid);
        }

        for i in 0..sessions {
            let pos = Vec2::new(rng.gen_range(-ARENA..ARENA), rng.gen_range(-ARENA..ARENA));
            let player = world.spawn(map, pos);
            world.set_eye(player, DEFAULT_VIS_MASK);
            let id = Uuid::new_v4();
            sink.connect(id, format!("Player{}", i));
            sink.attach(id, Some(player));
        }

        let mut scene = Self {
            system,
            world,
            movers,
            rng,
            tick: 1,
        };
        // Warm up: everyone past their first full state
        for _ in 0..3 {
            scene.step(0.0);
        }
        scene
    }

    /// Move a fraction of the entities, then replicate one tick
    fn step(&mut self, moving: f64) {
        self.world.set_tick(self.tick);
        for &uid in &self.movers {
            if self.rng.gen_bool(moving) {
                let pos = Vec2::new(self.rng.gen_range(-ARENA..ARENA), self.rng.gen_range(-ARENA..ARENA));
                self.world.set_position(uid, pos);
            }
        }
        self.system.update(&self.world, self.tick).expect("update");
        self.tick += 1;
    }
}

/// Culled sessions, entity count fixed, session count scaling
fn bench_sessions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sessions");
    group.sample_size(30);

    for sessions in [10, 50, 100, 250] {
        let mut scene = Scene::new(sessions, 5_000, true);

        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(BenchmarkId::new("culled", sessions), &sessions, |b, _| {
            b.iter(|| {
                scene.step(0.1);
                black_box(scene.system.last_tick());
            })
        });
    }
    group.finish();
}

/// Culled sessions, session count fixed, entity count scaling
fn bench_entities(c: &mut Criterion) {
    let mut group = c.benchmark_group("entities");
    group.sample_size(30);

    for entities in [1_000, 5_000, 20_000] {
        let mut scene = Scene::new(50, entities, true);

        group.throughput(Throughput::Elements(entities as u64));
        group.bench_with_input(BenchmarkId::new("culled", entities), &entities, |b, _| {
            b.iter(|| {
                scene.step(0.1);
                black_box(scene.system.last_tick());
            })
        });
    }
    group.finish();
}

/// Culling disabled: dirty-buffer enumeration instead of chunk walks
fn bench_unculled(c: &mut Criterion) {
    let mut group = c.benchmark_group("unculled");
    group.sample_size(30);

    for entities in [1_000, 5_000, 20_000] {
        let mut scene = Scene::new(20, entities, false);

        group.throughput(Throughput::Elements(entities as u64));
        group.bench_with_input(BenchmarkId::new("dirty_buffers", entities), &entities, |b, _| {
            b.iter(|| {
                scene.step(0.05);
                black_box(scene.system.last_tick());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sessions, bench_entities, bench_unculled);
criterion_main!(benches);
