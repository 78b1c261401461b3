use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sightline_server::metrics::{self, PvsMetrics};
use sightline_server::net::protocol::{decode, encode, ClientMessage, ServerMessage};
use sightline_server::net::transport::{ChannelTransport, OutboundPacket};
use sightline_server::util::vec2::Vec2;
use sightline_server::world::{EntityStore, EntityUid, EventSink, GameTick, InMemoryWorld, DEFAULT_VIS_MASK};
use sightline_server::{PvsConfig, PvsSystem};

/// Half-width of the simulated map
const WORLD_EXTENT: f32 = 256.0;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// A connected client with latency and packet loss
struct SimClient {
    session: Uuid,
    player: EntityUid,
    latency: GameTick,
    loss: f64,
    /// Encoded acks waiting for their delivery tick
    in_flight: VecDeque<(GameTick, Vec<u8>)>,
    last_state: GameTick,
    leaves: usize,
}

struct Simulation {
    world: InMemoryWorld,
    sink: EventSink,
    map: EntityUid,
    wanderers: Vec<EntityUid>,
    clients: Vec<SimClient>,
    client_index: FxHashMap<Uuid, usize>,
    rng: StdRng,
}

impl Simulation {
    fn new(sink: EventSink, players: usize, entities: usize) -> Self {
        let mut world = InMemoryWorld::with_sink(sink.clone());
        let mut rng = StdRng::from_entropy();
        let map = world.spawn_map();

        // A couple of floating grids with cargo on them
        for _ in 0..4 {
            let origin = random_point(&mut rng);
            let grid = world.spawn_grid(map, origin, Vec2::new(32.0, 32.0));
            for _ in 0..16 {
                let local = Vec2::new(rng.gen_range(0.0..32.0), rng.gen_range(0.0..32.0));
                world.spawn(grid, local);
            }
        }

        let wanderers = (0..entities)
            .map(|_| {
                let pos = random_point(&mut rng);
                let uid = world.spawn(map, pos);
                if rng.gen_bool(0.2) {
                    world.spawn(uid, Vec2::ZERO);
                }
                uid
            })
            .collect();

        let mut sim = Self {
            world,
            sink,
            map,
            wanderers,
            clients: Vec::with_capacity(players),
            client_index: FxHashMap::default(),
            rng,
        };
        for i in 0..players {
            sim.connect(format!("Player{}", i));
        }
        sim
    }

    fn connect(&mut self, name: String) {
        let pos = random_point(&mut self.rng);
        let player = self.world.spawn(self.map, pos);
        self.world.set_eye(player, DEFAULT_VIS_MASK);

        let session = Uuid::new_v4();
        self.sink.connect(session, name);
        self.sink.attach(session, Some(player));

        self.client_index.insert(session, self.clients.len());
        self.clients.push(SimClient {
            session,
            player,
            latency: self.rng.gen_range(1..6),
            loss: self.rng.gen_range(0.0..0.05),
            in_flight: VecDeque::new(),
            last_state: 0,
            leaves: 0,
        });
    }

    /// Move things around and churn a few entities
    fn simulate(&mut self, tick: GameTick) {
        self.world.set_tick(tick);

        for client in &self.clients {
            if let Some(pos) = self.world.local_position(client.player) {
                let step = Vec2::new(self.rng.gen_range(-1.0..1.0), self.rng.gen_range(-1.0..1.0));
                self.world.set_position(client.player, clamp(pos + step));
            }
        }

        for _ in 0..self.wanderers.len() / 20 {
            let i = self.rng.gen_range(0..self.wanderers.len());
            let uid = self.wanderers[i];
            if let Some(pos) = self.world.local_position(uid) {
                let step = Vec2::new(self.rng.gen_range(-2.0..2.0), self.rng.gen_range(-2.0..2.0));
                self.world.set_position(uid, clamp(pos + step));
            }
        }

        if self.rng.gen_bool(0.05) && !self.wanderers.is_empty() {
            let i = self.rng.gen_range(0..self.wanderers.len());
            let uid = self.wanderers.swap_remove(i);
            self.world.delete(uid);
            let pos = random_point(&mut self.rng);
            self.wanderers.push(self.world.spawn(self.map, pos));
        }
    }

    /// Read what the server sent and queue acks back
    fn receive(&mut self, outbound: &Receiver<OutboundPacket>, tick: GameTick) {
        for packet in outbound.try_iter() {
            let Some(&i) = self.client_index.get(&packet.session) else {
                continue;
            };
            let client = &mut self.clients[i];
            if !packet.reliable && self.rng.gen_bool(client.loss) {
                continue;
            }
            match decode::<ServerMessage>(&packet.payload) {
                Ok(ServerMessage::State(state)) => {
                    if state.from_tick != 0 && state.from_tick > client.last_state {
                        // Delta against a state we never saw: start over
                        warn!("Client {} missing base tick {}", client.session, state.from_tick);
                        queue(client, tick, &ClientMessage::RequestFullState {
                            tick: state.to_tick,
                            missing_entity: None,
                        });
                        continue;
                    }
                    client.last_state = client.last_state.max(state.to_tick);
                    queue(client, tick, &ClientMessage::Ack { tick: state.to_tick });
                }
                Ok(ServerMessage::LeavePvs(leave)) => client.leaves += leave.entities.len(),
                Err(e) => error!("Client {} got an undecodable packet: {}", client.session, e),
            }
        }

        for client in &mut self.clients {
            while client.in_flight.front().is_some_and(|(due, _)| *due <= tick) {
                let Some((_, bytes)) = client.in_flight.pop_front() else {
                    break;
                };
                if let Err(e) = self.sink.client_packet(client.session, &bytes) {
                    warn!("Dropped packet from {}: {}", client.session, e);
                }
            }
        }
    }
}

fn queue(client: &mut SimClient, tick: GameTick, message: &ClientMessage) {
    match encode(message) {
        Ok(bytes) => client.in_flight.push_back((tick + client.latency, bytes)),
        Err(e) => error!("Failed to encode client message: {}", e),
    }
}

fn random_point(rng: &mut StdRng) -> Vec2 {
    Vec2::new(
        rng.gen_range(-WORLD_EXTENT..WORLD_EXTENT),
        rng.gen_range(-WORLD_EXTENT..WORLD_EXTENT),
    )
}

fn clamp(p: Vec2) -> Vec2 {
    p.max(Vec2::splat(-WORLD_EXTENT)).min(Vec2::splat(WORLD_EXTENT))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Sightline Server v{}", env!("CARGO_PKG_VERSION"));

    let config = PvsConfig::load_or_default();
    config.validate().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    let tick_rate = config.tick_rate;

    let (transport, outbound) = ChannelTransport::new();
    let mut system = PvsSystem::new(config, Arc::new(transport))?;

    // Start metrics server on port 9090 (configurable via METRICS_PORT)
    let metrics: Arc<PvsMetrics> = system.metrics();
    let metrics_port: u16 = env_or("METRICS_PORT", 9090);
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let players: usize = env_or("SIM_PLAYERS", 32);
    let entities: usize = env_or("SIM_ENTITIES", 4000);
    let mut sim = Simulation::new(system.sink(), players, entities);
    info!(
        "Simulating {} players and {} entities at {} Hz",
        players, entities, tick_rate
    );

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(tick_rate)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick: GameTick = 1;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sim.simulate(tick);
                if let Err(e) = system.update(&sim.world, tick) {
                    error!("Replication failed at tick {}: {}", tick, e);
                    break;
                }
                sim.receive(&outbound, tick);

                if tick % (tick_rate * 10) == 0 {
                    let m = system.metrics();
                    let leaves: usize = sim.clients.iter().map(|c| c.leaves).sum();
                    info!(
                        "tick {}: {} entities tracked, {} chunks, avg {}us, {} leave notices seen by clients",
                        tick,
                        system.tracked_entities(),
                        system.chunk_index().len(),
                        m.tick_time_us.load(std::sync::atomic::Ordering::Relaxed),
                        leaves
                    );
                }
                debug!("tick {} done", tick);
                tick += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Server stopped at tick {}", system.last_tick());
    Ok(())
}
