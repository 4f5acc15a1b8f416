use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use snapsync::config::SyncConfig;
use snapsync::metrics::{self, Metrics};
use snapsync::net::loopback::{LinkConfig, LoopbackClient, SyncCheck};
use snapsync::net::protocol::ServerMessage;
use snapsync::net::server::SyncServer;
use snapsync::state::{AuthoritativeWorld, ComponentState, SessionStatus};
use snapsync::util::vec2::Vec2;

const SPRITES: [&str; 4] = ["asteroid", "crate", "barrel", "debris"];

fn random_entity(rng: &mut StdRng) -> Vec<ComponentState> {
    let mut components = vec![
        ComponentState::transform(
            Vec2::new(rng.gen_range(-500.0..500.0), rng.gen_range(-500.0..500.0)),
            rng.gen_range(0.0..std::f32::consts::TAU),
        ),
        ComponentState::sprite(true, rng.gen_range(0..4), SPRITES[rng.gen_range(0..SPRITES.len())]),
    ];
    // Roughly half the entities move
    if rng.gen_bool(0.5) {
        components.push(ComponentState::velocity(Vec2::new(
            rng.gen_range(-20.0..20.0),
            rng.gen_range(-20.0..20.0),
        )));
        components.push(ComponentState::Physics {
            mass: rng.gen_range(1.0..100.0),
        });
    }
    components
}

fn build_world(config: &SyncConfig, rng: &mut StdRng) -> AuthoritativeWorld {
    let mut world = AuthoritativeWorld::new();
    for _ in 0..config.sim_entities {
        world.spawn(random_entity(rng));
    }
    for i in 0..config.sim_clients {
        let session = world.connect_player(format!("player-{}", i + 1));
        let avatar = world.spawn(random_entity(rng));
        world.set_controlled_entity(session, Some(avatar));
        world.set_player_status(session, SessionStatus::InGame);
    }
    world
}

/// Advance the simulation one tick, with some churn
fn step_world(world: &mut AuthoritativeWorld, rng: &mut StdRng, tick: u32, dt: f32) {
    world.integrate(dt);

    if tick % 20 == 0 {
        for _ in 0..rng.gen_range(1..4) {
            world.spawn(random_entity(rng));
        }
    }
    if tick % 25 == 0 && world.entity_count() > 0 {
        let pick = rng.gen_range(0..world.entity_count());
        let picked = world.entity_ids().nth(pick);
        if let Some(id) = picked {
            world.despawn(id);
        }
    }
    if tick % 7 == 0 && world.entity_count() > 0 {
        let pick = rng.gen_range(0..world.entity_count());
        let picked = world.entity_ids().nth(pick);
        if let Some(id) = picked {
            world.set_component(id, ComponentState::sprite(rng.gen_bool(0.8), 1, "crate"));
        }
    }
}

async fn run_tick(
    server: &mut SyncServer,
    clients: &mut [LoopbackClient],
    world: &AuthoritativeWorld,
    game_time: f64,
    metrics: &Metrics,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let outbound = server.publish(world, game_time)?;
    metrics.record_publish_time(started.elapsed());
    if let Some(latest) = server.latest() {
        metrics
            .snapshot_sequence
            .store(latest.sequence() as u64, Ordering::Relaxed);
    }
    metrics
        .entity_count
        .store(world.entity_count() as u64, Ordering::Relaxed);

    for out in &outbound {
        match &out.message {
            ServerMessage::FullState(_) => {
                metrics.full_states_sent.fetch_add(1, Ordering::Relaxed);
            }
            ServerMessage::StateDelta(delta) => {
                metrics.deltas_sent.fetch_add(1, Ordering::Relaxed);
                metrics
                    .delta_records_sent
                    .fetch_add(delta.record_count() as u64, Ordering::Relaxed);
            }
        }
        let Some(client) = clients.iter_mut().find(|c| c.id() == out.client) else {
            continue;
        };
        match client.deliver(out).await {
            Ok(len) => {
                metrics.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => warn!(client = %out.client, error = %e, "Delivery failed"),
        }
    }

    tokio::task::yield_now().await;
    for client in clients.iter_mut() {
        client.pump();
    }
    Ok(())
}

fn all_converged(clients: &[LoopbackClient], server: &SyncServer) -> bool {
    clients
        .iter()
        .all(|c| matches!(c.check(server), SyncCheck::Converged { .. }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("snapsync v{}", env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {} Hz, {} clients, {} ticks, loss={}, reorder={}",
        config.tick_rate, config.sim_clients, config.sim_ticks, config.link_loss, config.link_reorder
    );

    let metrics = Arc::new(Metrics::new());
    if config.metrics_port != 0 {
        let metrics_clone = metrics.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let mut rng = StdRng::seed_from_u64(config.link_seed);
    let mut world = build_world(&config, &mut rng);
    let mut server = SyncServer::new(config.server());

    let mut clients: Vec<LoopbackClient> = (0..config.sim_clients)
        .map(|i| {
            let link = LinkConfig {
                loss: config.link_loss,
                reorder: config.link_reorder,
                seed: config.link_seed.wrapping_add(2 * i as u64 + 1),
            };
            LoopbackClient::connect(&mut server, config.reconciler(), link, metrics.clone())
        })
        .collect();
    metrics
        .clients_connected
        .store(clients.len() as u64, Ordering::Relaxed);

    let dt = config.tick_seconds();
    let mut interval = tokio::time::interval(Duration::from_secs_f64(dt));
    let mut game_time = 0.0;

    for tick in 0..config.sim_ticks {
        interval.tick().await;
        step_world(&mut world, &mut rng, tick, dt as f32);
        game_time += dt;
        run_tick(&mut server, &mut clients, &world, game_time, &metrics).await?;

        if tick > 0 && tick % (config.tick_rate * 5) == 0 {
            info!(
                tick,
                entities = world.entity_count(),
                deltas = metrics.deltas_sent.load(Ordering::Relaxed),
                full_states = metrics.full_states_sent.load(Ordering::Relaxed),
                lost = metrics.datagrams_lost.load(Ordering::Relaxed),
                "Soak progress"
            );
        }
    }

    // World is frozen from here; give every client time to catch up
    let settle_ticks = config.tick_rate * 10;
    for _ in 0..settle_ticks {
        if all_converged(&clients, &server) {
            break;
        }
        interval.tick().await;
        game_time += dt;
        run_tick(&mut server, &mut clients, &world, game_time, &metrics).await?;
    }

    let mut failures = 0;
    for client in &clients {
        match client.check(&server) {
            SyncCheck::Converged { sequence } => {
                let stats = client.client().reconciler().stats();
                info!(
                    client = %client.id(),
                    sequence,
                    deltas = stats.deltas_applied,
                    full_states = stats.full_states_applied,
                    dropped = stats.dropped_unknown_base,
                    recovered = stats.parked_recovered,
                    "Client converged"
                );
            }
            SyncCheck::Lagging { sequence } => {
                warn!(client = %client.id(), ?sequence, "Client did not catch up");
                failures += 1;
            }
            SyncCheck::Diverged { sequence } => {
                error!(client = %client.id(), sequence, "Client state diverged from server");
                failures += 1;
            }
        }
    }

    if let Some(path) = &config.snapshot_dump_path {
        if let Some(latest) = server.latest() {
            let json = serde_json::to_string_pretty(latest.as_ref())?;
            tokio::fs::write(path, json).await?;
            info!("Final snapshot {} written to {}", latest.sequence(), path);
        }
    }

    info!("Final metrics:\n{}", metrics.to_json());

    if failures > 0 {
        anyhow::bail!("{} of {} clients did not converge", failures, clients.len());
    }
    info!("All {} clients converged", clients.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_world_churns_entities() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut world = AuthoritativeWorld::new();
        for _ in 0..10 {
            world.spawn(random_entity(&mut rng));
        }
        let before: Vec<_> = world.entity_ids().collect();

        for tick in 1..=100 {
            step_world(&mut world, &mut rng, tick, 0.05);
        }

        // Ticks 20, 40, .. spawn at least one each; 25, 50, 75, 100 despawn one
        let after: Vec<_> = world.entity_ids().collect();
        assert!(after.len() > before.len());
        let newest = after.iter().copied().max().unwrap();
        assert!((1..=newest).any(|id| !after.contains(&id)));
        assert!(world
            .entity_ids()
            .all(|id| world.entity(id).is_some_and(|e| e.validate().is_ok())));
    }
}
