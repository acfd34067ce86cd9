// Presence Sync - demo entry point
//
// Wires the full pipeline against an in-memory remote store: a simulated
// walk feeds the sampler, simulated friends move on their own task, and the
// reconciled annotation set is logged instead of drawn. On unix, SIGHUP
// stands in for the platform memory-pressure signal.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use presence_sync::annotate::LogMapSurface;
use presence_sync::config::Config;
use presence_sync::coordinator::Coordinator;
use presence_sync::entity::{
    Entity, EntityKey, EventEntity, PlaceEntity, PositionSample, UserEntity,
};
use presence_sync::geo::Coordinate;
use presence_sync::remote::MemoryRemoteStore;
use presence_sync::sampler::spawn_sampler;
use rand::Rng;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

fn unix_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting presence sync");
    info!("Publishing presence as user {}", config.user);

    // Remote store with a small simulated social graph.
    let remote = Arc::new(MemoryRemoteStore::with_fetch_delay(Duration::from_millis(30)));
    seed_remote(&remote).await;

    let coordinator = Arc::new(Coordinator::new_with_status(
        remote.clone(),
        Box::new(LogMapSurface),
        config.status_interval,
        config.coord_epsilon,
        config.cache_max_entries,
        config.cache_max_bytes,
    ));

    let runner = coordinator.clone();
    let run_task = tokio::spawn(async move { runner.run().await });

    // Subscribe to everything the demo graph contains.
    for key in [
        EntityKey::user("ada"),
        EntityKey::user("grace"),
        EntityKey::event("picnic"),
        EntityKey::place("cafe"),
    ] {
        coordinator.track(&key).await;
    }

    // Our own walk: samples into the gate/writer pipeline.
    let (sample_tx, sample_rx) = mpsc::channel(64);
    let sampler = spawn_sampler(config.user.clone(), sample_rx, config.gate(), remote.clone());
    let walk_task = tokio::spawn(simulate_walk(sample_tx, config.sample_interval_ms));

    // Friends move on their own.
    let friends_task = tokio::spawn(simulate_friends(remote.clone()));

    // SIGHUP simulates the platform memory-pressure signal.
    #[cfg(unix)]
    {
        let pressured = coordinator.clone();
        tokio::spawn(async move {
            let mut hup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(_) => return,
            };
            while hup.recv().await.is_some() {
                pressured.memory_pressure().await;
            }
        });
    }

    info!("Pipeline ready");

    signal::ctrl_c().await?;
    info!("Received shutdown signal (Ctrl+C)");

    walk_task.abort();
    friends_task.abort();
    sampler.shutdown();
    coordinator.shutdown().await;
    run_task.abort();

    info!(
        "Stopped. {} presence writes reached the remote store",
        remote.presence_writes()
    );
    Ok(())
}

/// Seed the in-memory remote with two friends, an event and a place.
async fn seed_remote(remote: &MemoryRemoteStore) {
    remote
        .upsert(Entity::User(UserEntity {
            id: "ada".to_string(),
            display_name: "Ada".to_string(),
            coordinate: Some(Coordinate::new(40.7130, -74.0055)),
            active: true,
            image_key: Some("avatars/ada".to_string()),
        }))
        .await;
    remote
        .upsert(Entity::User(UserEntity {
            id: "grace".to_string(),
            display_name: "Grace".to_string(),
            coordinate: None, // not located yet; appears once she shares
            active: false,
            image_key: Some("avatars/grace".to_string()),
        }))
        .await;
    remote
        .upsert(Entity::Event(EventEntity {
            id: "picnic".to_string(),
            title: "Park picnic".to_string(),
            coordinate: Coordinate::new(40.7145, -74.0030),
            starts_at: unix_time() + 3600.0,
            image_key: None,
        }))
        .await;
    remote
        .upsert(Entity::Place(PlaceEntity {
            id: "cafe".to_string(),
            name: "Corner cafe".to_string(),
            coordinate: Coordinate::new(40.7120, -74.0070),
            image_key: None,
        }))
        .await;

    remote.put_image("avatars/ada", vec![0xAD; 4 * 1024]).await;
    remote.put_image("avatars/grace", vec![0x6A; 4 * 1024]).await;
}

/// Random walk around lower Manhattan feeding the sampler.
async fn simulate_walk(tx: mpsc::Sender<PositionSample>, interval_ms: u64) {
    let mut lat = 40.7128;
    let mut lon = -74.0060;
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));

    loop {
        ticker.tick().await;
        {
            let mut rng = rand::thread_rng();
            lat += rng.gen_range(-0.00008..0.00008);
            lon += rng.gen_range(-0.00008..0.00008);
        }
        let sample = PositionSample {
            coordinate: Coordinate::new(lat, lon),
            timestamp: unix_time(),
            accuracy_m: 5.0,
        };
        if tx.send(sample).await.is_err() {
            return;
        }
    }
}

/// Ada wanders; Grace shares her position after a while, then goes inactive.
async fn simulate_friends(remote: Arc<MemoryRemoteStore>) {
    let mut ada_lat = 40.7130;
    let mut tick = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_secs(3));

    loop {
        ticker.tick().await;
        tick += 1;

        ada_lat += rand::thread_rng().gen_range(-0.0002..0.0002);
        remote
            .upsert(Entity::User(UserEntity {
                id: "ada".to_string(),
                display_name: "Ada".to_string(),
                coordinate: Some(Coordinate::new(ada_lat, -74.0055)),
                active: tick % 4 != 0,
                image_key: Some("avatars/ada".to_string()),
            }))
            .await;

        if tick == 3 {
            remote
                .upsert(Entity::User(UserEntity {
                    id: "grace".to_string(),
                    display_name: "Grace".to_string(),
                    coordinate: Some(Coordinate::new(40.7150, -74.0080)),
                    active: true,
                    image_key: Some("avatars/grace".to_string()),
                }))
                .await;
        }
    }
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
