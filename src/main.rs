use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rtls_positioning::{
    Anchor, ConfigurationManager, InMemoryAnchorRegistry, Measurement, MeasurementBatch, Point3,
    PositioningService, ServiceConfig,
};

const ROOM_SIZE_M: f64 = 20.0;
const TAG_COUNT: usize = 10;
const DEFAULT_ROUNDS: usize = 5;
/// Max horizontal move of a tag per round (meters)
const STEP_M: f64 = 0.3;
/// Uniform ranging error amplitude (meters)
const RANGE_NOISE_M: f64 = 0.2;
/// Anchors that hear each tag per round
const ANCHORS_PER_TAG: usize = 3;

fn room_anchors() -> Vec<Anchor> {
    vec![
        Anchor::new("anchor-1", 0.0, 0.0, 2.5).with_description("south-west corner"),
        Anchor::new("anchor-2", ROOM_SIZE_M, 0.0, 2.5).with_description("south-east corner"),
        Anchor::new("anchor-3", 0.0, ROOM_SIZE_M, 2.5).with_description("north-west corner"),
        Anchor::new("anchor-4", ROOM_SIZE_M, ROOM_SIZE_M, 3.0).with_description("north-east corner"),
    ]
}

/// Random walk of one tag, kept inside the room
fn step(rng: &mut StdRng, position: Point3) -> Point3 {
    Point3::new(
        (position.x + rng.gen_range(-STEP_M..=STEP_M)).clamp(0.5, ROOM_SIZE_M - 0.5),
        (position.y + rng.gen_range(-STEP_M..=STEP_M)).clamp(0.5, ROOM_SIZE_M - 0.5),
        (position.z + rng.gen_range(-0.05..=0.05)).clamp(0.5, 3.0),
    )
}

fn simulate_batch(
    rng: &mut StdRng,
    anchors: &[Anchor],
    tags: &mut BTreeMap<String, Point3>,
    round: usize,
) -> MeasurementBatch {
    let mut measurements = Vec::new();
    for (tag_id, position) in tags.iter_mut() {
        *position = step(rng, *position);
        for anchor in anchors.choose_multiple(rng, ANCHORS_PER_TAG) {
            let noisy = anchor.position.distance_to(position) + rng.gen_range(-RANGE_NOISE_M..=RANGE_NOISE_M);
            measurements.push(Measurement::new(anchor.anchor_id.clone(), tag_id.clone(), noisy.max(0.3)));
        }
    }

    MeasurementBatch {
        gateway_id: format!("gateway-simulator-{}", round % 5 + 1),
        timestamp: chrono::Utc::now(),
        measurements,
    }
}

fn load_config(path: Option<&str>) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let manager = ConfigurationManager::from_file(path)?;
            info!(path, "Configuration loaded");
            Ok(manager.config().clone())
        }
        None => Ok(ServiceConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config_path = None;
    let mut rounds = DEFAULT_ROUNDS;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rounds" => {
                rounds = args.next().and_then(|r| r.parse().ok()).unwrap_or(DEFAULT_ROUNDS);
            }
            "--help" | "-h" => {
                eprintln!("Usage: rtls-positioning [config.json] [--rounds N]");
                return Ok(());
            }
            _ => config_path = Some(arg),
        }
    }

    let config = load_config(config_path.as_deref())?;
    let anchors = room_anchors();
    let registry = Arc::new(InMemoryAnchorRegistry::with_anchors(anchors.clone())?);
    let service = PositioningService::from_config(config, registry)?;

    let mut rng = StdRng::from_entropy();
    let mut tags: BTreeMap<String, Point3> = (0..TAG_COUNT)
        .map(|i| {
            let start = Point3::new(
                rng.gen_range(1.0..19.0),
                rng.gen_range(1.0..19.0),
                rng.gen_range(0.5..2.0),
            );
            (format!("tag-employee-{}", 100 + i), start)
        })
        .collect();

    for round in 0..rounds {
        let batch = simulate_batch(&mut rng, &anchors, &mut tags, round);
        let accepted = service.submit_batch(batch)?;
        let status = service.wait_for_batch(accepted.batch_id).await?;
        info!(round, batch_id = %accepted.batch_id, ?status, "Round finished");
    }

    for (tag_id, truth) in &tags {
        match service.current_position(tag_id).await {
            Ok(fix) => {
                let error = Point3::new(fix.x, fix.y, fix.z).distance_to(truth);
                info!(
                    tag_id = %tag_id,
                    x = %format!("{:.2}", fix.x),
                    y = %format!("{:.2}", fix.y),
                    z = %format!("{:.2}", fix.z),
                    accuracy = %format!("{:.3}", fix.accuracy),
                    error_m = %format!("{:.3}", error),
                    "Current position"
                );
            }
            Err(err) => warn!(tag_id = %tag_id, error = %err, "No position"),
        }
    }

    let metrics = service.metrics();
    info!(
        batches = metrics.batches_completed,
        positioned = metrics.tags_positioned,
        failures = metrics.tag_failures(),
        avg_solve_time_us = %format!("{:.1}", metrics.avg_solve_time_us),
        "Simulation finished"
    );
    Ok(())
}
