//! Positioning scenarios driven through the public service API

use chrono::{Duration, Utc};
use std::sync::Arc;

use rtls_positioning::utils::config::{StoreBackend, StoreConfig};
use rtls_positioning::{
    Anchor, ApiError, BatchStatus, CurrentPositionPolicy, InMemoryAnchorRegistry, Measurement, MeasurementBatch,
    Point3, PositioningService, ServiceConfig,
};

fn room() -> Vec<Anchor> {
    vec![
        Anchor::new("anchor-1", 0.0, 0.0, 2.5),
        Anchor::new("anchor-2", 20.0, 0.0, 2.5),
        Anchor::new("anchor-3", 0.0, 20.0, 2.5),
        Anchor::new("anchor-4", 20.0, 20.0, 3.0),
    ]
}

fn service_with(config: ServiceConfig, anchors: Vec<Anchor>) -> PositioningService {
    let registry = InMemoryAnchorRegistry::with_anchors(anchors).unwrap();
    PositioningService::from_config(config, Arc::new(registry)).unwrap()
}

fn exact_ranges(tag_id: &str, truth: Point3, anchors: &[Anchor]) -> Vec<Measurement> {
    anchors
        .iter()
        .map(|a| Measurement::new(a.anchor_id.clone(), tag_id, a.position.distance_to(&truth)))
        .collect()
}

fn batch(measurements: Vec<Measurement>) -> MeasurementBatch {
    MeasurementBatch {
        gateway_id: "gateway-simulator-1".to_string(),
        timestamp: Utc::now(),
        measurements,
    }
}

#[tokio::test]
async fn test_room_scenario_recovers_tag() {
    let service = service_with(ServiceConfig::default(), room());
    let truth = Point3::new(10.0, 10.0, 1.0);

    let accepted = service
        .submit_batch(batch(exact_ranges("tag-employee-100", truth, &room())))
        .unwrap();
    let json = serde_json::to_value(&accepted).unwrap();
    assert_eq!(json["status"], "accepted");

    let status = service.wait_for_batch(accepted.batch_id).await.unwrap();
    assert_eq!(status, BatchStatus::Completed { positioned: 1, failed: 0 });

    let fix = service.current_position("tag-employee-100").await.unwrap();
    assert!((fix.x - 10.0).abs() < 1e-3, "x = {}", fix.x);
    assert!((fix.y - 10.0).abs() < 1e-3, "y = {}", fix.y);
    assert!((fix.z - 1.0).abs() < 1e-3, "z = {}", fix.z);
    assert!(fix.accuracy < 1e-3);

    let history = service.tag_history("tag-employee-100", None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].batch_id, accepted.batch_id);
}

#[tokio::test]
async fn test_one_bad_tag_does_not_affect_the_other() {
    let service = service_with(ServiceConfig::default(), room());

    let mut measurements = exact_ranges("tag-a", Point3::new(4.0, 6.0, 1.2), &room());
    measurements.push(Measurement::new("anchor-2", "tag-b", 7.5));

    let accepted = service.submit_batch(batch(measurements)).unwrap();
    let status = service.wait_for_batch(accepted.batch_id).await.unwrap();
    assert_eq!(status, BatchStatus::Completed { positioned: 1, failed: 1 });

    assert!(service.current_position("tag-a").await.is_ok());
    let err = service.current_position("tag-b").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound { resource: "tag", .. }));
    assert!(service.tag_history("tag-b", None).await.unwrap().is_empty());

    let metrics = service.metrics();
    assert_eq!(metrics.tags_positioned, 1);
    assert_eq!(metrics.insufficient_measurements, 1);
}

#[tokio::test]
async fn test_latest_committed_batch_is_current() {
    let service = service_with(ServiceConfig::default(), room());
    let anchors = room();

    assert!(service.current_position("tag-1").await.unwrap_err().is_not_found());

    let first = batch(exact_ranges("tag-1", Point3::new(3.0, 3.0, 1.0), &anchors));
    let first_time = first.timestamp;
    let accepted = service.submit_batch(first).unwrap();
    service.wait_for_batch(accepted.batch_id).await.unwrap();

    let fix = service.current_position("tag-1").await.unwrap();
    assert!((fix.x - 3.0).abs() < 1e-3);
    assert_eq!(fix.timestamp, first_time);

    // An older measurement time still overwrites under the default policy
    let mut second = batch(exact_ranges("tag-1", Point3::new(17.0, 9.0, 1.5), &anchors));
    second.timestamp = first_time - Duration::seconds(30);
    let accepted = service.submit_batch(second).unwrap();
    service.wait_for_batch(accepted.batch_id).await.unwrap();

    let fix = service.current_position("tag-1").await.unwrap();
    assert!((fix.x - 17.0).abs() < 1e-3);
    assert!((fix.y - 9.0).abs() < 1e-3);

    let history = service.tag_history("tag-1", None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!((history[0].position.x - 17.0).abs() < 1e-3);
}

#[tokio::test]
async fn test_newest_measurement_policy_keeps_later_fix() {
    let mut config = ServiceConfig::default();
    config.store.current_position_policy = CurrentPositionPolicy::NewestMeasurementWins;
    let service = service_with(config, room());
    let anchors = room();

    let first = batch(exact_ranges("tag-1", Point3::new(3.0, 3.0, 1.0), &anchors));
    let mut stale = batch(exact_ranges("tag-1", Point3::new(17.0, 9.0, 1.5), &anchors));
    stale.timestamp = first.timestamp - Duration::seconds(30);

    let accepted = service.submit_batch(first).unwrap();
    service.wait_for_batch(accepted.batch_id).await.unwrap();
    let accepted = service.submit_batch(stale).unwrap();
    service.wait_for_batch(accepted.batch_id).await.unwrap();

    let fix = service.current_position("tag-1").await.unwrap();
    assert!((fix.x - 3.0).abs() < 1e-3);
    // The stale fix is still part of the history
    assert_eq!(service.tag_history("tag-1", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_and_inactive_anchors_leave_too_few() {
    let mut anchors = room();
    anchors[3] = anchors[3].clone().inactive();
    let service = service_with(ServiceConfig::default(), anchors.clone());

    let truth = Point3::new(10.0, 5.0, 1.0);
    let mut measurements = exact_ranges("tag-1", truth, &anchors[..2]);
    measurements.push(Measurement::new("anchor-4", "tag-1", anchors[3].position.distance_to(&truth)));
    measurements.push(Measurement::new("anchor-99", "tag-1", 9.0));

    let accepted = service.submit_batch(batch(measurements)).unwrap();
    let status = service.wait_for_batch(accepted.batch_id).await.unwrap();

    assert_eq!(status, BatchStatus::Completed { positioned: 0, failed: 1 });
    assert!(service.current_position("tag-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_removed_tag_keeps_history() {
    let service = service_with(ServiceConfig::default(), room());

    let accepted = service
        .submit_batch(batch(exact_ranges("tag-1", Point3::new(12.0, 4.0, 1.0), &room())))
        .unwrap();
    service.wait_for_batch(accepted.batch_id).await.unwrap();

    service.remove_tag("tag-1").await.unwrap();
    assert!(service.current_position("tag-1").await.unwrap_err().is_not_found());
    assert_eq!(service.tag_history("tag-1", None).await.unwrap().len(), 1);
    assert!(service.list_current_positions().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gateways_many_tags() {
    let service = Arc::new(service_with(ServiceConfig::default(), room()));
    let anchors = room();

    let mut handles = Vec::new();
    for gateway in 0..4 {
        let service = Arc::clone(&service);
        let anchors = anchors.clone();
        handles.push(tokio::spawn(async move {
            let mut measurements = Vec::new();
            for t in 0..5 {
                let truth = Point3::new(2.0 + 3.0 * t as f64, 2.0 + 4.0 * gateway as f64, 1.0);
                measurements.extend(exact_ranges(&format!("tag-{}-{}", gateway, t), truth, &anchors));
            }
            let accepted = service.submit_batch(batch(measurements)).unwrap();
            service.wait_for_batch(accepted.batch_id).await.unwrap()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), BatchStatus::Completed { positioned: 5, failed: 0 });
    }

    let positions = service.list_current_positions().await.unwrap();
    assert_eq!(positions.len(), 20);
    for fix in positions {
        let parts: Vec<usize> = fix.tag_id[4..].split('-').map(|p| p.parse().unwrap()).collect();
        let truth = Point3::new(2.0 + 3.0 * parts[1] as f64, 2.0 + 4.0 * parts[0] as f64, 1.0);
        assert!(Point3::new(fix.x, fix.y, fix.z).distance_to(&truth) < 1e-3, "{:?}", fix);
    }
}

#[tokio::test]
async fn test_sled_backend_persists_positions() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServiceConfig::default();
    config.store = StoreConfig {
        backend: StoreBackend::Sled {
            path: dir.path().join("positions"),
        },
        ..StoreConfig::default()
    };

    let service = service_with(config, room());
    let accepted = service
        .submit_batch(batch(exact_ranges("tag-1", Point3::new(10.0, 10.0, 1.0), &room())))
        .unwrap();
    let status = service.wait_for_batch(accepted.batch_id).await.unwrap();
    assert_eq!(status, BatchStatus::Completed { positioned: 1, failed: 0 });

    let fix = service.current_position("tag-1").await.unwrap();
    assert!((fix.z - 1.0).abs() < 1e-3);
}
