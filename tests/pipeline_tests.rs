//! End-to-end tests for the prediction pipeline
//!
//! Quota Guard -> Backend Selector -> Prediction Cache -> Backend -> Assembler

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use leafscan_rust_node::quota::SystemClock;
use leafscan_rust_node::{
    decode, BackendKind, BackendProbe, CallerIdentity, ClassTaxonomy, DiagnosisOutcome,
    InferenceBackend, ManualClock, PredictionCache,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 9, 30, 0).unwrap()))
}

#[tokio::test]
async fn test_repeated_filename_is_bit_identical_through_cache() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    // Random backend re-rolls on every call; only the cache keeps it stable
    let service = service_with(vec![random_probe(&taxonomy)], Arc::new(SystemClock));
    let user = CallerIdentity::authenticated("10.1.1.1");

    let first = service.diagnose(png("IMG_7781.png"), &user).await;
    let second = service.diagnose(png("IMG_7781.png"), &user).await;

    let (a, b) = (first.response().unwrap(), second.response().unwrap());
    assert_eq!(a.backend, BackendKind::Random);
    assert_eq!(a.class_name, b.class_name);
    assert_eq!(a.confidence.to_bits(), b.confidence.to_bits());
    assert_eq!(a.top_predictions, b.top_predictions);
    assert_eq!(a.processing_time_ms, b.processing_time_ms);
    assert_eq!(service.cache_stats().hits, 1);
}

#[tokio::test]
async fn test_cache_returns_stored_result_without_recompute() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    let backend = assert_ok!(random_probe(&taxonomy).init().await);
    let cache = PredictionCache::new(10);
    let calls = AtomicUsize::new(0);

    let image = leafscan_rust_node::PreparedImage {
        bytes: bytes::Bytes::from_static(PNG_HEADER),
        original_filename: "leaf_01.png".to_string(),
        mime_type: "image/png".to_string(),
    };

    let mut seen = Vec::new();
    for _ in 0..5 {
        let result = cache
            .get_or_compute("leaf_01.png", || {
                calls.fetch_add(1, Ordering::SeqCst);
                backend.predict(&image)
            })
            .await
            .unwrap();
        seen.push(result);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
    assert!(cache.get("leaf_02.png").is_none());
}

#[test]
fn test_taxonomy_decoding_examples() {
    let corn = decode("Corn___Common_rust_");
    assert_eq!(corn.plant_name, "Corn");
    assert_eq!(corn.disease_name, "Common rust");
    assert!(!corn.is_healthy);

    let tomato = decode("Tomato healthy");
    assert_eq!(tomato.plant_name, "Tomato");
    assert_eq!(tomato.disease_name, "healthy");
    assert!(tomato.is_healthy);
}

#[tokio::test]
async fn test_quota_allows_twice_blocks_then_resets() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    let clock = manual_clock();
    let service = service_with(vec![heuristic_probe(&taxonomy)], clock.clone());
    let guest = CallerIdentity::guest("203.0.113.50");

    let first = service.diagnose(png("potato_late.png"), &guest).await;
    assert_eq!(first.response().unwrap().remaining_detections, Some(1));

    clock.advance(Duration::from_secs(300));
    let second = service.diagnose(png("tomato_mosaic.png"), &guest).await;
    assert_eq!(second.response().unwrap().remaining_detections, Some(0));

    let third = service.diagnose(png("corn_rust.png"), &guest).await;
    match &third {
        DiagnosisOutcome::QuotaExceeded(q) => {
            assert!(q.blocked);
            assert_eq!(q.remaining_detections, 0);
            assert_eq!(
                q.reset_at,
                Utc.with_ymd_and_hms(2024, 3, 11, 9, 30, 0).unwrap()
            );
        }
        other => panic!("expected quota block, got {:?}", other),
    }

    let json = serde_json::to_value(&third).unwrap();
    assert_eq!(json["blocked"], true);
    assert_eq!(json["remainingDetections"], 0);
    assert!(json["resetAt"].is_string());

    clock.advance(Duration::from_secs(24 * 3600));
    let fourth = service.diagnose(png("corn_rust.png"), &guest).await;
    assert!(fourth.response().is_some());

    let record = service.quota_record("203.0.113.50").unwrap();
    assert_eq!(record.count, 1);
    assert!(!record.blocked);
}

#[tokio::test]
async fn test_quota_is_per_identity() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    let service = service_with(vec![heuristic_probe(&taxonomy)], manual_clock());

    let a = CallerIdentity::guest("198.51.100.1");
    let b = CallerIdentity::guest("198.51.100.2");
    for name in ["a1.png", "a2.png"] {
        assert!(service.diagnose(png(name), &a).await.response().is_some());
    }
    assert_eq!(
        service.diagnose(png("a3.png"), &a).await.error_kind(),
        Some("QuotaExceeded")
    );
    assert!(service.diagnose(png("b1.png"), &b).await.response().is_some());
}

#[tokio::test]
async fn test_authenticated_callers_never_get_quota_record() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    let service = service_with(vec![heuristic_probe(&taxonomy)], manual_clock());
    let user = CallerIdentity::authenticated("192.0.2.77");

    for i in 0..6 {
        let outcome = service.diagnose(png(&format!("leaf_{i}.png")), &user).await;
        let response = outcome.response().unwrap();
        assert_eq!(response.remaining_detections, None);
    }
    assert!(service.quota_record("192.0.2.77").is_none());
}

#[tokio::test]
async fn test_failed_prediction_consumes_no_quota() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = service_with(
        vec![Arc::new(BrokenProbe {
            calls: calls.clone(),
            delay: Duration::ZERO,
        })],
        manual_clock(),
    );
    let guest = CallerIdentity::guest("203.0.113.8");

    for _ in 0..4 {
        let outcome = service.diagnose(png("leaf.png"), &guest).await;
        assert_eq!(outcome.error_kind(), Some("PredictionFailed"));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Prediction failed. Please try again.");
    }

    // Failures are not cached, every request reached the backend
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(service.bound_kind(), Some(BackendKind::Real));

    let record = service.quota_record("203.0.113.8").unwrap();
    assert_eq!(record.count, 0);
    assert!(!record.blocked);
}

#[tokio::test]
async fn test_concurrent_guest_requests_do_not_over_admit() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    let service = Arc::new(service_with(vec![heuristic_probe(&taxonomy)], manual_clock()));
    let guest = CallerIdentity::guest("203.0.113.99");

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let service = service.clone();
            let guest = guest.clone();
            tokio::spawn(async move { service.diagnose(png(&format!("c{i}.png")), &guest).await })
        })
        .collect();

    let mut allowed = 0;
    for outcome in futures::future::join_all(tasks).await {
        if outcome.unwrap().response().is_some() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 2);
    assert_eq!(service.quota_record("203.0.113.99").unwrap().count, 2);
}

#[tokio::test]
async fn test_every_backend_result_is_a_distribution() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    let user = CallerIdentity::authenticated("10.0.0.9");

    for probe in [heuristic_probe(&taxonomy), random_probe(&taxonomy)] {
        let backend = probe.init().await.unwrap();
        for name in ["RS_NLB 1234.JPG", "tomato_target.png", "daun_sehat.jpg", "x.webp"] {
            let image = png(name)
                .prepare(&leafscan_rust_node::config::UploadConfig::default())
                .await
                .unwrap();
            let result = backend.predict(&image).await.unwrap();

            let sum: f64 = result.probabilities.values().sum();
            assert!((sum - 1.0).abs() < 1e-6, "{} sums to {}", name, sum);
            assert_eq!(result.probabilities[&result.class_name], result.confidence);
            assert_eq!(result.probabilities.len(), taxonomy.len());
            assert!(result.probabilities.values().all(|p| *p >= 0.0));
        }
    }

    // And the assembled response agrees with the winning class
    let service = service_with(vec![heuristic_probe(&taxonomy)], manual_clock());
    let outcome = service.diagnose(png("RS_NLB 1234.JPG"), &user).await;
    let response = outcome.response().unwrap();
    assert_eq!(response.class_name, "Corn_(maize)___Northern_Leaf_Blight");
    assert_eq!(response.plant.name, "Corn");
    assert_eq!(response.disease, "Northern Leaf Blight");
    assert_eq!(response.top_predictions[0].confidence, response.confidence);
}

#[tokio::test]
async fn test_guest_rejected_by_failing_in_flight_requests_is_not_blocked() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Arc::new(service_with(
        vec![Arc::new(BrokenProbe {
            calls: calls.clone(),
            delay: Duration::from_millis(200),
        })],
        manual_clock(),
    ));
    let guest = CallerIdentity::guest("203.0.113.21");

    let in_flight: Vec<_> = ["slow_1.png", "slow_2.png"]
        .into_iter()
        .map(|name| {
            let service = service.clone();
            let guest = guest.clone();
            tokio::spawn(async move { service.diagnose(png(name), &guest).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Both detections are reserved by requests still running
    let rejected = service.diagnose(png("third.png"), &guest).await;
    assert_eq!(rejected.error_kind(), Some("QuotaExceeded"));

    for outcome in futures::future::join_all(in_flight).await {
        assert_eq!(assert_ok!(outcome).error_kind(), Some("PredictionFailed"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let record = service.quota_record("203.0.113.21").unwrap();
    assert_eq!(record.count, 0);
    assert!(!record.blocked);
    assert!(record.blocked_at.is_none());
}

#[tokio::test]
async fn test_nearly_normalised_model_scores_become_a_distribution() {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    // Sums to 1.0004, as a model exporting rounded probabilities might
    let mut scores = vec![0.01_f32; taxonomy.len()];
    scores[2] = 0.8404;
    let probe = ScoredProbe {
        taxonomy: taxonomy.clone(),
        scores,
    };

    let backend = assert_ok!(probe.init().await);
    let image = assert_ok!(
        png("field_photo.jpg")
            .prepare(&leafscan_rust_node::config::UploadConfig::default())
            .await
    );
    let result = assert_ok!(backend.predict(&image).await);

    let sum: f64 = result.probabilities.values().sum();
    assert!((sum - 1.0).abs() < 1e-6, "sums to {}", sum);
    assert!(result.is_well_formed(&taxonomy));
    assert_eq!(result.class_name, "Corn_(maize)___Northern_Leaf_Blight");

    let service = service_with(vec![Arc::new(probe)], manual_clock());
    let outcome = service
        .diagnose(png("field_photo.jpg"), &CallerIdentity::authenticated("10.0.0.5"))
        .await;
    let response = outcome.response().unwrap();
    assert_eq!(response.backend, BackendKind::Real);
    assert_eq!(response.confidence, result.confidence);
    assert!(response.confidence < 0.8404);
}
