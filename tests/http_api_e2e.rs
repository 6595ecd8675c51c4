//! End-to-end exercise of the HTTP surface against an in-process server
//! wired with the deterministic stub embedder, the in-memory descriptor
//! store, and the in-process cache tier.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use reqwest::StatusCode;
use tempfile::TempDir;
use tokio::time::sleep;

use visage_db::api::{create_router, ServiceState};
use visage_db::batch::BatchEngine;
use visage_db::cache::ResultCache;
use visage_db::config::RecognitionConfig;
use visage_db::embedder::StubEmbedder;
use visage_db::index::FaceIndex;
use visage_db::metrics::Metrics;
use visage_db::recognizer::Recognizer;
use visage_db::store::MemoryStore;

fn png_base64(tint: u8) -> String {
    let img = image::RgbImage::from_fn(256, 256, |x, y| {
        image::Rgb([tint, (x % 256) as u8, (y % 256) as u8])
    });
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("png encode");
    BASE64.encode(buf)
}

async fn start_server(dir: &TempDir) -> String {
    let config = RecognitionConfig::from_data_dir(dir.path().to_path_buf());
    let metrics = Arc::new(Metrics::new());

    let mut index = FaceIndex::new(
        config.index,
        config.persist_every,
        config.index_path.clone(),
        config.meta_path.clone(),
    );
    index.init().expect("index init");

    let cache = Arc::new(ResultCache::connect(None, config.cache_ttl, config.cache_max_size).await);

    let recognizer = Arc::new(Recognizer::new(
        Arc::new(StubEmbedder),
        Arc::new(MemoryStore::new()),
        Arc::new(RwLock::new(index)),
        cache,
        metrics.clone(),
        Arc::new(RwLock::new(config)),
    ));

    let batch = Arc::new(BatchEngine::new(
        recognizer.clone(),
        metrics.clone(),
        50,
        4,
        Duration::from_secs(3600),
    ));

    let state = Arc::new(ServiceState {
        recognizer,
        batch,
        metrics,
        started_at: Instant::now(),
    });
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    format!("http://{}", addr)
}

async fn register(
    client: &reqwest::Client,
    base_url: &str,
    external_id: &str,
    image: &str,
) -> reqwest::Response {
    client
        .post(format!("{}/recognition/register", base_url))
        .json(&serde_json::json!({
            "externalId": external_id,
            "displayName": "Ada",
            "clientRef": "client-1",
            "image": image,
        }))
        .send()
        .await
        .expect("register request")
}

async fn recognize(
    client: &reqwest::Client,
    base_url: &str,
    image: &str,
) -> reqwest::Response {
    client
        .post(format!("{}/recognition/recognize", base_url))
        .json(&serde_json::json!({ "image": image }))
        .send()
        .await
        .expect("recognize request")
}

#[tokio::test]
async fn enroll_then_identify_self() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();
    let image = png_base64(1);

    let resp = register(&client, &base_url, "A1", &image).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["externalId"].as_str(), Some("A1"));
    assert!(body["data"]["confidence"].as_f64().unwrap() > 0.0);

    let resp = recognize(&client, &base_url, &image).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    let matched = &body["data"]["match"];
    assert_eq!(matched["externalId"].as_str(), Some("A1"));
    assert!(matched["distance"].as_f64().unwrap() < 0.1);
    assert!(matched["similarity"].as_i64().unwrap() >= 90);
}

#[tokio::test]
async fn recognize_unenrolled_is_not_found_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let resp = recognize(&client, &base_url, &png_base64(2)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str(), Some("no_match"));

    let metrics_text = client
        .get(format!("{}/metrics", base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        metrics_text
            .contains("recognition_total{status=\"not_found\",mode=\"single\"} 1"),
        "metrics should count the not_found recognition"
    );
}

#[tokio::test]
async fn duplicate_enroll_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let first_image = png_base64(3);
    let resp = register(&client, &base_url, "A1", &first_image).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = register(&client, &base_url, "A1", &png_base64(4)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str(), Some("duplicate"));

    // First enrollment still answers for its image
    let resp = recognize(&client, &base_url, &first_image).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn update_changes_identity() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let image_one = png_base64(5);
    let image_two = png_base64(6);

    let resp = register(&client, &base_url, "A1", &image_one).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = client
        .put(format!("{}/recognition/update", base_url))
        .json(&serde_json::json!({ "externalId": "A1", "image": image_two }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = recognize(&client, &base_url, &image_one).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = recognize(&client, &base_url, &image_two).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["match"]["externalId"].as_str(), Some("A1"));
}

#[tokio::test]
async fn update_unknown_user_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{}/recognition/update", base_url))
        .json(&serde_json::json!({ "externalId": "ghost", "image": png_base64(7) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str(), Some("not_found"));
}

#[tokio::test]
async fn bad_base64_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let resp = recognize(&client, &base_url, "!!not-base64!!").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"].as_str(), Some("invalid_image"));
}

#[tokio::test]
async fn batch_of_three_mixed() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let image_a = png_base64(8);
    let resp = register(&client, &base_url, "A", &image_a).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = client
        .post(format!("{}/recognition/batch", base_url))
        .json(&serde_json::json!({
            "images": [
                { "id": "x", "image": image_a },
                { "id": "y", "image": png_base64(9) },
                { "id": "z", "image": BASE64.encode(b"garbage") },
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = resp.json().await.unwrap();
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["total"].as_u64(), Some(3));

    let mut job = serde_json::Value::Null;
    for _ in 0..200 {
        let resp = client
            .get(format!("{}/recognition/batch/{}", base_url, job_id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        let status = body["data"]["status"].as_str().unwrap_or_default().to_string();
        job = body["data"].clone();
        if status == "completed" || status == "failed" {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(job["status"].as_str(), Some("completed"));
    assert_eq!(job["processed"].as_u64(), Some(3));
    assert_eq!(job["progress"].as_u64(), Some(100));

    let results = job["results"].as_array().unwrap();
    let errors = job["errors"].as_array().unwrap();
    assert_eq!(results.len() + errors.len(), 3);

    let matched: Vec<_> = results
        .iter()
        .filter(|r| !r["match"].is_null())
        .collect();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0]["itemId"].as_str(), Some("x"));

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["itemId"].as_str(), Some("z"));

    // Listing shows the job newest-first
    let resp = client
        .get(format!("{}/recognition/batch", base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"][0]["id"].as_str(), Some(job_id.as_str()));

    // All three images counted by the batch metric
    let metrics_text = client
        .get(format!("{}/metrics", base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let batch_image_total: u64 = metrics_text
        .lines()
        .filter(|l| l.starts_with("batch_images_total{"))
        .filter_map(|l| l.rsplit(' ').next())
        .filter_map(|v| v.parse::<u64>().ok())
        .sum();
    assert_eq!(batch_image_total, 3);
}

#[tokio::test]
async fn stats_and_health_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    register(&client, &base_url, "A1", &png_base64(10)).await;

    let resp = client
        .get(format!("{}/recognition/stats", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["index"]["live_vectors"].as_u64(), Some(1));
    assert_eq!(body["data"]["activeUsers"].as_u64(), Some(1));
    assert_eq!(body["data"]["cacheBackend"].as_str(), Some("memory"));

    let resp = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .get(format!("{}/health/detailed", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["status"].as_str(), Some("ok"));
    assert_eq!(body["data"]["index"]["healthy"].as_bool(), Some(true));
}

#[tokio::test]
async fn request_id_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/health", base_url))
        .header("x-request-id", "req-fixed-42")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-fixed-42")
    );

    // Absent inbound id, one is minted
    let resp = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn rebuild_endpoint_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = start_server(&dir).await;
    let client = reqwest::Client::new();

    register(&client, &base_url, "A1", &png_base64(11)).await;

    let resp = client
        .post(format!("{}/recognition/index/rebuild", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // The rebuild runs detached; recognition keeps working afterwards
    for _ in 0..100 {
        sleep(Duration::from_millis(20)).await;
        let resp = recognize(&client, &base_url, &png_base64(11)).await;
        if resp.status() == StatusCode::OK {
            return;
        }
    }
    panic!("recognition did not succeed after rebuild");
}
