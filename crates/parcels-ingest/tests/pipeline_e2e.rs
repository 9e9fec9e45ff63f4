//! End-to-end pipeline tests against a mocked staging service
//!
//! These tests exercise the full parse → batch → upload → transfer → archive
//! path over the wire: a wiremock server stands in for the PostgREST surface
//! and temp directories stand in for the source/archive filesystem.

use parcels_ingest::config::{IngestConfig, ServiceConfig};
use parcels_ingest::pipeline::Pipeline;
use parcels_ingest::store::RestStore;
use parcels_ingest::uploader::RetryPolicy;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, source: &TempDir, archive: &TempDir) -> IngestConfig {
    IngestConfig {
        source_dir: source.path().to_path_buf(),
        archive_dir: archive.path().to_path_buf(),
        workers: 2,
        batch_size: 1,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
        service: ServiceConfig {
            base_url: server.uri(),
            api_key: "test-key".to_string(),
            staging_table: "parcels_staging".to_string(),
            transfer_fn: "transfer_staged_parcels".to_string(),
            request_timeout: Duration::from_secs(5),
        },
    }
}

fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let file_path = dir.path().join(name);
    std::fs::write(&file_path, content).unwrap();
    file_path
}

async fn run_pipeline(
    server: &MockServer,
    source: &TempDir,
    archive: &TempDir,
) -> parcels_ingest::progress::RunSummary {
    let config = config_for(server, source, archive);
    let store = Arc::new(RestStore::new(&config.service).unwrap());
    Pipeline::new(config, store)
        .run(CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn two_rows_with_batch_size_one_make_two_inserts_then_one_transfer() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/parcels_staging"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/transfer_staged_parcels"))
        .respond_with(ResponseTemplate::new(200).set_body_string("2"))
        .expect(1)
        .mount(&server)
        .await;

    let source = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    let source_path = write_csv(&source, "alachua_2025.csv", "parcel_id,owner\n001,Smith\n002,Jones\n");

    let summary = run_pipeline(&server, &source, &archive).await;

    assert_eq!(summary.records_staged, 2);
    assert_eq!(summary.files_completed, 1);
    assert_eq!(summary.files_failed, 0);
    assert!(!source_path.exists());
    assert!(archive.path().join("alachua_2025.csv").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn uploaded_payload_uses_normalized_columns_and_nulls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/parcels_staging"))
        .and(body_json(json!([{
            "parcel_id": "001",
            "owner_name": "Smith, John \"Jack\"",
            "just_value": null
        }])))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/transfer_staged_parcels"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1"))
        .mount(&server)
        .await;

    let source = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    write_csv(
        &source,
        "baker.csv",
        "Parcel_ID, OWNER_NAME ,Just_Value\n001,\"Smith, John \"\"Jack\"\"\",\"\"\n",
    );

    let summary = run_pipeline(&server, &source, &archive).await;
    assert_eq!(summary.records_staged, 1);
    assert_eq!(summary.files_completed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn always_failing_service_fails_file_and_leaves_it_in_place() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/parcels_staging"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        // One batch, three attempts.
        .expect(3)
        .mount(&server)
        .await;

    let source = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    let source_path = write_csv(&source, "clay.csv", "parcel_id\n001\n");

    let summary = run_pipeline(&server, &source, &archive).await;

    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.batches_failed, 1);
    assert!(summary.failures[0].reason.contains("permanently failed"));
    // Solely in the source directory, ready for a retry run.
    assert!(source_path.exists());
    assert!(!archive.path().join("clay.csv").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_failure_fails_the_file_after_successful_staging() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/parcels_staging"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/transfer_staged_parcels"))
        .respond_with(ResponseTemplate::new(500).set_body_string("deadlock detected"))
        .mount(&server)
        .await;

    let source = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    let source_path = write_csv(&source, "duval.csv", "parcel_id\n001\n");

    let summary = run_pipeline(&server, &source, &archive).await;

    assert_eq!(summary.records_staged, 1);
    assert_eq!(summary.files_failed, 1);
    assert!(summary.failures[0].reason.contains("transfer failed"));
    assert!(source_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried_and_the_file_still_completes() {
    let server = MockServer::start().await;

    // Fail the first two attempts, then accept everything.
    Mock::given(method("POST"))
        .and(path("/rest/v1/parcels_staging"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/parcels_staging"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/transfer_staged_parcels"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1"))
        .mount(&server)
        .await;

    let source = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    write_csv(&source, "lee.csv", "parcel_id\n001\n");

    let summary = run_pipeline(&server, &source, &archive).await;

    assert_eq!(summary.files_completed, 1);
    assert_eq!(summary.records_staged, 1);
    assert!(archive.path().join("lee.csv").exists());
}
