//! Integration tests for the upload paths against a mock service.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use objsync_core::{
    ApiError, BytesPartSource, Config, Dotter, HttpClient, Uploader, UploadExtra,
};
use support::{config_for, FakeSigner, PartStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MIB: usize = 1024 * 1024;

/// `"obj"` in URL-safe base64 without padding.
const ENC_OBJ: &str = "b2Jq";

fn uploader(config: &Config) -> Uploader {
    Uploader::new(
        config,
        HttpClient::data(config),
        Arc::new(FakeSigner),
        None,
        None,
    )
    .with_retry_delays(Duration::from_millis(10), Duration::from_millis(10))
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn mount_init(server: &MockServer, upload_id: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadId": upload_id,
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_multipart_happy_path_part_sizes_and_ordered_complete() {
    let server = MockServer::start().await;
    let store = PartStore::new();
    mount_init(&server, "uid-1").await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/buckets/bkt/objects/[^/]+/uploads/uid-1/\d+$"))
        .respond_with(store.part_responder())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads/uid-1")))
        .respond_with(store.complete_responder())
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let data = patterned(10 * MIB);
    let callback_log: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&callback_log);

    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(data.clone())),
            data.len() as u64,
            &UploadExtra::default(),
            Some(Arc::new(move |number, etag| {
                log.lock().unwrap().push((number, etag.to_string()));
            })),
        )
        .await;
    assert!(result.is_ok(), "expected Ok, got {result:?}");

    // 10 MiB at 4 MiB parts: exactly [4 MiB, 4 MiB, 2 MiB].
    let requests = server.received_requests().await.unwrap();
    let mut part_sizes: Vec<(usize, usize)> = requests
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| {
            let number: usize = r
                .url
                .path_segments()
                .and_then(|s| s.last())
                .and_then(|n| n.parse().ok())
                .unwrap();
            (number, r.body.len())
        })
        .collect();
    part_sizes.sort_unstable();
    assert_eq!(
        part_sizes,
        vec![(1, 4 * MIB), (2, 4 * MIB), (3, 2 * MIB)]
    );

    // The complete body carried the parts strictly ordered (the mock
    // rejects any other order) and the object reassembled byte-exactly.
    assert_eq!(store.completed_object().unwrap(), data);

    // The part callback saw all three parts.
    let mut seen: Vec<usize> = callback_log.lock().unwrap().iter().map(|(n, _)| *n).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_rate_limited_part_retries_without_burning_budget() {
    let server = MockServer::start().await;
    let store = PartStore::new();
    mount_init(&server, "uid-rl").await;
    // Six 509 answers: more than the whole retry budget. Only because
    // rate-limit retries are free can the seventh attempt get through.
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-rl/1$"))
        .respond_with(ResponseTemplate::new(509))
        .up_to_n_times(6)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-rl/1$"))
        .respond_with(store.part_responder())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads/uid-rl")))
        .respond_with(store.complete_responder())
        .mount(&server)
        .await;

    let dot_dir = TempDir::new().unwrap();
    let mut config = config_for(&server.uri(), "bkt");
    config.monitor_hosts = vec!["http://monitor.invalid".to_string()];
    config.dot_interval_s = 3600;
    let dotter = Dotter::new(
        &config,
        HttpClient::control(&config),
        Arc::new(FakeSigner),
        dot_dir.path(),
    );
    let uploader = Uploader::new(
        &config,
        HttpClient::data(&config),
        Arc::new(FakeSigner),
        None,
        dotter,
    )
    .with_retry_delays(Duration::from_millis(10), Duration::from_millis(10));

    let data = patterned(64 * 1024);
    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(data.clone())),
            data.len() as u64,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(result.is_ok(), "expected Ok, got {result:?}");
    assert_eq!(store.completed_object().unwrap(), data);

    // Telemetry: six failed part attempts, one successful.
    let log = std::fs::read_to_string(dot_dir.path().join("dot-file")).unwrap();
    let part_records: Vec<serde_json::Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .filter(|r: &serde_json::Value| r["a"] == "upload_part")
        .collect();
    assert_eq!(part_records.len(), 7);
    let failed = part_records
        .iter()
        .filter(|r| r["f"].as_bool().unwrap_or(false))
        .count();
    assert_eq!(failed, 6);
}

#[tokio::test]
async fn test_poisoned_part_cancels_and_deletes_session() {
    let server = MockServer::start().await;
    let store = PartStore::new();
    mount_init(&server, "uid-bad").await;
    // Part 1 is rejected outright; part 2 would succeed.
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-bad/1$"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-bad/2$"))
        .respond_with(store.part_responder())
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads/uid-bad")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let data = patterned(5 * MIB);
    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(data.clone())),
            data.len() as u64,
            &UploadExtra::default(),
            None,
        )
        .await;

    // The 400 surfaces unchanged and no commit ever happened.
    assert!(
        matches!(result, Err(ApiError::Status { status: 400, .. })),
        "expected the 400 to surface, got {result:?}"
    );
    assert!(store.completed_object().is_none());
}

#[tokio::test]
async fn test_md5_mismatch_retries_then_fails_and_aborts() {
    let server = MockServer::start().await;
    mount_init(&server, "uid-md5").await;
    // The echoed md5 never matches what was sent.
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-md5/1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "etag": "etag-1",
            "md5": "00000000000000000000000000000000",
        })))
        .expect(5)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"/uploads/uid-md5$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let data = patterned(8 * 1024);
    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(data.clone())),
            data.len() as u64,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(
        matches!(result, Err(ApiError::Md5Mismatch { part_number: 1, .. })),
        "expected md5 mismatch, got {result:?}"
    );
}

#[tokio::test]
async fn test_complete_alias_treated_as_success() {
    let server = MockServer::start().await;
    let store = PartStore::new();
    mount_init(&server, "uid-alias").await;
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-alias/\d+$"))
        .respond_with(store.part_responder())
        .mount(&server)
        .await;
    // A prior attempt already committed the object.
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads/uid-alias")))
        .respond_with(ResponseTemplate::new(614))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let data = patterned(8 * 1024);
    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(data)),
            8 * 1024,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(result.is_ok(), "614 must alias to success, got {result:?}");
}

#[tokio::test]
async fn test_suggested_part_size_honoured_verbatim() {
    let server = MockServer::start().await;
    let store = PartStore::new();
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadId": "uid-sps",
            "suggestedPartSize": 5 * MIB,
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-sps/\d+$"))
        .respond_with(store.part_responder())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads/uid-sps")))
        .respond_with(store.complete_responder())
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    // 10 MiB at the suggested 5 MiB: two parts instead of three.
    let data = patterned(10 * MIB);
    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(data.clone())),
            data.len() as u64,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(result.is_ok(), "expected Ok, got {result:?}");
    assert_eq!(store.stored_part_count(), 2);
    assert_eq!(store.completed_object().unwrap(), data);
}

#[tokio::test]
async fn test_stream_upload_is_strictly_sequential() {
    let server = MockServer::start().await;
    let store = PartStore::new();
    mount_init(&server, "uid-seq").await;
    Mock::given(method("PUT"))
        .and(path_regex(r"/uploads/uid-seq/\d+$"))
        .respond_with(store.part_responder())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/buckets/bkt/objects/{ENC_OBJ}/uploads/uid-seq")))
        .respond_with(store.complete_responder())
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let data = patterned(9 * MIB);
    let mut reader = std::io::Cursor::new(data.clone());
    let result = uploader
        .stream_upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            &mut reader,
            data.len() as u64,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(result.is_ok(), "expected Ok, got {result:?}");
    assert_eq!(store.completed_object().unwrap(), data);

    // Sequential source: the PUTs arrive in ascending part order.
    let requests = server.received_requests().await.unwrap();
    let put_order: Vec<usize> = requests
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| {
            r.url
                .path_segments()
                .and_then(|s| s.last())
                .and_then(|n| n.parse().ok())
                .unwrap()
        })
        .collect();
    assert_eq!(put_order, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_empty_source_rejected_before_any_request() {
    let server = MockServer::start().await;
    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let result = uploader
        .upload(
            &CancellationToken::new(),
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(Vec::new())),
            0,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(matches!(result, Err(ApiError::InvalidInput { .. })));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pre_cancelled_upload_returns_cancelled() {
    let server = MockServer::start().await;
    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = uploader
        .upload(
            &cancel,
            "fake-token:bkt:obj",
            Some("obj"),
            Arc::new(BytesPartSource::new(patterned(1024))),
            1024,
            &UploadExtra::default(),
            None,
        )
        .await;
    assert!(matches!(result, Err(ApiError::Cancelled)));
}

#[tokio::test]
async fn test_small_file_takes_single_request_form_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "hash": "h",
            "key": "small.bin",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let file_path = dir.path().join("small.bin");
    std::fs::write(&file_path, patterned(64 * 1024)).unwrap();

    let config = config_for(&server.uri(), "bkt");
    let uploader = uploader(&config);
    let result = uploader.upload_file(&file_path, "small.bin").await;
    assert!(result.is_ok(), "expected Ok, got {result:?}");

    // One multipart/form-data POST carrying the signed token, no session
    // endpoints involved.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let content_type = requests[0]
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data"));
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("fake-token:bkt:small.bin"));
}
