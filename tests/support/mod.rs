//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use objsync_core::{Config, Signer, UploadPolicy};
use url::Url;
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic signer for tests: the "token" is just the policy scope.
#[derive(Debug)]
pub struct FakeSigner;

impl Signer for FakeSigner {
    fn sign_upload_policy(&self, policy: &UploadPolicy) -> String {
        format!("fake-token:{}", policy.scope)
    }

    fn authorization(&self, _method: &str, _url: &Url, _body: Option<&[u8]>) -> Option<String> {
        Some("QBox fake-management".to_string())
    }
}

/// Config pointing every host class at one mock server.
#[allow(dead_code)]
pub fn config_for(server_uri: &str, bucket: &str) -> Config {
    Config {
        up_hosts: vec![server_uri.to_string()],
        io_hosts: vec![server_uri.to_string()],
        rs_hosts: vec![server_uri.to_string()],
        rsf_hosts: vec![server_uri.to_string()],
        bucket: bucket.to_string(),
        ak: "test-ak".to_string(),
        sk: "test-sk".to_string(),
        part_size_mib: 4,
        up_concurrency: 2,
        retry: 3,
        ..Config::default()
    }
}

/// In-memory part store backing an honest mock of the multipart endpoints:
/// PUT bodies are kept, the echoed `md5` really is the body's MD5, and the
/// completed object is the parts concatenated in `partNumber` order.
#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
pub struct PartStore {
    parts: Arc<Mutex<HashMap<usize, Vec<u8>>>>,
    completed: Arc<Mutex<Option<Vec<u8>>>>,
}

#[allow(dead_code)]
impl PartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responder for `PUT .../uploads/<id>/<n>`.
    pub fn part_responder(&self) -> PartPutResponder {
        PartPutResponder {
            store: self.clone(),
        }
    }

    /// Responder for `POST .../uploads/<id>` (complete).
    pub fn complete_responder(&self) -> CompleteResponder {
        CompleteResponder {
            store: self.clone(),
        }
    }

    /// The object as committed by the complete step, if any.
    pub fn completed_object(&self) -> Option<Vec<u8>> {
        self.completed.lock().unwrap().clone()
    }

    pub fn stored_part_count(&self) -> usize {
        self.parts.lock().unwrap().len()
    }

    /// Responder serving the committed object on GET.
    pub fn serve_responder(&self) -> ServeCompleted {
        ServeCompleted {
            store: self.clone(),
        }
    }
}

/// Responder serving the completed object back on GET, 404 before commit.
#[derive(Debug)]
pub struct ServeCompleted {
    store: PartStore,
}

impl Respond for ServeCompleted {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        match self.store.completed_object() {
            Some(object) => ResponseTemplate::new(200).set_body_bytes(object),
            None => ResponseTemplate::new(404),
        }
    }
}

#[derive(Debug)]
pub struct PartPutResponder {
    store: PartStore,
}

impl Respond for PartPutResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let part_number: usize = request
            .url
            .path_segments()
            .and_then(|segments| segments.last())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let body = request.body.clone();
        let md5 = hex::encode(md5::compute(&body).0);
        self.store
            .parts
            .lock()
            .unwrap()
            .insert(part_number, body);
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "etag": format!("etag-{part_number}"),
            "md5": md5,
        }))
    }
}

#[derive(Debug)]
pub struct CompleteResponder {
    store: PartStore,
}

impl Respond for CompleteResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let Some(parts) = body["parts"].as_array() else {
            return ResponseTemplate::new(400);
        };

        let stored = self.store.parts.lock().unwrap();
        let mut object = Vec::new();
        let mut expected = 1;
        for part in parts {
            let number = part["partNumber"].as_u64().unwrap_or(0) as usize;
            // The contract: parts arrive strictly ordered by partNumber.
            if number != expected {
                return ResponseTemplate::new(400);
            }
            expected += 1;
            let Some(bytes) = stored.get(&number) else {
                return ResponseTemplate::new(612);
            };
            object.extend_from_slice(bytes);
        }
        *self.store.completed.lock().unwrap() = Some(object);
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "hash": "fake-hash",
            "key": "committed",
        }))
    }
}
