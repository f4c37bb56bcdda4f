#![allow(dead_code)]

use flate2::read::GzDecoder;
use rask_apm_client::ClientConfig;
use serde_json::Value;
use std::io::Read;
use std::time::Duration;
use wiremock::{MockServer, Request};

pub const INTAKE_PATH: &str = "/intake/v2/events";
pub const CONFIG_PATH: &str = "/config/v1/agents";

/// A client configuration pointed at the mock server, without cloud
/// metadata or config polling.
pub fn test_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::new(server.uri(), "checkout");
    config.environment = Some("test".to_string());
    config.secret_token = Some("s3cr3t".to_string());
    config
}

/// Decompresses an intake body into its NDJSON documents.
pub fn decode_body(request: &Request) -> Vec<Value> {
    let mut text = String::new();
    GzDecoder::new(request.body.as_slice())
        .read_to_string(&mut text)
        .expect("intake body must be gzip");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("each line must be JSON"))
        .collect()
}

pub async fn intake_requests(server: &MockServer) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.url.path() == INTAKE_PATH)
        .collect()
}

/// Polls the mock server until it has seen `count` intake requests.
pub async fn wait_for_requests(server: &MockServer, count: usize, limit: Duration) -> Vec<Request> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let requests = intake_requests(server).await;
        if requests.len() >= count || tokio::time::Instant::now() >= deadline {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
