mod common;

use common::{CONFIG_PATH, test_config};
use parking_lot::RwLock;
use rask_apm_client::central_config::{ConfigCache, ConfigPoller, MAX_POLL_DELAY, PollOutcome};
use rask_apm_client::client::Notifier;
use rask_apm_client::sender::{ClientStats, HttpTransport};
use rask_apm_client::{Client, ClientConfig, ClientError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    poller: ConfigPoller,
    cache: Arc<RwLock<ConfigCache>>,
    notifier: Notifier,
    stats: Arc<ClientStats>,
}

fn harness(config: &ClientConfig) -> Harness {
    let transport = Arc::new(HttpTransport::new(config).unwrap());
    let cache = Arc::new(RwLock::new(ConfigCache::default()));
    let notifier = Notifier::new();
    let stats = Arc::new(ClientStats::new());
    let poller = ConfigPoller::new(
        transport,
        config,
        cache.clone(),
        notifier.clone(),
        stats.clone(),
    );
    Harness {
        poller,
        cache,
        notifier,
        stats,
    }
}

#[tokio::test]
async fn test_etag_is_sent_back_and_304_keeps_config() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .and(header("if-none-match", "\"42\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .and(query_param("service.name", "checkout"))
        .and(query_param("service.environment", "test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"42\"")
                .insert_header("cache-control", "max-age=30, must-revalidate")
                .set_body_json(json!({"transaction_sample_rate": "0.5", "capture_body": "off"})),
        )
        .with_priority(2)
        .mount(&server)
        .await;

    let h = harness(&test_config(&server));
    let mut changes = h.notifier.subscribe_config();

    let (outcome, delay) = h.poller.poll_once().await;
    let PollOutcome::Updated(config) = outcome else {
        panic!("expected an update, got {outcome:?}");
    };
    assert_eq!(config.get_str("transaction_sample_rate").as_deref(), Some("0.5"));
    assert_eq!(delay, Duration::from_secs(30));
    assert_eq!(h.cache.read().etag.as_deref(), Some("\"42\""));
    assert_eq!(changes.recv().await.unwrap(), config);

    let (outcome, delay) = h.poller.poll_once().await;
    assert_eq!(outcome, PollOutcome::NotModified);
    assert_eq!(delay, Duration::from_secs(300));
    assert_eq!(h.cache.read().etag.as_deref(), Some("\"42\""));
    assert_eq!(h.cache.read().last_config.as_ref(), Some(&config));
    assert!(changes.try_recv().is_err());

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("if-none-match").is_none());
    assert_eq!(
        requests[1]
            .headers
            .get("if-none-match")
            .and_then(|value| value.to_str().ok()),
        Some("\"42\"")
    );
    assert_eq!(h.stats.snapshot().config_polls, 2);
}

#[tokio::test]
async fn test_forbidden_and_not_found_are_quiet() {
    for status in [403u16, 404] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONFIG_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.central_config_interval = Duration::from_secs(45);
        let h = harness(&config);
        let mut errors = h.notifier.subscribe_errors();

        let (outcome, delay) = h.poller.poll_once().await;
        assert_eq!(outcome, PollOutcome::Unavailable(status));
        assert_eq!(delay, Duration::from_secs(45));
        assert!(errors.try_recv().is_err());
        assert_eq!(h.stats.snapshot().config_errors, 0);
    }
}

#[tokio::test]
async fn test_server_error_is_broadcast_and_polling_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let h = harness(&test_config(&server));
    let mut errors = h.notifier.subscribe_errors();

    let (outcome, delay) = h.poller.poll_once().await;
    assert!(matches!(
        outcome,
        PollOutcome::Failed(ClientError::CentralConfig { status: Some(503), .. })
    ));
    assert_eq!(delay, Duration::from_secs(300));

    let error = errors.recv().await.unwrap();
    assert!(error.to_string().contains("unavailable"));
    assert_eq!(h.stats.snapshot().config_errors, 1);
    assert!(h.cache.read().next_poll_at.is_some());
}

#[tokio::test]
async fn test_unparsable_body_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"7\"")
                .set_body_string("[1, 2, 3]"),
        )
        .mount(&server)
        .await;

    let h = harness(&test_config(&server));
    let (outcome, _) = h.poller.poll_once().await;

    assert!(matches!(
        outcome,
        PollOutcome::Failed(ClientError::CentralConfig { status: Some(200), .. })
    ));
    assert!(h.cache.read().etag.is_none());
    assert!(h.cache.read().last_config.is_none());
}

#[tokio::test]
async fn test_client_exposes_polled_config() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"1\"")
                .set_body_json(json!({"log_level": "debug"})),
        )
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.central_config = true;
    let client = Client::new(config).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (client.central_config().is_none() || client.stats().config_polls == 0)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let remote = client.central_config().expect("config should have been polled");
    assert_eq!(remote.get_str("log_level").as_deref(), Some("debug"));
    assert_eq!(client.stats().config_polls, 1);

    client.end().await.unwrap();
}

#[tokio::test]
async fn test_poller_stops_on_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.central_config = true;
    config.central_config_interval = Duration::from_millis(50);
    let client = Client::new(config).unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    client.end().await.unwrap();
    let polls_at_end = client.stats().config_polls;
    assert!(polls_at_end >= 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.stats().config_polls, polls_at_end);
}

#[tokio::test]
async fn test_missing_etag_keeps_cached_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"42\"")
                .set_body_json(json!({"capture_body": "off"})),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"capture_body": "all"})))
        .with_priority(2)
        .mount(&server)
        .await;

    let h = harness(&test_config(&server));
    for _ in 0..3 {
        let (outcome, _) = h.poller.poll_once().await;
        assert!(matches!(outcome, PollOutcome::Updated(_)));
    }

    assert_eq!(h.cache.read().etag.as_deref(), Some("\"42\""));
    let sent: Vec<Option<String>> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            request
                .headers
                .get("if-none-match")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .collect();
    assert_eq!(
        sent,
        vec![None, Some("\"42\"".to_string()), Some("\"42\"".to_string())]
    );
}

#[tokio::test]
async fn test_huge_max_age_does_not_stop_polling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=18446744073709551615")
                .set_body_json(json!({})),
        )
        .mount(&server)
        .await;

    let h = harness(&test_config(&server));
    let poller = h.poller.clone();
    let (outcome, delay) = tokio::spawn(async move { poller.poll_once().await })
        .await
        .expect("poll should not panic");

    assert!(matches!(outcome, PollOutcome::Updated(_)));
    assert_eq!(delay, MAX_POLL_DELAY);
    assert!(h.cache.read().next_poll_at.is_some());
}
