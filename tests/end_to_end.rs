use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use load_harness::config::Config;
use load_harness::harness::{self, NamedRun};
use load_harness::scheduler::{AbortHandle, StopReason};
use load_harness::setup::SETUP_TAG;
use wiremock::matchers::{body_string, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const CYCLE: [u16; 5] = [200, 200, 429, 503, 404];

/// Mounts a responder cycling through `CYCLE` and returns how many 429s it served.
async fn cycling_server(http_method: &str, route: &str) -> (MockServer, Arc<AtomicU64>) {
    let server = MockServer::start().await;
    let next = Arc::new(AtomicUsize::new(0));
    let served_429 = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&served_429);
    Mock::given(method(http_method))
        .and(path(route))
        .respond_with(move |_: &Request| {
            let status = CYCLE[next.fetch_add(1, Ordering::SeqCst) % CYCLE.len()];
            if status == 429 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            ResponseTemplate::new(status)
        })
        .mount(&server)
        .await;
    (server, served_429)
}

#[tokio::test]
async fn load_run_accounts_for_every_iteration() {
    let (server, served_429) = cycling_server("POST", "/search/").await;

    let config = Config {
        base_url: Some(server.uri()),
        mode: Some("load".to_string()),
        target_vus: Some(20),
        load_stage_up: Some("100ms".to_string()),
        load_stage_hold: Some("200ms".to_string()),
        load_stage_down: Some("100ms".to_string()),
        think_time_ms: Some(5),
        jwt_issued_at: Some(1000),
        ..Default::default()
    }
    .resolve()
    .unwrap();
    let tag = config.metric_tag();

    let report = harness::run(config, AbortHandle::new()).await.unwrap();
    let stats = &report.scenario(&tag).unwrap().stats;
    assert_eq!(stats.stop_reason, StopReason::Completed);
    assert_eq!(stats.interrupted_iterations, 0);
    assert!(stats.iterations_completed > 0);
    assert!(stats.peak_in_flight <= 20);

    let run = report.snapshots.iter().find(|s| s.tag == tag).unwrap();
    let counts = run.counts;
    assert_eq!(
        counts.accepted + counts.rejected + counts.server_error + counts.other,
        stats.iterations_completed
    );
    assert_eq!(run.total, stats.iterations_completed);

    let rejected: u64 = report.snapshots.iter().map(|s| s.counts.rejected).sum();
    assert_eq!(rejected, served_429.load(Ordering::SeqCst));

    let setup = report.snapshots.iter().find(|s| s.tag == SETUP_TAG).unwrap();
    assert_eq!(setup.total, 1);

    // A fifth of responses are 503s and another fifth 404s.
    assert!(!report.passed());
}

#[tokio::test]
async fn arrival_rate_run_against_rate_limiter() {
    let (server, served_429) = cycling_server("GET", "/api/users/health").await;

    let config = Config {
        base_url: Some(server.uri()),
        workload: Some("rate-limit".to_string()),
        executor_mode: Some("rps".to_string()),
        rps: Some(100),
        duration: Some("300ms".to_string()),
        thresholds: Some("count<1000".to_string()),
        ..Default::default()
    }
    .resolve()
    .unwrap();
    let tag = config.metric_tag();

    let report = harness::run(config, AbortHandle::new()).await.unwrap();
    let scenario = report.scenario(&tag).unwrap();
    let run = report.snapshots.iter().find(|s| s.tag == tag).unwrap();
    assert_eq!(run.total, scenario.stats.iterations_completed);
    assert!(scenario.stats.iterations_started > 0);
    assert!(scenario.stats.peak_in_flight <= 200);
    assert!(scenario.credential_source.is_none());

    let rejected: u64 = report.snapshots.iter().map(|s| s.counts.rejected).sum();
    assert_eq!(rejected, served_429.load(Ordering::SeqCst));
    assert!(report.passed());
}

#[tokio::test]
async fn healthy_target_passes_and_exports_summary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search/"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let export = std::env::temp_dir().join(format!("load-harness-{}.json", std::process::id()));
    let config = Config {
        base_url: Some(server.uri()),
        target_vus: Some(5),
        load_stage_up: Some("50ms".to_string()),
        load_stage_hold: Some("100ms".to_string()),
        load_stage_down: Some("50ms".to_string()),
        summary_export: Some(export.clone()),
        ..Default::default()
    }
    .resolve()
    .unwrap();

    let report = harness::run(config, AbortHandle::new()).await.unwrap();
    assert!(report.passed());
    assert!(report.verdict.outcomes.iter().all(|o| o.passed));

    let written = std::fs::read_to_string(&export).unwrap();
    assert!(written.contains("\"verdict\""));
    assert!(written.contains("\"load/baseline\""));
    assert!(written.contains("p(95)<500"));
    let _ = std::fs::remove_file(&export);
}

#[tokio::test]
async fn abort_ends_a_long_run_early() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = Config {
        base_url: Some(server.uri()),
        workload: Some("health".to_string()),
        target_vus: Some(3),
        load_stage_up: Some("1s".to_string()),
        load_stage_hold: Some("10m".to_string()),
        load_stage_down: Some("1s".to_string()),
        ..Default::default()
    }
    .resolve()
    .unwrap();

    let abort = AbortHandle::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.abort();
    });

    let report = tokio::time::timeout(Duration::from_secs(20), harness::run(config, abort))
        .await
        .expect("abort should end the run")
        .unwrap();
    let stats = &report.scenarios[0].stats;
    assert_eq!(stats.stop_reason, StopReason::Aborted);
    assert_eq!(stats.iterations_started, stats.iterations_completed);
}

#[tokio::test]
async fn slow_target_is_fully_classified_despite_short_graceful_stop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
        .mount(&server)
        .await;

    let config = Config {
        base_url: Some(server.uri()),
        workload: Some("health".to_string()),
        target_vus: Some(4),
        load_stage_up: Some("50ms".to_string()),
        load_stage_hold: Some("200ms".to_string()),
        load_stage_down: Some("50ms".to_string()),
        request_timeout: Some("10s".to_string()),
        graceful_stop: Some("300ms".to_string()),
        think_time_ms: Some(0),
        thresholds: Some("p(95)<5000".to_string()),
        ..Default::default()
    }
    .resolve()
    .unwrap();
    let tag = config.metric_tag();

    let report = harness::run(config, AbortHandle::new()).await.unwrap();
    let stats = &report.scenario(&tag).unwrap().stats;
    assert!(stats.iterations_started > 0);
    assert_eq!(stats.interrupted_iterations, 0);
    assert_eq!(stats.iterations_completed, stats.iterations_started);

    let run = report.snapshots.iter().find(|s| s.tag == tag).unwrap();
    assert_eq!(run.total, stats.iterations_started);
    assert_eq!(run.counts.accepted, stats.iterations_started);
    assert!(report.passed());
}

#[tokio::test]
async fn concurrent_scenarios_are_judged_per_tag() {
    const LOGIN_BODY: &str = r#"{"email":"perftest@example.com","password":"Passw0rd!"}"#;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_string(LOGIN_BODY))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"access_token":"t"}"#))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/search/"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let stages = |config: Config| Config {
        base_url: Some(server.uri()),
        load_stage_up: Some("50ms".to_string()),
        load_stage_hold: Some("300ms".to_string()),
        load_stage_down: Some("50ms".to_string()),
        think_time_ms: Some(5),
        thresholds: Some("p(99)<10000;rate<0.5".to_string()),
        ..config
    };
    let login = stages(Config {
        target_path: vec!["/auth/login".to_string()],
        method: Some("POST".to_string()),
        auth: Some(false),
        body: Some(LOGIN_BODY.to_string()),
        target_vus: Some(3),
        ..Default::default()
    })
    .resolve()
    .unwrap();
    let api = stages(Config {
        target_vus: Some(6),
        jwt_issued_at: Some(1000),
        ..Default::default()
    })
    .resolve()
    .unwrap();

    let started = std::time::Instant::now();
    let report = harness::run_all(
        vec![NamedRun::new("login", login), NamedRun::new("api", api)],
        AbortHandle::new(),
        None,
    )
    .await
    .unwrap();
    let wall_ms = started.elapsed().as_millis() as u64;

    let tags: Vec<&str> = report.scenarios.iter().map(|s| s.tag.as_str()).collect();
    assert_eq!(tags, vec!["login", "api"]);
    assert!(report.scenario("login").unwrap().credential_source.is_none());
    assert!(report.scenario("api").unwrap().credential_source.is_some());

    for scenario in &report.scenarios {
        let run = report
            .snapshots
            .iter()
            .find(|s| s.tag == scenario.tag)
            .unwrap();
        assert!(run.total > 0, "{} recorded nothing", scenario.tag);
        assert_eq!(run.total, scenario.stats.iterations_completed);
    }
    let login_run = report.snapshots.iter().find(|s| s.tag == "login").unwrap();
    assert_eq!(login_run.counts.accepted, login_run.total);
    let api_run = report.snapshots.iter().find(|s| s.tag == "api").unwrap();
    assert_eq!(api_run.counts.server_error, api_run.total);

    // Two thresholds per tag; only the api error rate is breached.
    assert_eq!(report.verdict.outcomes.len(), 4);
    let failed: Vec<(&str, String)> = report
        .verdict
        .outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| (o.tag.as_str(), o.threshold.to_string()))
        .collect();
    assert_eq!(failed, vec![("api", "rate<0.5".to_string())]);
    assert!(!report.passed());

    // Both scenarios ran side by side, not one after the other.
    let back_to_back: u64 = report.scenarios.iter().map(|s| s.stats.elapsed_ms).sum();
    assert!(wall_ms < back_to_back, "wall {wall_ms}ms, back to back {back_to_back}ms");
}

#[tokio::test]
async fn duplicate_scenario_names_are_rejected() {
    let config = Config::default().resolve().unwrap();
    let err = harness::run_all(
        vec![
            NamedRun::new("api", config.clone()),
            NamedRun::new("api", config),
        ],
        AbortHandle::new(),
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("listed twice"));
}
