use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

use crate::config::{ForwardedFor, RequestMethod, RunConfig, ScenarioTag, SearchParams, Workload};
use crate::credential::Credential;
use crate::error::ConfigError;
use crate::metrics::ScenarioMetrics;
use crate::scheduler::{Behaviour, VirtualClient};

pub const FORWARDED_FOR: &str = "x-forwarded-for";

// =============================================================================
// Classification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// 200
    Accepted,
    /// 429, expected under rate limiting
    Rejected,
    /// 5xx
    ServerError,
    /// Any other status, or no response at all
    Other,
}

pub fn classify(status: u16) -> Outcome {
    match status {
        200 => Outcome::Accepted,
        429 => Outcome::Rejected,
        s if s >= 500 => Outcome::ServerError,
        _ => Outcome::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationResult {
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub outcome: Outcome,
    pub transport_error: bool,
}

impl IterationResult {
    pub fn from_status(status: u16, elapsed: Duration) -> Self {
        Self {
            status: Some(status),
            elapsed,
            outcome: classify(status),
            transport_error: false,
        }
    }

    /// Connection refused, timeout and friends.
    pub fn transport_failure(elapsed: Duration) -> Self {
        Self {
            status: None,
            elapsed,
            outcome: Outcome::Other,
            transport_error: true,
        }
    }

    /// A status line arrived but the body was cut short.
    pub fn body_failure(status: u16, elapsed: Duration) -> Self {
        Self {
            status: Some(status),
            ..Self::transport_failure(elapsed)
        }
    }
}

/// Distinct source address for a client, so a per-address rate limiter sees many callers.
/// The seed fills the host part of 10.0.0.0/8, so the first 2^24 seeds never collide.
pub fn forwarded_address(seed: u64) -> Ipv4Addr {
    let host = (seed & 0x00FF_FFFF) as u32;
    Ipv4Addr::from(0x0A00_0000 | host)
}

// =============================================================================
// Request template
// =============================================================================

#[derive(Serialize)]
struct SearchBody<'a> {
    query: &'a str,
    user_id: u64,
    limit: u32,
    skip: u32,
}

#[derive(Debug, Clone)]
enum BodyTemplate {
    Empty,
    Raw(String),
    Search {
        params: SearchParams,
        /// Append the iteration index to the query so no two iterations of a client share a cache entry.
        vary_query: bool,
    },
}

/// Everything needed to build the request of any iteration. Read-only once built.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: RequestMethod,
    urls: Vec<Url>,
    body: BodyTemplate,
    content_type: String,
    forwarded_for: ForwardedFor,
    credential: Option<Credential>,
    seed: u64,
}

/// `base` followed by `path`, keeping any path prefix the base already has.
pub fn join_url(base: &Url, path: &str) -> Result<Url, ConfigError> {
    let raw = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { value: raw, source })
}

impl RequestTemplate {
    /// The credential is attached only when authentication is enabled for the run.
    pub fn from_config(config: &RunConfig, credential: Option<Credential>) -> Result<Self, ConfigError> {
        let urls = config
            .paths
            .iter()
            .map(|path| join_url(&config.base_url, path))
            .collect::<Result<Vec<_>, _>>()?;

        let body = match (&config.body, config.workload) {
            (Some(raw), _) => BodyTemplate::Raw(raw.clone()),
            (None, Workload::Search) => BodyTemplate::Search {
                params: config.search.clone(),
                vary_query: config.scenario == ScenarioTag::Baseline,
            },
            (None, _) => BodyTemplate::Empty,
        };

        Ok(Self {
            method: config.method,
            urls,
            body,
            content_type: config.content_type.clone(),
            forwarded_for: config.forwarded_for.clone(),
            credential: credential.filter(|_| config.auth.enabled),
            seed: config.seed,
        })
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Deterministic pick among the configured paths for one iteration of one client.
    pub fn url_for(&self, client: &VirtualClient) -> &Url {
        if self.urls.len() == 1 {
            return &self.urls[0];
        }
        let mixed = self
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(client.id.rotate_left(32))
            .wrapping_add(client.iteration);
        let mut rng = StdRng::seed_from_u64(mixed);
        &self.urls[rng.random_range(0..self.urls.len())]
    }

    pub fn body_for(&self, client: &VirtualClient) -> Result<Option<String>, sonic_rs::Error> {
        if !self.method.has_body() {
            return Ok(None);
        }
        match &self.body {
            BodyTemplate::Empty => Ok(None),
            BodyTemplate::Raw(raw) => Ok(Some(raw.clone())),
            BodyTemplate::Search { params, vary_query } => {
                let varied;
                let query = if *vary_query {
                    varied = format!("{}-{}", params.query, client.iteration);
                    &varied
                } else {
                    &params.query
                };
                sonic_rs::to_string(&SearchBody {
                    query,
                    user_id: params.user_id,
                    limit: params.limit,
                    skip: params.skip,
                })
                .map(Some)
            }
        }
    }

    pub fn build(
        &self,
        http: &Client,
        client: &VirtualClient,
    ) -> Result<RequestBuilder, sonic_rs::Error> {
        let method: Method = self.method.to_reqwest();
        let mut request = http
            .request(method, self.url_for(client).clone())
            .header(CONTENT_TYPE, &self.content_type);

        if let Some(credential) = &self.credential {
            request = request.header(AUTHORIZATION, credential.bearer());
        }
        match &self.forwarded_for {
            ForwardedFor::None => {}
            ForwardedFor::Fixed(value) => request = request.header(FORWARDED_FOR, value),
            ForwardedFor::PerClient => {
                let address = forwarded_address(client.id + 1);
                request = request.header(FORWARDED_FOR, address.to_string());
            }
        }
        if let Some(body) = self.body_for(client)? {
            request = request.body(body);
        }
        Ok(request)
    }
}

/// Issue one request and classify it. Never fails: problems become `Outcome::Other`.
pub async fn execute(http: &Client, template: &RequestTemplate, client: &VirtualClient) -> IterationResult {
    let start = Instant::now();
    let request = match template.build(http, client) {
        Ok(request) => request,
        Err(e) => {
            debug!(client = client.id, "Failed to encode request body: {e}");
            return IterationResult::transport_failure(start.elapsed());
        }
    };

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            // Latency covers the full body so slow streaming responses are not under-reported.
            match response.bytes().await {
                Ok(_) => IterationResult::from_status(status, start.elapsed()),
                Err(e) => {
                    debug!(client = client.id, status, "Failed to read response body: {e}");
                    IterationResult::body_failure(status, start.elapsed())
                }
            }
        }
        Err(e) => {
            debug!(client = client.id, "Request failed: {e}");
            IterationResult::transport_failure(start.elapsed())
        }
    }
}

// =============================================================================
// Iteration behaviour
// =============================================================================

/// The per-iteration hook: one request, one record, then the think-time pause.
pub struct RequestExecutor {
    http: Client,
    template: Arc<RequestTemplate>,
    metrics: Arc<ScenarioMetrics>,
    think_time: Duration,
    /// Requests sent but not yet recorded
    pending: AtomicU64,
}

impl RequestExecutor {
    pub fn new(
        http: Client,
        template: Arc<RequestTemplate>,
        metrics: Arc<ScenarioMetrics>,
        think_time: Duration,
    ) -> Self {
        Self {
            http,
            template,
            metrics,
            think_time,
            pending: AtomicU64::new(0),
        }
    }
}

impl Behaviour for RequestExecutor {
    async fn iterate(&self, client: &mut VirtualClient) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let result = execute(&self.http, &self.template, client).await;
        debug!(
            client = client.id,
            iteration = client.iteration,
            status = ?result.status,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "{:?}",
            result.outcome
        );
        self.metrics.record(&result).await;
        self.pending.fetch_sub(1, Ordering::Relaxed);

        if !self.think_time.is_zero() {
            sleep(self.think_time).await;
        }
    }

    /// Iterations cut off during think time were already recorded; only unanswered requests are.
    fn interrupted(&self, _count: u64) {
        let unrecorded = self.pending.swap(0, Ordering::Relaxed);
        if unrecorded > 0 {
            self.metrics.record_interrupted(unrecorded);
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::Config;

    fn client(id: u64, iteration: u64) -> VirtualClient {
        VirtualClient { id, iteration }
    }

    fn run_config(base_url: &str, config: Config) -> RunConfig {
        Config {
            base_url: Some(base_url.to_string()),
            ..config
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn classification_buckets() {
        assert_eq!(classify(200), Outcome::Accepted);
        assert_eq!(classify(429), Outcome::Rejected);
        assert_eq!(classify(500), Outcome::ServerError);
        assert_eq!(classify(503), Outcome::ServerError);
        assert_eq!(classify(201), Outcome::Other);
        assert_eq!(classify(404), Outcome::Other);
        assert_eq!(classify(302), Outcome::Other);
    }

    #[test]
    fn forwarded_addresses_are_distinct() {
        assert_eq!(forwarded_address(1), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(forwarded_address(2), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(forwarded_address(255), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(forwarded_address(256), Ipv4Addr::new(10, 0, 1, 0));

        let addresses: std::collections::HashSet<_> =
            (1..=100_000).map(forwarded_address).collect();
        assert_eq!(addresses.len(), 100_000);
        assert!(addresses.iter().all(|a| !a.is_unspecified()));
    }

    #[test]
    fn url_join_keeps_base_prefix() {
        let base = Url::parse("http://localhost:8083/api/").unwrap();
        assert_eq!(
            join_url(&base, "/search/").unwrap().as_str(),
            "http://localhost:8083/api/search/"
        );
        let base = Url::parse("http://localhost:8083").unwrap();
        assert_eq!(join_url(&base, "health").unwrap().as_str(), "http://localhost:8083/health");
    }

    #[test]
    fn path_choice_is_deterministic() {
        let config = run_config(
            "http://localhost:1",
            Config {
                target_path: vec!["/a".into(), "/b".into(), "/c".into()],
                ..Default::default()
            },
        );
        let template = RequestTemplate::from_config(&config, None).unwrap();
        let mut seen = std::collections::HashSet::new();
        for iteration in 0..50 {
            let first = template.url_for(&client(3, iteration)).clone();
            assert_eq!(&first, template.url_for(&client(3, iteration)));
            seen.insert(first.path().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn baseline_search_varies_query() {
        let config = run_config("http://localhost:1", Config::default());
        let template = RequestTemplate::from_config(&config, None).unwrap();
        let body = template.body_for(&client(0, 7)).unwrap().unwrap();
        assert_eq!(body, r#"{"query":"meeting-7","user_id":1,"limit":20,"skip":0}"#);

        let config = run_config(
            "http://localhost:1",
            Config {
                scenario: Some("cache".to_string()),
                ..Default::default()
            },
        );
        let template = RequestTemplate::from_config(&config, None).unwrap();
        let body = template.body_for(&client(0, 7)).unwrap().unwrap();
        assert_eq!(body, r#"{"query":"meeting","user_id":1,"limit":20,"skip":0}"#);
    }

    #[test]
    fn get_requests_have_no_body() {
        let config = run_config(
            "http://localhost:1",
            Config {
                workload: Some("health".to_string()),
                body: Some("ignored".to_string()),
                ..Default::default()
            },
        );
        let template = RequestTemplate::from_config(&config, None).unwrap();
        assert_eq!(template.body_for(&client(0, 0)).unwrap(), None);
    }

    #[test]
    fn credential_dropped_when_auth_disabled() {
        let config = run_config(
            "http://localhost:1",
            Config {
                auth: Some(false),
                ..Default::default()
            },
        );
        let template =
            RequestTemplate::from_config(&config, Some(Credential::from_override("t"))).unwrap();
        assert!(template.credential().is_none());
    }

    #[tokio::test]
    async fn search_request_carries_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search/"))
            .and(header("authorization", "Bearer token-1"))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"{"query":"meeting-0","user_id":1,"limit":20,"skip":0}"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = run_config(&server.uri(), Config::default());
        let template =
            RequestTemplate::from_config(&config, Some(Credential::from_override("token-1")))
                .unwrap();
        let result = execute(&Client::new(), &template, &client(0, 0)).await;
        assert_eq!(result.status, Some(200));
        assert_eq!(result.outcome, Outcome::Accepted);
    }

    #[tokio::test]
    async fn rate_limit_request_sets_forwarded_for() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/health"))
            .and(header("x-forwarded-for", "10.0.0.2"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let config = run_config(
            &server.uri(),
            Config {
                workload: Some("rate-limit".to_string()),
                ..Default::default()
            },
        );
        let template = RequestTemplate::from_config(&config, None).unwrap();
        let result = execute(&Client::new(), &template, &client(1, 0)).await;
        assert_eq!(result.outcome, Outcome::Rejected);
    }

    #[tokio::test]
    async fn transport_error_is_counted_as_other() {
        let config = run_config(
            "http://127.0.0.1:1",
            Config {
                workload: Some("health".to_string()),
                ..Default::default()
            },
        );
        let template = RequestTemplate::from_config(&config, None).unwrap();
        let result = execute(&Client::new(), &template, &client(0, 0)).await;
        assert_eq!(result.outcome, Outcome::Other);
        assert!(result.transport_error);
        assert_eq!(result.status, None);
    }

    #[tokio::test]
    async fn truncated_body_is_a_transport_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let config = run_config(
            &format!("http://{address}"),
            Config {
                workload: Some("health".to_string()),
                ..Default::default()
            },
        );
        let template = RequestTemplate::from_config(&config, None).unwrap();
        let result = execute(&Client::new(), &template, &client(0, 0)).await;
        assert_eq!(result.status, Some(200));
        assert_eq!(result.outcome, Outcome::Other);
        assert!(result.transport_error);
    }

    #[tokio::test]
    async fn unanswered_request_is_recorded_when_cut_off() {
        use crate::plan::{ScenarioStage, SchedulingPlan, StageProfile};
        use crate::scheduler::{AbortHandle, Scheduler};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let config = run_config(
            &server.uri(),
            Config {
                workload: Some("health".to_string()),
                ..Default::default()
            },
        );
        let metrics = crate::metrics::Metrics::new();
        let series = metrics.series("load/baseline").await.unwrap();
        let executor = Arc::new(RequestExecutor::new(
            Client::new(),
            Arc::new(RequestTemplate::from_config(&config, None).unwrap()),
            Arc::clone(&series),
            Duration::ZERO,
        ));

        let profile = StageProfile::new(
            1,
            vec![ScenarioStage::new(1, Duration::from_millis(200))],
            crate::config::Ramp::Step,
        )
        .unwrap();
        let plan = SchedulingPlan::Population {
            profile,
            max_clients: 1,
        };
        let stats = Scheduler::new(plan, Duration::from_millis(100), None)
            .run(executor, &AbortHandle::new())
            .await;

        assert_eq!(stats.interrupted_iterations, 1);
        let snapshot = series.snapshot().await;
        assert_eq!(snapshot.total, stats.iterations_started);
        assert_eq!(snapshot.counts.other, 1);
        assert_eq!(snapshot.counts.transport_errors, 1);
    }

    #[tokio::test]
    async fn iteration_records_into_metrics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header_exists("content-type"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = run_config(
            &server.uri(),
            Config {
                workload: Some("health".to_string()),
                ..Default::default()
            },
        );
        let metrics = crate::metrics::Metrics::new();
        let series = metrics.series("load/baseline").await.unwrap();
        let executor = RequestExecutor::new(
            Client::new(),
            Arc::new(RequestTemplate::from_config(&config, None).unwrap()),
            Arc::clone(&series),
            Duration::ZERO,
        );

        let mut vc = client(0, 0);
        executor.iterate(&mut vc).await;
        executor.iterate(&mut vc).await;
        let snapshot = series.snapshot().await;
        assert_eq!(snapshot.counts.server_error, 2);
        assert_eq!(snapshot.total, 2);
    }
}
