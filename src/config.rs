use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::builder::BoolishValueParser;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::ConfigError;
use crate::threshold::Threshold;

// =============================================================================
// Configuration
// =============================================================================

/// Raw overrides, each one settable as a flag or an environment variable. Nothing here has a
/// default: defaults and derived values are filled in by [`Config::resolve`].
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "load-harness")]
#[command(about = "Staged HTTP load generator with locally minted credentials", long_about = None)]
pub struct Config {
    /// Target base URL
    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Request paths, comma separated. One is picked per iteration.
    #[arg(long, env = "TARGET_PATH", value_delimiter = ',')]
    pub target_path: Vec<String>,

    /// Workload shape (search, health, rate-limit)
    #[arg(long, env = "WORKLOAD")]
    pub workload: Option<String>,

    /// HTTP method (GET, POST, PUT, DELETE)
    #[arg(long, env = "METHOD")]
    pub method: Option<String>,

    /// Raw request body, replaces the generated one
    #[arg(long, env = "BODY")]
    pub body: Option<String>,

    /// Request content type
    #[arg(long, env = "CONTENT_TYPE")]
    pub content_type: Option<String>,

    /// Test type (load, stress). Takes precedence over --mode.
    #[arg(long, env = "TEST_TYPE")]
    pub test_type: Option<String>,

    /// Mode (load, stress)
    #[arg(long, env = "MODE")]
    pub mode: Option<String>,

    /// Scheduling model: vus (fixed population) or rps (arrival rate)
    #[arg(long, env = "EXECUTOR_MODE")]
    pub executor_mode: Option<String>,

    /// Scenario tag (baseline, tls, lb, cache)
    #[arg(long, env = "SCENARIO")]
    pub scenario: Option<String>,

    /// Interpolation inside a stage (linear, step)
    #[arg(long, env = "RAMP")]
    pub ramp: Option<String>,

    /// Steady-state requests per second
    #[arg(long, env = "RPS")]
    pub rps: Option<u32>,

    /// Maximum number of virtual clients
    #[arg(long, env = "VUS")]
    pub vus: Option<u32>,

    /// Population target for load runs
    #[arg(long, env = "TARGET_VUS")]
    pub target_vus: Option<u32>,

    /// Clients allocated up front by the arrival-rate model
    #[arg(long, env = "PREALLOCATED_VUS")]
    pub preallocated_vus: Option<u32>,

    /// Hold duration for load runs, total duration for constant-rate runs
    #[arg(long, env = "DURATION")]
    pub duration: Option<String>,

    /// Load ramp-up duration
    #[arg(long, env = "LOAD_STAGE_UP")]
    pub load_stage_up: Option<String>,

    /// Load hold duration
    #[arg(long, env = "LOAD_STAGE_HOLD")]
    pub load_stage_hold: Option<String>,

    /// Load ramp-down duration
    #[arg(long, env = "LOAD_STAGE_DOWN")]
    pub load_stage_down: Option<String>,

    /// Stress population start
    #[arg(long, env = "STRESS_START_VUS")]
    pub stress_start_vus: Option<u32>,

    /// Stress population ceiling
    #[arg(long, env = "STRESS_MAX_VUS")]
    pub stress_max_vus: Option<u32>,

    /// Stress arrival-rate start
    #[arg(long, env = "STRESS_START_RATE")]
    pub stress_start_rate: Option<u32>,

    /// Stress arrival-rate ceiling
    #[arg(long, env = "STRESS_MAX_RATE")]
    pub stress_max_rate: Option<u32>,

    /// Number of ascending stress steps after the starting hold
    #[arg(long, env = "STRESS_STEP_COUNT")]
    pub stress_step_count: Option<u32>,

    /// Duration of each stress stage
    #[arg(long, env = "STRESS_STEP_HOLD")]
    pub stress_step_hold: Option<String>,

    /// Total stress time, used to derive the step hold and by the progressive style
    #[arg(long, env = "STRESS_TOTAL")]
    pub stress_total: Option<String>,

    /// Stress stage generation (auto, progressive)
    #[arg(long, env = "STRESS_STYLE")]
    pub stress_style: Option<String>,

    /// Explicit stress targets, comma separated
    #[arg(long, env = "STRESS_TARGETS")]
    pub stress_targets: Option<String>,

    /// Search query text
    #[arg(long, env = "QUERY")]
    pub query: Option<String>,

    /// Search user identifier, also the credential subject
    #[arg(long, env = "USER_ID")]
    pub user_id: Option<u64>,

    /// Search page size
    #[arg(long, env = "LIMIT")]
    pub limit: Option<u32>,

    /// Search page offset
    #[arg(long, env = "SKIP")]
    pub skip: Option<u32>,

    /// Attach a bearer credential to every request
    #[arg(long, env = "AUTH", value_parser = BoolishValueParser::new())]
    pub auth: Option<bool>,

    /// Secret used to sign minted credentials
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Minted credential issuer
    #[arg(long, env = "JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    /// Minted credential audience
    #[arg(long, env = "JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    /// Minted credential lifetime in seconds
    #[arg(long, env = "JWT_TTL_SECONDS")]
    pub jwt_ttl_seconds: Option<u64>,

    /// Fixed issued-at time (Unix seconds) for reproducible credentials
    #[arg(long, env = "JWT_ISSUED_AT")]
    pub jwt_issued_at: Option<u64>,

    /// Credential used verbatim instead of minting one
    #[arg(long, env = "JWT_OVERRIDE")]
    pub jwt_override: Option<String>,

    /// Log in against the auth service to obtain the credential
    #[arg(long, env = "USE_LOGIN_TOKEN_FOR_API", value_parser = BoolishValueParser::new())]
    pub use_login_token: Option<bool>,

    /// Base URL of the auth service used for login
    #[arg(long, env = "AUTH_BASE_URL")]
    pub auth_base_url: Option<String>,

    /// Login email
    #[arg(long, env = "TEST_EMAIL")]
    pub test_email: Option<String>,

    /// Login password
    #[arg(long, env = "TEST_PASSWORD")]
    pub test_password: Option<String>,

    /// Fixed X-Forwarded-For value
    #[arg(long, env = "FORWARDED_FOR")]
    pub forwarded_for: Option<String>,

    /// Pause after each iteration in milliseconds
    #[arg(long, env = "THINK_TIME_MS")]
    pub think_time_ms: Option<u64>,

    /// Per-request timeout
    #[arg(long, env = "REQUEST_TIMEOUT")]
    pub request_timeout: Option<String>,

    /// How long in-flight iterations may run once the schedule is drained
    #[arg(long, env = "GRACEFUL_STOP")]
    pub graceful_stop: Option<String>,

    /// Hard cap on the run duration
    #[arg(long, env = "MAX_DURATION")]
    pub max_duration: Option<String>,

    /// Cache warm-up requests sent during setup for the cache scenario
    #[arg(long, env = "WARMUP_REQUESTS")]
    pub warmup_requests: Option<u32>,

    /// Seed for the per-iteration path choice
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,

    /// Threshold expressions separated by ';', e.g. "p(95)<500;rate<0.02"
    #[arg(long, env = "THRESHOLDS")]
    pub thresholds: Option<String>,

    /// Test identifier included in logs and the summary
    #[arg(long, env = "TESTID")]
    pub test_id: Option<String>,

    /// Write a JSON summary to this path at the end of the run
    #[arg(long, env = "SUMMARY_EXPORT")]
    pub summary_export: Option<PathBuf>,

    /// JSON file of named scenarios to run side by side. Each scenario starts from the
    /// environment and applies its own flags; other command-line flags are not inherited.
    #[arg(long, env = "SCENARIO_FILE")]
    pub scenario_file: Option<PathBuf>,
}

// =============================================================================
// Lenient enums
// =============================================================================

/// Result of parsing an enum-valued setting. Unrecognised input is kept so the fallback to the
/// default is explicit and can be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lenient<T> {
    Known(T),
    Unknown(String),
}

impl<T: FromStr + Default + fmt::Display> Lenient<T> {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.parse::<T>() {
            Ok(value) => Lenient::Known(value),
            Err(_) => Lenient::Unknown(raw.to_string()),
        }
    }

    /// The recognised value, or the default with a warning naming `field`.
    pub fn resolve(self, field: &str) -> T {
        match self {
            Lenient::Known(value) => value,
            Lenient::Unknown(raw) => {
                let fallback = T::default();
                warn!("Unrecognised {field} {raw:?}, falling back to {fallback}");
                fallback
            }
        }
    }
}

fn lenient<T: FromStr + Default + fmt::Display>(field: &str, raw: Option<&str>) -> T {
    raw.map(|raw| Lenient::<T>::parse(raw).resolve(field))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Load,
    Stress,
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load" => Ok(Mode::Load),
            "stress" => Ok(Mode::Stress),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Load => write!(f, "load"),
            Mode::Stress => write!(f, "stress"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorModel {
    /// Fixed population of virtual clients
    #[default]
    Vus,
    /// Arrival rate of new iterations
    Rps,
}

impl FromStr for ExecutorModel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vus" => Ok(ExecutorModel::Vus),
            "rps" => Ok(ExecutorModel::Rps),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ExecutorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorModel::Vus => write!(f, "vus"),
            ExecutorModel::Rps => write!(f, "rps"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioTag {
    #[default]
    Baseline,
    Tls,
    Lb,
    Cache,
}

impl FromStr for ScenarioTag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(ScenarioTag::Baseline),
            "tls" => Ok(ScenarioTag::Tls),
            "lb" => Ok(ScenarioTag::Lb),
            "cache" => Ok(ScenarioTag::Cache),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ScenarioTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioTag::Baseline => write!(f, "baseline"),
            ScenarioTag::Tls => write!(f, "tls"),
            ScenarioTag::Lb => write!(f, "lb"),
            ScenarioTag::Cache => write!(f, "cache"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Workload {
    /// POST a JSON search body, authenticated
    #[default]
    Search,
    /// GET without a body
    Health,
    /// GET with a distinct X-Forwarded-For per client, expecting 429s
    RateLimit,
}

impl FromStr for Workload {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search" => Ok(Workload::Search),
            "health" => Ok(Workload::Health),
            "rate-limit" | "rate_limit" | "ratelimit" => Ok(Workload::RateLimit),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Search => write!(f, "search"),
            Workload::Health => write!(f, "health"),
            Workload::RateLimit => write!(f, "rate-limit"),
        }
    }
}

impl Workload {
    fn default_path(&self) -> &'static str {
        match self {
            Workload::Search => "/search/",
            Workload::Health => "/health",
            Workload::RateLimit => "/api/users/health",
        }
    }

    fn default_method(&self) -> RequestMethod {
        match self {
            Workload::Search => RequestMethod::Post,
            Workload::Health | Workload::RateLimit => RequestMethod::Get,
        }
    }

    fn default_think_time(&self) -> Duration {
        match self {
            Workload::RateLimit => Duration::from_millis(10),
            Workload::Search | Workload::Health => Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl FromStr for RequestMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(RequestMethod::Get),
            "post" => Ok(RequestMethod::Post),
            "put" => Ok(RequestMethod::Put),
            "delete" => Ok(RequestMethod::Delete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestMethod::Get => write!(f, "GET"),
            RequestMethod::Post => write!(f, "POST"),
            RequestMethod::Put => write!(f, "PUT"),
            RequestMethod::Delete => write!(f, "DELETE"),
        }
    }
}

impl RequestMethod {
    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            RequestMethod::Get => reqwest::Method::GET,
            RequestMethod::Post => reqwest::Method::POST,
            RequestMethod::Put => reqwest::Method::PUT,
            RequestMethod::Delete => reqwest::Method::DELETE,
        }
    }

    pub fn has_body(self) -> bool {
        matches!(self, RequestMethod::Post | RequestMethod::Put)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ramp {
    /// Move linearly from the previous stage target to this stage's target
    #[default]
    Linear,
    /// Jump to the stage target at the start of the stage and hold it
    Step,
}

impl FromStr for Ramp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Ramp::Linear),
            "step" => Ok(Ramp::Step),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Ramp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ramp::Linear => write!(f, "linear"),
            Ramp::Step => write!(f, "step"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StressStyle {
    /// A starting hold followed by a fixed number of ascending steps
    #[default]
    Auto,
    /// As many steps as fit in the total stress time
    Progressive,
}

impl FromStr for StressStyle {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(StressStyle::Auto),
            "progressive" => Ok(StressStyle::Progressive),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StressStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressStyle::Auto => write!(f, "auto"),
            StressStyle::Progressive => write!(f, "progressive"),
        }
    }
}

// =============================================================================
// Resolved configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardedFor {
    None,
    Fixed(String),
    /// A distinct address derived from each client's id
    PerClient,
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub user_id: u64,
    pub limit: u32,
    pub skip: u32,
}

#[derive(Debug, Clone)]
pub struct JwtParams {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_seconds: u64,
    /// Fixed issue time; the clock is read during setup when unset.
    pub issued_at: Option<u64>,
}

impl JwtParams {
    pub fn issued_at_or_now(&self) -> u64 {
        self.issued_at.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoginParams {
    pub auth_base_url: Url,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AuthParams {
    pub enabled: bool,
    pub jwt: JwtParams,
    pub override_token: Option<String>,
    pub login: Option<LoginParams>,
}

#[derive(Debug, Clone)]
pub struct LoadStages {
    pub up: Duration,
    pub hold: Duration,
    pub down: Duration,
}

#[derive(Debug, Clone)]
pub struct StressParams {
    pub start_vus: u32,
    pub max_vus: u32,
    pub start_rate: u32,
    pub max_rate: u32,
    pub step_count: u32,
    pub step_hold: Duration,
    pub total: Option<Duration>,
    pub style: StressStyle,
    pub targets: Vec<u32>,
}

/// Everything a run needs, resolved once. Every count in here is positive.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: Url,
    pub paths: Vec<String>,
    pub workload: Workload,
    pub method: RequestMethod,
    pub body: Option<String>,
    pub content_type: String,
    pub mode: Mode,
    pub executor: ExecutorModel,
    pub scenario: ScenarioTag,
    pub ramp: Ramp,
    pub test_id: String,
    pub rps: u32,
    pub max_vus: u32,
    pub target_vus: u32,
    pub preallocated_vus: u32,
    pub duration: Duration,
    pub load: LoadStages,
    pub stress: StressParams,
    pub search: SearchParams,
    pub auth: AuthParams,
    pub forwarded_for: ForwardedFor,
    pub think_time: Duration,
    pub request_timeout: Duration,
    pub graceful_stop: Duration,
    pub max_duration: Option<Duration>,
    pub warmup_requests: u32,
    pub seed: u64,
    pub thresholds: Vec<Threshold>,
    pub summary_export: Option<PathBuf>,
}

impl RunConfig {
    /// Tag under which this run's iterations are aggregated and thresholds evaluated.
    pub fn metric_tag(&self) -> String {
        format!("{}/{}", self.mode, self.scenario)
    }

    /// Drain window actually used: never shorter than a request that runs into its timeout
    /// followed by the think-time pause.
    pub fn effective_graceful_stop(&self) -> Duration {
        self.graceful_stop
            .max(self.request_timeout.saturating_add(self.think_time))
    }
}

// =============================================================================
// Scenario files
// =============================================================================

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    scenarios: Vec<ScenarioEntry>,
}

#[derive(Debug, Deserialize)]
struct ScenarioEntry {
    name: String,
    /// Long flag names without the leading dashes, mapped to their values
    #[serde(default)]
    flags: BTreeMap<String, String>,
}

/// One named scenario of a multi-scenario run. The name is also its metric tag.
#[derive(Debug, Clone)]
pub struct NamedConfig {
    pub name: String,
    pub config: Config,
}

/// Parse a scenario file such as
///
/// ```json
/// {"scenarios": [
///   {"name": "login", "flags": {"target-path": "/auth/login", "auth": "false"}},
///   {"name": "api", "flags": {"workload": "search"}}
/// ]}
/// ```
///
/// Flags are applied on top of the environment, exactly as if given on the command line.
pub fn parse_scenario_file(raw: &[u8]) -> Result<Vec<NamedConfig>, ConfigError> {
    let file: ScenarioFile = sonic_rs::from_slice(raw)?;
    if file.scenarios.is_empty() {
        return Err(ConfigError::NoScenarios);
    }

    let mut seen = HashSet::new();
    file.scenarios
        .into_iter()
        .map(|entry| {
            let name = entry.name.trim().to_string();
            if name.is_empty() || !seen.insert(name.clone()) {
                return Err(ConfigError::ScenarioName(entry.name));
            }
            let flags = entry.flags.into_iter().flat_map(|(flag, value)| {
                [format!("--{}", flag.trim_start_matches('-')), value]
            });
            let args = std::iter::once("load-harness".to_string()).chain(flags);
            let config = Config::try_parse_from(args).map_err(|e| ConfigError::ScenarioFlags {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            Ok(NamedConfig { name, config })
        })
        .collect()
}

// =============================================================================
// Duration parsing
// =============================================================================

/// Parse durations such as `500ms`, `15s`, `2m`, `1h` or `1m30s`. A bare number is minutes.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(minutes) = raw.parse::<u64>() {
        return Some(Duration::from_secs(minutes.checked_mul(60)?));
    }
    humantime::parse_duration(raw).ok()
}

fn duration_field(
    field: &'static str,
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let value = match raw {
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field,
            value: raw.to_string(),
        })?,
        None => default,
    };
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(value)
}

fn optional_duration(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<Duration>, ConfigError> {
    raw.map(|raw| duration_field(field, Some(raw), Duration::ZERO))
        .transpose()
}

fn positive<T: Default + PartialEq>(field: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(value)
}

/// Comma separated targets. Entries that are not non-negative integers are dropped.
fn parse_targets(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|t| t.trim().parse::<u32>().ok())
        .collect()
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        value: raw.to_string(),
        source,
    })
}

// =============================================================================
// Resolution
// =============================================================================

const DEFAULT_BASE_URL: &str = "http://localhost:8083";
const DEFAULT_RPS: u32 = 50;
const DEFAULT_DURATION: Duration = Duration::from_secs(120);
const DEFAULT_STAGE_RAMP: Duration = Duration::from_secs(60);
const DEFAULT_STRESS_STEP_HOLD: Duration = Duration::from_secs(120);
const DEFAULT_STRESS_STEP_COUNT: u32 = 4;
const DEFAULT_JWT_SECRET: &str = "change-me-in-prod";
const DEFAULT_JWT_ISSUER: &str = "tasknotes-auth";
const DEFAULT_JWT_AUDIENCE: &str = "tasknotes";
const DEFAULT_JWT_TTL_SECONDS: u64 = 900;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
const DEFAULT_WARMUP_REQUESTS: u32 = 200;

impl Config {
    /// Merge the overrides with defaults. Explicit values always win over derived ones;
    /// unrecognised enum values fall back with a warning. Only impossible configurations fail.
    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        let mode: Mode = lenient("mode", self.test_type.as_deref().or(self.mode.as_deref()));
        let workload: Workload = lenient("workload", self.workload.as_deref());
        let executor: ExecutorModel = lenient("executor mode", self.executor_mode.as_deref());
        let scenario: ScenarioTag = lenient("scenario", self.scenario.as_deref());
        let ramp: Ramp = lenient("ramp", self.ramp.as_deref());
        let style: StressStyle = lenient("stress style", self.stress_style.as_deref());
        let method = match self.method.as_deref() {
            Some(raw) => match Lenient::<RequestMethod>::parse(raw) {
                Lenient::Known(method) => method,
                Lenient::Unknown(raw) => {
                    let fallback = workload.default_method();
                    warn!("Unrecognised method {raw:?}, falling back to {fallback}");
                    fallback
                }
            },
            None => workload.default_method(),
        };

        let base_url = parse_url(self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let paths: Vec<String> = self
            .target_path
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let paths = if paths.is_empty() {
            vec![workload.default_path().to_string()]
        } else {
            paths
        };

        let rps = positive("RPS", self.rps.unwrap_or(DEFAULT_RPS))?;
        let max_vus = positive("VUS", self.vus.unwrap_or_else(|| rps.saturating_mul(2).max(50)))?;
        let target_vus = positive("TARGET_VUS", self.target_vus.unwrap_or(max_vus.max(20)))?;
        let preallocated_vus = positive(
            "PREALLOCATED_VUS",
            self.preallocated_vus.unwrap_or(rps.max(20).min(max_vus)),
        )?
        .min(max_vus);

        let duration = duration_field("DURATION", self.duration.as_deref(), DEFAULT_DURATION)?;
        let load = LoadStages {
            up: duration_field(
                "LOAD_STAGE_UP",
                self.load_stage_up.as_deref(),
                DEFAULT_STAGE_RAMP,
            )?,
            hold: duration_field("LOAD_STAGE_HOLD", self.load_stage_hold.as_deref(), duration)?,
            down: duration_field(
                "LOAD_STAGE_DOWN",
                self.load_stage_down.as_deref(),
                DEFAULT_STAGE_RAMP,
            )?,
        };

        let step_count = positive(
            "STRESS_STEP_COUNT",
            self.stress_step_count.unwrap_or(DEFAULT_STRESS_STEP_COUNT),
        )?;
        let stress_total = optional_duration("STRESS_TOTAL", self.stress_total.as_deref())?;
        let derived_step_hold = match stress_total {
            Some(total) => (total / (step_count + 1)).max(Duration::from_secs(1)),
            None => DEFAULT_STRESS_STEP_HOLD,
        };
        let stress = StressParams {
            start_vus: positive(
                "STRESS_START_VUS",
                self.stress_start_vus.unwrap_or((target_vus / 2).max(10)),
            )?,
            max_vus: positive(
                "STRESS_MAX_VUS",
                self.stress_max_vus.unwrap_or(target_vus.saturating_mul(2).max(50)),
            )?,
            start_rate: positive(
                "STRESS_START_RATE",
                self.stress_start_rate.unwrap_or((rps / 2).max(10)),
            )?,
            max_rate: positive(
                "STRESS_MAX_RATE",
                self.stress_max_rate.unwrap_or(rps.max(100)),
            )?,
            step_count,
            step_hold: duration_field(
                "STRESS_STEP_HOLD",
                self.stress_step_hold.as_deref(),
                derived_step_hold,
            )?,
            total: stress_total,
            style,
            targets: self
                .stress_targets
                .as_deref()
                .map(parse_targets)
                .unwrap_or_default(),
        };

        let search = SearchParams {
            query: self.query.unwrap_or_else(|| "meeting".to_string()),
            user_id: positive("USER_ID", self.user_id.unwrap_or(1))?,
            limit: positive("LIMIT", self.limit.unwrap_or(20))?,
            skip: self.skip.unwrap_or(0),
        };

        let login = if self.use_login_token.unwrap_or(false) {
            let auth_base_url = match self.auth_base_url.as_deref() {
                Some(raw) => parse_url(raw)?,
                None => base_url.clone(),
            };
            Some(LoginParams {
                auth_base_url,
                email: self
                    .test_email
                    .unwrap_or_else(|| "perftest@example.com".to_string()),
                password: self
                    .test_password
                    .unwrap_or_else(|| "Passw0rd!".to_string()),
            })
        } else {
            None
        };

        let auth = AuthParams {
            enabled: self
                .auth
                .unwrap_or(matches!(workload, Workload::Search)),
            jwt: JwtParams {
                secret: self
                    .jwt_secret
                    .unwrap_or_else(|| DEFAULT_JWT_SECRET.to_string()),
                issuer: self
                    .jwt_issuer
                    .unwrap_or_else(|| DEFAULT_JWT_ISSUER.to_string()),
                audience: self
                    .jwt_audience
                    .unwrap_or_else(|| DEFAULT_JWT_AUDIENCE.to_string()),
                ttl_seconds: positive(
                    "JWT_TTL_SECONDS",
                    self.jwt_ttl_seconds.unwrap_or(DEFAULT_JWT_TTL_SECONDS),
                )?,
                issued_at: self.jwt_issued_at,
            },
            override_token: self.jwt_override.filter(|t| !t.is_empty()),
            login,
        };

        let forwarded_for = match self.forwarded_for.filter(|f| !f.is_empty()) {
            Some(fixed) => ForwardedFor::Fixed(fixed),
            None if workload == Workload::RateLimit => ForwardedFor::PerClient,
            None => ForwardedFor::None,
        };

        let thresholds = match self.thresholds.as_deref() {
            Some(raw) => raw
                .split(';')
                .map(str::trim)
                .filter(|expr| !expr.is_empty())
                .map(|expr| expr.parse::<Threshold>())
                .collect::<Result<Vec<_>, _>>()?,
            None => Threshold::defaults(mode, workload),
        };

        Ok(RunConfig {
            base_url,
            paths,
            workload,
            method,
            body: self.body,
            content_type: self
                .content_type
                .unwrap_or_else(|| "application/json".to_string()),
            mode,
            executor,
            scenario,
            ramp,
            test_id: self
                .test_id
                .unwrap_or_else(|| format!("{workload}-{mode}")),
            rps,
            max_vus,
            target_vus,
            preallocated_vus,
            duration,
            load,
            stress,
            search,
            auth,
            forwarded_for,
            think_time: self
                .think_time_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| workload.default_think_time()),
            request_timeout: duration_field(
                "REQUEST_TIMEOUT",
                self.request_timeout.as_deref(),
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            graceful_stop: duration_field(
                "GRACEFUL_STOP",
                self.graceful_stop.as_deref(),
                DEFAULT_GRACEFUL_STOP,
            )?,
            max_duration: optional_duration("MAX_DURATION", self.max_duration.as_deref())?,
            warmup_requests: self.warmup_requests.unwrap_or(DEFAULT_WARMUP_REQUESTS),
            seed: self.seed.unwrap_or(1),
            thresholds,
            summary_export: self.summary_export,
        })
    }
}
