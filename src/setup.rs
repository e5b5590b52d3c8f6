//! Run-level setup: runs once before any scheduled traffic.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{LoginParams, RunConfig, ScenarioTag};
use crate::credential::{self, Claims, Credential, CredentialSource};
use crate::executor::{execute, join_url, IterationResult, RequestTemplate};
use crate::metrics::{Metrics, ScenarioMetrics};
use crate::scheduler::{AbortHandle, VirtualClient};

/// Tag for traffic generated during setup. Never part of the run's thresholds.
pub const SETUP_TAG: &str = "setup";

const LOGIN_ATTEMPTS: u32 = 3;
const LOGIN_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
}

/// What setup produced for the scheduled phase.
pub struct Prepared {
    pub template: RequestTemplate,
    pub credential_source: Option<CredentialSource>,
    pub preflight_status: Option<u16>,
}

pub async fn prepare(
    http: &Client,
    config: &RunConfig,
    metrics: &Metrics,
    abort: &AbortHandle,
) -> Result<Prepared> {
    let credential = if config.auth.enabled {
        Some(acquire_credential(http, config).await?)
    } else {
        None
    };
    let credential_source = credential.as_ref().map(Credential::source);
    let template =
        RequestTemplate::from_config(config, credential).context("Failed to build request")?;

    let series = metrics
        .series(SETUP_TAG)
        .await
        .context("Failed to create setup metrics")?;

    let preflight = preflight(http, &template, &series).await;
    if config.scenario == ScenarioTag::Cache && config.warmup_requests > 0 {
        warm_up(http, &template, &series, config.warmup_requests, abort).await;
    }

    Ok(Prepared {
        template,
        credential_source,
        preflight_status: preflight.status,
    })
}

/// Override, then login when enabled, then local minting. Login failures fall through to minting.
pub async fn acquire_credential(http: &Client, config: &RunConfig) -> Result<Credential> {
    let auth = &config.auth;
    if let Some(token) = &auth.override_token {
        info!("Using credential override");
        return Ok(Credential::from_override(token.clone()));
    }

    if let Some(login_params) = &auth.login {
        match login(http, login_params).await {
            Some(token) => {
                info!("Using credential from login as {}", login_params.email);
                return Ok(Credential::from_login(token));
            }
            None => warn!("Login failed, minting a credential locally"),
        }
    }

    let jwt = &auth.jwt;
    let claims = Claims::new(
        config.search.user_id.to_string(),
        jwt.issuer.clone(),
        jwt.audience.clone(),
        jwt.issued_at_or_now(),
        jwt.ttl_seconds,
    );
    let credential = credential::mint(&jwt.secret, &claims).context("Failed to mint credential")?;
    info!(
        "Minted credential for subject {} (expires at {})",
        claims.subject, claims.expires_at
    );
    debug!("Credential: {credential}");
    Ok(credential)
}

/// Best-effort register, then up to three login attempts. `None` when no token came back.
async fn login(http: &Client, params: &LoginParams) -> Option<String> {
    let body = match sonic_rs::to_string(&LoginRequest {
        email: &params.email,
        password: &params.password,
    }) {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to encode login request: {e}");
            return None;
        }
    };

    let register_url = join_url(&params.auth_base_url, "/auth/register").ok()?;
    match http
        .post(register_url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.clone())
        .send()
        .await
    {
        Ok(response) => debug!("Register returned {}", response.status()),
        Err(e) => debug!("Register failed: {e}"),
    }

    let login_url = join_url(&params.auth_base_url, "/auth/login").ok()?;
    for attempt in 1..=LOGIN_ATTEMPTS {
        let result = http
            .post(login_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let bytes = response.bytes().await.unwrap_or_default();
                if status == 200 {
                    let token = sonic_rs::from_slice::<LoginResponse>(&bytes)
                        .ok()
                        .and_then(|r| r.access_token)
                        .filter(|t| !t.is_empty());
                    if token.is_some() {
                        return token;
                    }
                }
                let snippet: String = String::from_utf8_lossy(&bytes).chars().take(120).collect();
                warn!("Login attempt {attempt} failed: status={status} body={snippet}");
            }
            Err(e) => warn!("Login attempt {attempt} failed: {e}"),
        }
        if attempt < LOGIN_ATTEMPTS {
            sleep(LOGIN_RETRY_DELAY).await;
        }
    }
    None
}

/// One request against the target before traffic starts. The outcome is only logged.
pub async fn preflight(
    http: &Client,
    template: &RequestTemplate,
    series: &ScenarioMetrics,
) -> IterationResult {
    let result = execute(http, template, &VirtualClient::default()).await;
    series.record(&result).await;
    match result.status {
        Some(status) => info!("Preflight: status {status} in {:?}", result.elapsed),
        None => warn!("Preflight: no response after {:?}", result.elapsed),
    }
    result
}

/// Sequential requests that prime the target's cache before the measured phase. Stops early
/// once the run is aborted; returns how many requests were sent.
pub async fn warm_up(
    http: &Client,
    template: &RequestTemplate,
    series: &ScenarioMetrics,
    requests: u32,
    abort: &AbortHandle,
) -> u32 {
    info!("Warming up cache with {requests} requests");
    let mut client = VirtualClient::default();
    let mut sent = 0;
    while sent < requests {
        if abort.is_aborted() {
            warn!("Cache warm-up aborted after {sent} of {requests} requests");
            return sent;
        }
        let result = execute(http, template, &client).await;
        series.record(&result).await;
        client.iteration += 1;
        sent += 1;
    }
    info!("Cache warm-up complete");
    sent
}
