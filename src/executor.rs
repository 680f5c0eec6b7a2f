//! Performs one scheduled request and records its outcome.
//!
//! The executor is handed a scheduled instant and a virtual-user identity
//! by the scheduler, renders the configured templates, performs either an
//! HTTP request or a shell invocation, and folds the timing and
//! classification into the shared [`Stats`] aggregator and the run's
//! result log. Per-request faults of any kind are captured in the
//! [`RequestOutcome`]; nothing propagates out of [`execute`] and the
//! executor never retries.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{Configuration, LoadPlan};
use crate::stats::{self, RequestOutcome, Stats, RESPONSE_SAMPLE_BYTES};
use crate::template::{header_template_name, TemplateEngine, TEMPLATE_BODY, TEMPLATE_COMMAND, TEMPLATE_URL};
use crate::util;

/// A virtual-user identity, exposed to templates as `{{userID}}`.
///
/// Closed-loop workers keep one identity for their whole lifetime;
/// open-loop emissions get a fresh identity per request.
#[derive(Debug, Clone)]
pub(crate) struct UserIdentity {
    pub(crate) id: String,
}

impl UserIdentity {
    pub(crate) fn fresh() -> UserIdentity {
        UserIdentity {
            id: Uuid::new_v4().to_string(),
        }
    }
}

/// Decrements the in-flight counter when dropped, guaranteeing the
/// decrement on every exit path out of [`RequestExecutor::execute`].
struct InFlightGuard<'a>(&'a AtomicI64);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What one HTTP round trip or shell invocation produced, before timing is
/// attached.
struct RawResult {
    status: u16,
    success: bool,
    bytes: u64,
    error: Option<String>,
    response_sample: Option<String>,
}

pub(crate) struct RequestExecutor {
    configuration: Configuration,
    plan: LoadPlan,
    templates: TemplateEngine,
    /// Shared connection-pooling client; `None` in shell-command mode.
    client: Option<reqwest::Client>,
    stats: Arc<Stats>,
    in_flight: Arc<AtomicI64>,
    outcomes: Arc<Mutex<Vec<RequestOutcome>>>,
}

impl RequestExecutor {
    pub(crate) fn new(
        configuration: Configuration,
        plan: LoadPlan,
        templates: TemplateEngine,
        stats: Arc<Stats>,
        in_flight: Arc<AtomicI64>,
        outcomes: Arc<Mutex<Vec<RequestOutcome>>>,
    ) -> Result<RequestExecutor, crate::Error> {
        let client = if configuration.is_command_mode() {
            None
        } else {
            // One shared client with a pool large enough that concurrency
            // is never limited by connection reuse. Certificate validation
            // is off unless explicitly requested.
            Some(
                reqwest::Client::builder()
                    .user_agent(crate::APP_USER_AGENT)
                    .pool_max_idle_per_host(2000)
                    .danger_accept_invalid_certs(!configuration.validate_certs)
                    .timeout(plan.timeout)
                    .build()?,
            )
        };
        Ok(RequestExecutor {
            configuration,
            plan,
            templates,
            client,
            stats,
            in_flight,
            outcomes,
        })
    }

    /// Perform one request scheduled for `scheduled`, as `user`.
    ///
    /// The scheduled instant, not the actual start, is the origin for
    /// total latency: queue wait measures the scheduler's own slippage
    /// and total latency is what a real caller would have observed.
    pub(crate) async fn execute(&self, scheduled: Instant, user: &UserIdentity) {
        let actual_start = Instant::now();
        let queue_wait = actual_start.saturating_duration_since(scheduled);
        let timestamp = Utc::now()
            - chrono::Duration::from_std(queue_wait).unwrap_or_else(|_| chrono::Duration::zero());

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let request_id = Uuid::new_v4().to_string();

        let raw = if self.configuration.is_command_mode() {
            self.run_command(user, &request_id).await
        } else {
            self.run_http(user, &request_id).await
        };

        let end = Instant::now();
        let outcome = RequestOutcome {
            timestamp,
            user_id: user.id.clone(),
            request_id,
            status: raw.status,
            success: raw.success,
            bytes: raw.bytes,
            total_latency: end.saturating_duration_since(scheduled),
            service_time: end.saturating_duration_since(actual_start),
            queue_wait,
            error: raw.error,
            response_sample: raw.response_sample,
        };

        self.stats.add(&outcome);
        let mut log = self.outcomes.lock().expect("result log mutex poisoned");
        log.push(outcome);
    }

    /// Spawn the rendered command through the platform shell and classify
    /// its exit: 0 becomes a synthetic 200, a non-zero exit becomes that
    /// status with stderr retained as the response sample.
    async fn run_command(&self, user: &UserIdentity, request_id: &str) -> RawResult {
        let command = self.templates.render(TEMPLATE_COMMAND, &user.id, request_id);
        match shell_command(&command).output().await {
            Ok(output) => {
                if output.status.success() {
                    RawResult {
                        status: 200,
                        success: true,
                        bytes: output.stdout.len() as u64,
                        error: None,
                        response_sample: None,
                    }
                } else {
                    let status = match output.status.code() {
                        Some(code) if code > 0 && code <= u16::MAX as i32 => code as u16,
                        // Killed by signal, or an exit code that doesn't
                        // fit a status code.
                        _ => 500,
                    };
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let stderr = stderr.trim();
                    let error = if stderr.is_empty() {
                        format!("exit status {}", status)
                    } else {
                        stats::normalize_error(stderr)
                    };
                    RawResult {
                        status,
                        success: false,
                        bytes: output.stdout.len() as u64,
                        error: Some(error),
                        response_sample: (!stderr.is_empty())
                            .then(|| util::truncate_string(stderr, RESPONSE_SAMPLE_BYTES)),
                    }
                }
            }
            Err(e) => {
                debug!("failed to spawn shell for '{}': {}", command, e);
                RawResult {
                    status: 500,
                    success: false,
                    bytes: 0,
                    error: Some(format!("failed to spawn shell: {}", e)),
                    response_sample: None,
                }
            }
        }
    }

    /// Build and send one HTTP request, always consuming the response body
    /// so the pooled connection is returned for reuse.
    async fn run_http(&self, user: &UserIdentity, request_id: &str) -> RawResult {
        let url = self.templates.render(TEMPLATE_URL, &user.id, request_id);
        let client = self
            .client
            .as_ref()
            .expect("http client is always built outside command mode");
        let mut request = client.request(self.plan.method.clone(), &url);

        let mut content_type_given = false;
        for (index, (name, _)) in self.plan.headers.iter().enumerate() {
            let value = self
                .templates
                .render(&header_template_name(index), &user.id, request_id);
            if name.eq_ignore_ascii_case("content-type") {
                content_type_given = true;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    request = request.header(name, value);
                }
                _ => {
                    warn!("skipping invalid header '{}: {}'", name, value);
                }
            }
        }

        if !self.configuration.body.is_empty() {
            let body = self.templates.render(TEMPLATE_BODY, &user.id, request_id);
            if !content_type_given {
                request = request.header(CONTENT_TYPE, "application/json");
            }
            request = request.body(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let success = response.status().is_success();
                let body = response.bytes().await.unwrap_or_default();
                RawResult {
                    status,
                    success,
                    bytes: body.len() as u64,
                    error: (!success).then(|| format!("HTTP {}", status)),
                    response_sample: (status >= 400 && !body.is_empty()).then(|| {
                        util::truncate_string(&String::from_utf8_lossy(&body), RESPONSE_SAMPLE_BYTES)
                    }),
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    "Client timeout".to_string()
                } else {
                    stats::normalize_error(&error_chain(&e))
                };
                debug!("request to '{}' failed: {}", url, error);
                RawResult {
                    status: 0,
                    success: false,
                    bytes: 0,
                    error: Some(error),
                    response_sample: None,
                }
            }
        }
    }
}

/// Render an error and its sources as one `": "`-separated chain, so the
/// normalizer sees the transport-level cause and not just the top-level
/// wrapper.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut segments = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        segments.push(cause.to_string());
        source = cause.source();
    }
    segments.join(": ")
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut shell = tokio::process::Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut shell = tokio::process::Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}
