//! Functions and structures related to configuring a load test.
//!
//! A load test is configured at run time by passing in the options and
//! flags defined by the [`Configuration`] structure, which is parsed from
//! the command line with [`gumdrop`](https://docs.rs/gumdrop/) or built
//! programmatically (the integration tests do the latter).
//!
//! A [`Configuration`] is validated once into a [`LoadPlan`] when the load
//! test is created, and is immutable for the duration of the run.

use std::time::Duration;

use gumdrop::Options;
use serde::{Deserialize, Serialize};

use crate::util;
use crate::Error;

/// Open-loop target rate used when neither `--rate` nor `--users` is given.
const DEFAULT_RATE: f64 = 10.0;
/// Steady-phase duration used when `--duration` is not given.
const DEFAULT_DURATION: Duration = Duration::from_secs(10);
/// Per-request timeout used when `--timeout` is not given.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime options available when launching a load test.
///
/// All duration-valued options accept humane time spans: `30`, `30s`,
/// `1m30s`, `250ms`, etc.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede is a high-performance HTTP and shell-command load generator.

Passing --url or --command runs a headless load test; all runtime options:"#
)]
pub struct Configuration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Target URL, templated (enables headless mode)
    #[options(short = "u", meta = "URL")]
    pub url: String,
    /// HTTP method (default: GET)
    #[options(short = "X", meta = "METHOD")]
    pub method: String,
    /// Request body, templated; a leading @ loads a file
    #[options(short = "b", meta = "BODY")]
    pub body: String,
    /// HTTP header as "Name: Value", repeatable; values are templated
    #[options(short = "H", meta = "HEADER")]
    pub header: Vec<String>,
    /// Shell command to run per request instead of an HTTP call, templated
    #[options(short = "c", meta = "CMD")]
    pub command: String,

    /// Target requests per second (open loop, default: 10)
    #[options(short = "r", meta = "RATE")]
    pub rate: Option<f64>,
    /// Concurrent virtual users (closed loop, overrides --rate)
    #[options(short = "U", meta = "USERS")]
    pub users: Option<usize>,
    /// Steady-phase duration (default: 10s)
    #[options(short = "d", meta = "TIME")]
    pub duration: String,
    /// Ramp-up duration (default: 0)
    #[options(no_short, meta = "TIME")]
    pub ramp_up: String,
    /// Ramp-down duration (default: 0)
    #[options(no_short, meta = "TIME")]
    pub ramp_down: String,
    /// Per-request timeout (default: 30s)
    #[options(no_short, meta = "TIME")]
    pub timeout: String,
    /// Per-user think time between requests (closed loop, default: 0)
    #[options(no_short, meta = "TIME")]
    pub think_time: String,

    /// Output filename prefix for CSV/JSON auto-export
    #[options(short = "o", meta = "PREFIX")]
    pub out: String,
    /// Validates TLS certificates (disabled by default: this is a load
    /// generator, not a security client)
    #[options(no_short)]
    pub validate_certs: bool,
    /// Increases output verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// Which arrival-process model drives the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Constant arrival rate: requests are emitted on a fixed schedule,
    /// independent of how the target responds.
    OpenLoop { rate: f64 },
    /// Fixed concurrency: each of `users` workers emits its next request
    /// only after the previous one completes.
    ClosedLoop { users: usize },
}

/// A validated, immutable plan derived from a [`Configuration`].
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub mode: Mode,
    pub method: reqwest::Method,
    /// Parsed `Name: Value` pairs; values are templated per request.
    pub headers: Vec<(String, String)>,
    pub steady: Duration,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
    pub timeout: Duration,
    pub think_time: Duration,
}

impl LoadPlan {
    /// Ramp-up plus steady plus ramp-down.
    pub fn total_duration(&self) -> Duration {
        self.ramp_up + self.steady + self.ramp_down
    }
}

impl Configuration {
    /// Whether this run invokes a shell command instead of an HTTP target.
    pub fn is_command_mode(&self) -> bool {
        !self.command.is_empty()
    }

    /// Validate the configuration into a [`LoadPlan`].
    ///
    /// All configuration faults surface here, before the run starts; a
    /// running load test never reports a configuration error.
    pub fn plan(&self) -> Result<LoadPlan, Error> {
        if self.url.is_empty() && self.command.is_empty() {
            return Err(Error::InvalidOption {
                option: "--url".to_string(),
                value: String::new(),
                detail: "either --url or --command is required".to_string(),
            });
        }
        if !self.command.is_empty() {
            // A shell command replaces the entire HTTP surface.
            if !self.url.is_empty() || !self.body.is_empty() || !self.header.is_empty() {
                return Err(Error::InvalidOption {
                    option: "--command".to_string(),
                    value: self.command.clone(),
                    detail: "--command can not be combined with --url, --body or --header"
                        .to_string(),
                });
            }
        }

        // Templated urls can't be validated until they're rendered, but a
        // static url that doesn't parse is a configuration fault.
        if !self.url.is_empty() && !self.url.contains("{{") {
            if let Err(e) = url::Url::parse(&self.url) {
                return Err(Error::InvalidOption {
                    option: "--url".to_string(),
                    value: self.url.clone(),
                    detail: format!("invalid url: {}", e),
                });
            }
        }

        let method = if self.method.is_empty() {
            reqwest::Method::GET
        } else {
            reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes()).map_err(|_| {
                Error::InvalidOption {
                    option: "--method".to_string(),
                    value: self.method.clone(),
                    detail: "invalid HTTP method".to_string(),
                }
            })?
        };

        let mut headers = Vec::with_capacity(self.header.len());
        for header in &self.header {
            match header.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
                _ => {
                    return Err(Error::InvalidOption {
                        option: "--header".to_string(),
                        value: header.clone(),
                        detail: "expected \"Name: Value\"".to_string(),
                    });
                }
            }
        }

        let mode = match self.users {
            Some(0) => {
                return Err(Error::InvalidOption {
                    option: "--users".to_string(),
                    value: "0".to_string(),
                    detail: "at least 1 user is required".to_string(),
                });
            }
            // --users overrides --rate.
            Some(users) => Mode::ClosedLoop { users },
            None => {
                let rate = self.rate.unwrap_or(DEFAULT_RATE);
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(Error::InvalidOption {
                        option: "--rate".to_string(),
                        value: format!("{}", rate),
                        detail: "rate must be a positive number of requests per second"
                            .to_string(),
                    });
                }
                Mode::OpenLoop { rate }
            }
        };

        let steady = self.parse_time_option("--duration", &self.duration, DEFAULT_DURATION)?;
        let ramp_up = self.parse_time_option("--ramp-up", &self.ramp_up, Duration::ZERO)?;
        let ramp_down = self.parse_time_option("--ramp-down", &self.ramp_down, Duration::ZERO)?;
        let timeout = self.parse_time_option("--timeout", &self.timeout, DEFAULT_TIMEOUT)?;
        let think_time = self.parse_time_option("--think-time", &self.think_time, Duration::ZERO)?;

        if timeout.is_zero() {
            return Err(Error::InvalidOption {
                option: "--timeout".to_string(),
                value: self.timeout.clone(),
                detail: "timeout must be greater than zero".to_string(),
            });
        }
        if (ramp_up + steady + ramp_down).is_zero() {
            return Err(Error::InvalidOption {
                option: "--duration".to_string(),
                value: self.duration.clone(),
                detail: "total run duration must be greater than zero".to_string(),
            });
        }

        Ok(LoadPlan {
            mode,
            method,
            headers,
            steady,
            ramp_up,
            ramp_down,
            timeout,
            think_time,
        })
    }

    fn parse_time_option(
        &self,
        option: &str,
        value: &str,
        default: Duration,
    ) -> Result<Duration, Error> {
        if value.is_empty() {
            return Ok(default);
        }
        util::parse_duration(value).ok_or_else(|| Error::InvalidOption {
            option: option.to_string(),
            value: value.to_string(),
            detail: "expected a time span such as 30, 30s, 1m30s or 250ms".to_string(),
        })
    }
}
