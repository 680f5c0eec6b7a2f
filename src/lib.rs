//! # Stampede
//!
//! Stampede is a high-performance HTTP and shell-command load generator.
//! It drives a target under one of two well-defined arrival-process
//! models, measures per-request timing with Coordinated-Omission-aware
//! accounting, and streams aggregate statistics to a consumer at a fixed
//! cadence.
//!
//! ## Arrival models
//!
//! **Open loop** (`--rate`) emits requests on a constant-rate schedule
//! that is independent of how the target responds, the way real traffic
//! arrives at a public service. The instantaneous rate ramps linearly up
//! over `--ramp-up`, holds for `--duration`, and ramps linearly down over
//! `--ramp-down`. Every request is stamped with the instant it was
//! *supposed* to start: `total_latency` is measured from that instant, so
//! a stalling server can't hide its latency spikes behind a slowed-down
//! generator (the Coordinated Omission problem), and `queue_wait` exposes
//! the generator's own slippage separately.
//!
//! **Closed loop** (`--users`) runs a fixed pool of virtual users, each
//! issuing its next request only after the previous one completes, with
//! an optional `--think-time` between requests, the way a pool of
//! browsers or worker processes behaves. Each closed-loop user keeps one
//! stable identity for the whole run; open-loop requests get a fresh
//! identity each (see the [`template`] module for how identities reach
//! templates).
//!
//! ## Using the library
//!
//! ```rust,no_run
//! use stampede::{Configuration, LoadTest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stampede::Error> {
//!     let configuration = Configuration {
//!         url: "http://127.0.0.1:8080/search?q={{ randomLine(\"queries.txt\") }}".to_string(),
//!         rate: Some(250.0),
//!         duration: "2m".to_string(),
//!         ramp_up: "30s".to_string(),
//!         ..Configuration::default()
//!     };
//!
//!     let load_test = LoadTest::new(configuration)?;
//!     let snapshots = load_test.snapshots();
//!     tokio::spawn(async move {
//!         while let Ok(snapshot) = snapshots.recv_async().await {
//!             println!("{} requests, {} in flight", snapshot.requests, snapshot.in_flight);
//!         }
//!     });
//!
//!     let report = load_test.execute().await?;
//!     println!("done: {} requests", report.snapshot.requests);
//!     Ok(())
//! }
//! ```
//!
//! Configuration faults (an invalid option, a template that doesn't
//! parse) surface from [`LoadTest::new`] before anything runs. Faults of
//! individual requests (transport errors, HTTP errors, crashing shell
//! commands) never abort a run: they're folded into the statistics and
//! the result log.

#[macro_use]
extern crate log;

pub mod config;
mod executor;
pub mod histogram;
pub mod report;
mod scheduler;
pub mod stats;
pub mod template;
mod ticker;
pub mod util;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub use config::{Configuration, LoadPlan, Mode};
pub use stats::{RequestOutcome, Snapshot};
pub use template::TemplateEngine;

use executor::RequestExecutor;
use stats::Stats;

/// User agent sent with every HTTP request.
pub(crate) static APP_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// How many snapshots the bounded channel buffers before the ticker
/// starts dropping them.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 100;

/// Any fatal error that can keep a load test from starting.
///
/// Per-request failures are never represented here; they're recorded in
/// the [`RequestOutcome`] log and summarized in [`Snapshot`]s.
#[derive(Debug)]
pub enum Error {
    /// Wraps a [`std::io::Error`].
    Io(std::io::Error),
    /// Wraps a [`reqwest::Error`], typically from building the client.
    Reqwest(reqwest::Error),
    /// A configuration option failed validation.
    InvalidOption {
        option: String,
        value: String,
        detail: String,
    },
    /// A templated field failed to parse.
    InvalidTemplate { field: String, detail: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Reqwest(e) => write!(f, "reqwest error: {}", e),
            Error::InvalidOption {
                option,
                value,
                detail,
            } => write!(f, "invalid option {} '{}': {}", option, value, detail),
            Error::InvalidTemplate { field, detail } => {
                write!(f, "invalid {} template: {}", field, detail)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Reqwest(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        Error::Reqwest(e)
    }
}

/// Everything a completed run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Human-readable description of the target, e.g. `GET http://…`.
    pub label: String,
    /// Wall-clock time the run started.
    pub started: DateTime<Utc>,
    /// How long the run took, including the drain.
    pub elapsed: Duration,
    /// The final aggregate statistics; `in_flight` is always 0 here.
    pub snapshot: Snapshot,
    /// One entry per request, ordered by completion (not emission).
    pub outcomes: Vec<RequestOutcome>,
}

/// Owns every component of one load test run: the statistics aggregator,
/// the request executor, the scheduler and the snapshot ticker.
///
/// Construction validates the configuration and parses all templates;
/// [`execute`](Self::execute) runs the schedule to completion (or
/// cancellation), drains in-flight requests, publishes one final
/// snapshot, and returns the [`RunReport`].
pub struct LoadTest {
    plan: LoadPlan,
    label: String,
    stats: Arc<Stats>,
    in_flight: Arc<AtomicI64>,
    outcomes: Arc<Mutex<Vec<RequestOutcome>>>,
    canceled: Arc<AtomicBool>,
    executor: Arc<RequestExecutor>,
    snapshot_tx: flume::Sender<Snapshot>,
    snapshot_rx: flume::Receiver<Snapshot>,
}

impl LoadTest {
    /// Validate `configuration` and prepare all components.
    ///
    /// This is where every configuration fault surfaces: option
    /// validation, static url parsing, and template parsing. A
    /// [`LoadTest`] that constructs successfully will not fail to start.
    pub fn new(configuration: Configuration) -> Result<LoadTest, Error> {
        let plan = configuration.plan()?;
        let templates = prepare_templates(&configuration, &plan)?;

        let label = if configuration.is_command_mode() {
            configuration.command.clone()
        } else {
            format!("{} {}", plan.method, configuration.url)
        };

        let stats = Arc::new(Stats::new());
        let in_flight = Arc::new(AtomicI64::new(0));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(RequestExecutor::new(
            configuration,
            plan.clone(),
            templates,
            stats.clone(),
            in_flight.clone(),
            outcomes.clone(),
        )?);
        let (snapshot_tx, snapshot_rx) = flume::bounded(SNAPSHOT_CHANNEL_CAPACITY);

        Ok(LoadTest {
            plan,
            label,
            stats,
            in_flight,
            outcomes,
            canceled: Arc::new(AtomicBool::new(false)),
            executor,
            snapshot_tx,
            snapshot_rx,
        })
    }

    /// The receiving side of the bounded snapshot channel.
    ///
    /// One snapshot is published roughly every 100 ms while the run is
    /// active, plus one final snapshot after the drain. The producer
    /// never blocks: when the consumer falls behind, intermediate
    /// snapshots are dropped.
    pub fn snapshots(&self) -> flume::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }

    /// The one-way cancellation latch shared with the scheduler.
    ///
    /// Setting it stops further emission; in-flight requests still
    /// complete under their per-request timeout, and
    /// [`execute`](Self::execute) returns only after the drain.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.canceled.clone()
    }

    /// The validated plan this run will follow.
    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    /// Human-readable description of the target.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the load test to completion and return the finalized report.
    pub async fn execute(self) -> Result<RunReport, Error> {
        // A clean aggregate regardless of what the caller did with this
        // Stats instance before; nothing is in flight yet.
        self.stats.reset();
        let started = Instant::now();
        let started_at = Utc::now();
        info!("starting load test: {}", self.label);

        let (stop_tx, stop_rx) = flume::bounded(1);
        let ticker = tokio::spawn(ticker::ticker_main(
            self.stats.clone(),
            self.in_flight.clone(),
            started,
            self.snapshot_tx.clone(),
            stop_rx,
        ));

        match self.plan.mode {
            Mode::OpenLoop { rate } => {
                scheduler::open_loop(&self.plan, rate, &self.executor, &self.canceled).await;
            }
            Mode::ClosedLoop { users } => {
                scheduler::closed_loop(&self.plan, users, &self.executor, &self.canceled).await;
            }
        }

        // The scheduler only returns after the drain: every emitted
        // request has completed. Now stop the ticker; it publishes the
        // final snapshot on its way out.
        let _ = stop_tx.send_async(()).await;
        if let Err(e) = ticker.await {
            warn!("snapshot ticker task failed: {}", e);
        }

        let elapsed = started.elapsed();
        let snapshot = self
            .stats
            .snapshot(self.in_flight.load(Ordering::SeqCst), elapsed);
        let outcomes = {
            let mut log = self.outcomes.lock().expect("result log mutex poisoned");
            std::mem::take(&mut *log)
        };
        info!(
            "load test complete: {} requests ({} failed) in {:.1}s",
            snapshot.requests,
            snapshot.failures,
            elapsed.as_secs_f64()
        );

        Ok(RunReport {
            label: self.label,
            started: started_at,
            elapsed,
            snapshot,
            outcomes,
        })
    }
}

/// Parse every templated field of the configuration into one engine.
fn prepare_templates(
    configuration: &Configuration,
    plan: &LoadPlan,
) -> Result<TemplateEngine, Error> {
    let mut templates = TemplateEngine::new();
    if configuration.is_command_mode() {
        templates.add_template(template::TEMPLATE_COMMAND, &configuration.command)?;
    } else {
        templates.add_template(template::TEMPLATE_URL, &configuration.url)?;
        if !configuration.body.is_empty() {
            templates.add_template(
                template::TEMPLATE_BODY,
                &template::body_source(&configuration.body),
            )?;
        }
        for (index, (_, value)) in plan.headers.iter().enumerate() {
            templates.add_template(&template::header_template_name(index), value)?;
        }
    }
    Ok(templates)
}
