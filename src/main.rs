//! Headless command-line entry point.
//!
//! Passing `--url` or `--command` runs a headless load test with a
//! one-line progress display and a final summary; this is the mode meant
//! for CI and scripted runs. Without a target, the binary points at the
//! interactive dashboard, which is a separate frontend consuming the same
//! snapshot channel.

use std::io::Write;
use std::time::Duration;

use gumdrop::Options;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use stampede::{report, util, Configuration, LoadTest, Mode, Snapshot};

fn main() {
    let configuration = Configuration::parse_args_default_or_exit();
    if configuration.version {
        println!("stampede {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    initialize_logger(configuration.verbose);

    if configuration.url.is_empty() && configuration.command.is_empty() {
        eprintln!("stampede: no target specified");
        eprintln!("  pass --url or --command to run a headless load test,");
        eprintln!("  or launch the interactive dashboard frontend for the terminal UI");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("stampede: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    std::process::exit(runtime.block_on(headless(configuration)));
}

async fn headless(configuration: Configuration) -> i32 {
    let out_prefix = configuration.out.clone();

    // All configuration faults surface here, before anything runs.
    let load_test = match LoadTest::new(configuration) {
        Ok(load_test) => load_test,
        Err(e) => {
            eprintln!("stampede: {}", e);
            return 1;
        }
    };

    print_header(&load_test);

    let snapshots = load_test.snapshots();
    let canceled = load_test.cancel_handle();
    util::setup_ctrlc_handler(&canceled);
    let total = load_test.plan().total_duration();

    let run = tokio::spawn(load_test.execute());

    // The snapshot stream ends when the run is over and the final
    // snapshot has been delivered.
    while let Ok(snapshot) = snapshots.recv_async().await {
        print_progress(&snapshot, total);
    }
    println!();

    match run.await {
        Ok(Ok(report)) => {
            report::print_summary(&report);
            if !out_prefix.is_empty() {
                if let Err(e) = report::export_all(&report, &out_prefix) {
                    eprintln!("stampede: failed to write reports: {}", e);
                    return 1;
                }
                println!("reports saved with prefix: {}", out_prefix);
            }
            0
        }
        Ok(Err(e)) => {
            eprintln!("stampede: {}", e);
            1
        }
        Err(e) => {
            eprintln!("stampede: load test task failed: {}", e);
            1
        }
    }
}

fn initialize_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // Logs go to stderr so the progress line owns stdout.
    if let Err(e) = TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto)
    {
        eprintln!("failed to initialize logger: {}", e);
    }
}

fn print_header(load_test: &LoadTest) {
    let plan = load_test.plan();
    println!("\n === STAMPEDE LOAD TEST ===");
    println!(" Target:   {}", load_test.label());
    match plan.mode {
        Mode::OpenLoop { rate } => println!(" Mode:     open loop, {} req/s", rate),
        Mode::ClosedLoop { users } => println!(" Mode:     closed loop, {} users", users),
    }
    println!(
        " Duration: {:?} steady + {:?} ramp up + {:?} ramp down",
        plan.steady, plan.ramp_up, plan.ramp_down
    );
    println!(" Timeout:  {:?}\n", plan.timeout);
}

fn print_progress(snapshot: &Snapshot, total: Duration) {
    let fraction = if total.is_zero() {
        1.0
    } else {
        (snapshot.elapsed.as_secs_f64() / total.as_secs_f64()).min(1.0)
    };
    print!(
        "\r{} {:3.0}% | {}s/{}s | Inf: {:3} | RPS: {:7.1} | OK: {} | Err: {}",
        progress_bar(fraction, 20),
        fraction * 100.0,
        snapshot.elapsed.as_secs(),
        total.as_secs(),
        snapshot.in_flight,
        snapshot.requests_per_second(),
        snapshot.successes,
        snapshot.failures,
    );
    let _ = std::io::stdout().flush();
}

fn progress_bar(fraction: f64, width: usize) -> String {
    let filled = ((fraction * width as f64) as usize).min(width);
    format!("[{}{}]", "█".repeat(filled), "-".repeat(width - filled))
}
