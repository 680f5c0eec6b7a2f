//! Export and display of finalized run results.
//!
//! These functions consume the result log and final snapshot of a
//! completed [`RunReport`](crate::RunReport); they never influence
//! scheduling. CSV export uses the JMeter-compatible column set so the
//! output drops into existing analysis tooling, with the queue wait
//! carried in the `IdleTime` column.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::SecondsFormat;
use num_format::{Locale, ToFormattedString};

use crate::stats::RequestOutcome;
use crate::util;
use crate::RunReport;

/// Longest response-sample excerpt shown in the console failure summary.
const SAMPLE_DISPLAY_LENGTH: usize = 120;

/// Write one CSV row per outcome, JMeter column set, timestamps in epoch
/// milliseconds and durations in milliseconds.
pub fn write_csv(report: &RunReport, path: &Path) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(
        writer,
        "timeStamp,elapsed,label,responseCode,responseMessage,threadName,success,failureMessage,bytes,Latency,IdleTime"
    )?;
    for outcome in &report.outcomes {
        let response_message = if outcome.success { "OK" } else { "" };
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{}",
            outcome.timestamp.timestamp_millis(),
            outcome.total_latency.as_millis(),
            csv_escape(&report.label),
            outcome.status,
            response_message,
            csv_escape(&outcome.user_id),
            outcome.success,
            csv_escape(outcome.error.as_deref().unwrap_or("")),
            outcome.bytes,
            outcome.service_time.as_millis(),
            outcome.queue_wait.as_millis(),
        )?;
    }
    writer.flush()
}

/// Write the result log as a JSON array, ISO-8601 timestamps and duration
/// fields in milliseconds.
pub fn write_json(report: &RunReport, path: &Path) -> std::io::Result<()> {
    let outcomes: Vec<serde_json::Value> = report.outcomes.iter().map(outcome_json).collect();
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &outcomes)?;
    Ok(())
}

fn outcome_json(outcome: &RequestOutcome) -> serde_json::Value {
    serde_json::json!({
        "timestamp": outcome.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "user_id": outcome.user_id,
        "request_id": outcome.request_id,
        "status": outcome.status,
        "success": outcome.success,
        "bytes": outcome.bytes,
        "total_latency_ms": outcome.total_latency.as_secs_f64() * 1_000.0,
        "service_time_ms": outcome.service_time.as_secs_f64() * 1_000.0,
        "queue_wait_ms": outcome.queue_wait.as_secs_f64() * 1_000.0,
        "error": outcome.error,
        "response_sample": outcome.response_sample,
    })
}

/// Write the aggregate summary as JSON.
pub fn write_summary_json(report: &RunReport, path: &Path) -> std::io::Result<()> {
    let snapshot = &report.snapshot;
    let summary = serde_json::json!({
        "label": report.label,
        "started": report.started.to_rfc3339_opts(SecondsFormat::Millis, true),
        "elapsed_seconds": report.elapsed.as_secs_f64(),
        "requests": snapshot.requests,
        "successes": snapshot.successes,
        "failures": snapshot.failures,
        "bytes": snapshot.bytes,
        "requests_per_second": snapshot.requests_per_second(),
        "service_time_ms": {
            "p50": snapshot.p50_service_ms,
            "p90": snapshot.p90_service_ms,
            "p95": snapshot.p95_service_ms,
            "p99": snapshot.p99_service_ms,
            "max": snapshot.max_service_ms,
            "mean": snapshot.mean_service_ms,
        },
        "average_queue_wait_ms": snapshot.average_queue_wait_ms,
        "status_codes": snapshot.status_codes,
        "error_counts": snapshot.error_counts,
    });
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &summary)?;
    Ok(())
}

/// Write all export formats using the configured filename prefix.
pub fn export_all(report: &RunReport, prefix: &str) -> std::io::Result<()> {
    write_csv(report, Path::new(&format!("{}.csv", prefix)))?;
    write_json(report, Path::new(&format!("{}.json", prefix)))?;
    write_summary_json(report, Path::new(&format!("{}_summary.json", prefix)))?;
    info!(
        "reports saved to {prefix}.csv, {prefix}.json and {prefix}_summary.json",
        prefix = prefix
    );
    Ok(())
}

/// Print the final summary tables to stdout.
pub fn print_summary(report: &RunReport) {
    let snapshot = &report.snapshot;
    let requests = snapshot.requests;
    let failure_percent = if requests > 0 {
        snapshot.failures as f64 / requests as f64 * 100.0
    } else {
        0.0
    };

    println!("\n === LOAD TEST RESULTS ===");
    println!(" ------------------------------------------------------------------------------");
    println!(" Target:          {}", report.label);
    println!(" Duration:        {:.1}s", report.elapsed.as_secs_f64());
    println!(
        " Requests:        {} ({:.2} req/s)",
        requests.to_formatted_string(&Locale::en),
        snapshot.requests_per_second()
    );
    println!(
        " Success:         {}",
        snapshot.successes.to_formatted_string(&Locale::en)
    );
    println!(
        " Failed:          {} ({:.2}%)",
        snapshot.failures.to_formatted_string(&Locale::en),
        failure_percent
    );
    println!(
        " Bytes:           {}",
        snapshot.bytes.to_formatted_string(&Locale::en)
    );
    println!(" ------------------------------------------------------------------------------");
    println!(" Service time (ms):");
    println!(
        "   P50 {:>10.2} | P90 {:>10.2} | P95 {:>10.2} | P99 {:>10.2} | Max {:>10.2}",
        snapshot.p50_service_ms,
        snapshot.p90_service_ms,
        snapshot.p95_service_ms,
        snapshot.p99_service_ms,
        snapshot.max_service_ms
    );
    println!(
        "   Mean {:>9.2} | Avg queue wait {:.2} ms",
        snapshot.mean_service_ms, snapshot.average_queue_wait_ms
    );

    print_status_codes(&snapshot.status_codes);

    if !snapshot.error_counts.is_empty() {
        println!(" ------------------------------------------------------------------------------");
        println!(" Failure summary:");
        // Rank errors by frequency, most common first.
        let mut errors: Vec<(&String, &u64)> = snapshot.error_counts.iter().collect();
        errors.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (error, count) in errors {
            println!("   {:>8} x {}", count.to_formatted_string(&Locale::en), error);
        }
        for (status, sample) in &snapshot.response_samples {
            println!(
                "   [{}] sample: {}",
                status,
                util::truncate_string(sample, SAMPLE_DISPLAY_LENGTH)
            );
        }
    }
    println!(" ------------------------------------------------------------------------------");
}

fn print_status_codes(status_codes: &HashMap<u16, u64>) {
    if status_codes.is_empty() {
        return;
    }
    println!(" ------------------------------------------------------------------------------");
    println!(" Status codes:");
    let mut codes: Vec<(&u16, &u64)> = status_codes.iter().collect();
    codes.sort_by_key(|(code, _)| **code);
    for (code, count) in codes {
        let name = if *code == 0 { " (transport failure)" } else { "" };
        println!(
            "   {:>8} x {}{}",
            count.to_formatted_string(&Locale::en),
            code,
            name
        );
    }
}

/// Wrap a field in quotes and escape embedded quotes when needed.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
