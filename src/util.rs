use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

/// Parse a string representing a time span into a [`Duration`].
///
/// A bare integer is interpreted as seconds. Otherwise valid formats combine
/// hours, minutes, seconds and milliseconds in that order: `20s`, `3m`, `2h`,
/// `1h30m`, `3h30m10s`, `250ms`, `1s500ms`, etc.
///
/// Returns [`None`] when the string matches none of the recognized forms.
pub fn parse_duration(time_str: &str) -> Option<Duration> {
    // If an integer is passed in, assume it's seconds.
    if let Ok(seconds) = time_str.parse::<u64>() {
        trace!("{} is integer: {} seconds", time_str, seconds);
        return Some(Duration::from_secs(seconds));
    }

    // Otherwise use a regex to extract hours, minutes, seconds and
    // milliseconds from the string.
    let re = Regex::new(
        r"^((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?((?P<millis>\d+?)ms)?$",
    )
    .expect("failed to compile duration regex");
    let time_matches = re.captures(time_str)?;

    let hours: u64 = match time_matches.name("hours") {
        Some(_) => time_matches["hours"].parse().ok()?,
        None => 0,
    };
    let minutes: u64 = match time_matches.name("minutes") {
        Some(_) => time_matches["minutes"].parse().ok()?,
        None => 0,
    };
    let seconds: u64 = match time_matches.name("seconds") {
        Some(_) => time_matches["seconds"].parse().ok()?,
        None => 0,
    };
    let millis: u64 = match time_matches.name("millis") {
        Some(_) => time_matches["millis"].parse().ok()?,
        None => 0,
    };

    let total = Duration::from_secs(hours * 60 * 60 + minutes * 60 + seconds)
        + Duration::from_millis(millis);
    // The all-optional regex technically matches an empty string; reject
    // anything that contributed no components unless it was a literal zero.
    if total.is_zero() && time_str != "0" && time_str != "0s" && time_str != "0ms" {
        return None;
    }
    trace!(
        "{} hours {} minutes {} seconds {} ms: {:?}",
        hours,
        minutes,
        seconds,
        millis,
        total
    );
    Some(total)
}

/// Truncate strings when they're too long to display.
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if str_to_truncate.len() <= max_length {
        return str_to_truncate.to_string();
    }
    // Walk backward to the nearest character boundary.
    let mut boundary = max_length.saturating_sub(2);
    while boundary > 0 && !str_to_truncate.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let mut truncated = str_to_truncate[..boundary].to_string();
    truncated += "..";
    truncated
}

/// Latch the shared cancellation flag when ctrl-c is caught.
pub fn setup_ctrlc_handler(canceled: &Arc<AtomicBool>) {
    let caught_ctrlc = canceled.clone();
    match ctrlc::set_handler(move || {
        // We've caught a ctrl-c, determine if it's the first time or an additional time.
        if caught_ctrlc.load(Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            caught_ctrlc.store(true, Ordering::SeqCst);
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            info!("failed to set ctrl-c handler: {}", e);
        }
    }
}
