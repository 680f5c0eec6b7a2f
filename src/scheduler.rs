//! Decides when each request is emitted.
//!
//! Two disjoint algorithms, selected by [`Mode`](crate::config::Mode):
//!
//! **Open loop** maintains a monotonic next-scheduled-instant cursor and
//! emits a concurrent request task whenever the cursor falls due, at an
//! instantaneous rate that ramps linearly up, holds steady, and ramps
//! linearly down. The cursor, not the actual emission time, is the
//! latency origin handed to the executor, which preserves
//! Coordinated-Omission accounting: queue wait measures the scheduler's
//! own slippage, total latency what a real caller would have observed.
//!
//! **Closed loop** launches a fixed pool of workers, each retaining one
//! stable virtual-user identity and issuing its next request only after
//! the previous one completes (plus optional think time).
//!
//! Both modes treat cancellation as a hard stop of further emission but
//! never of in-flight requests, and drain everything before returning.
//! The scheduler itself never fails; individual request failures are
//! recorded by the executor, not propagated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::LoadPlan;
use crate::executor::{RequestExecutor, UserIdentity};

/// How long to sleep while the instantaneous rate is effectively zero.
const ZERO_RATE_POLL: Duration = Duration::from_millis(100);
/// Rates below this are treated as zero.
const MINIMUM_RATE: f64 = 0.1;
/// When the cursor falls further behind than this, it is reset to now,
/// bounding the catch-up burst after a stall or clock jump.
const DEBT_RESET_THRESHOLD: Duration = Duration::from_secs(1);
/// Never sleep longer than this in one slice, so sleeping workers notice
/// cancellation promptly.
const MAXIMUM_SLEEP: Duration = Duration::from_millis(500);

/// The time-driven states of a run. Cancellation moves any running state
/// straight to draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunPhase {
    Idle,
    RampUp,
    Steady,
    RampDown,
    Draining,
    Done,
}

/// Which phase the run is in after `elapsed` time.
pub(crate) fn phase_at(plan: &LoadPlan, elapsed: Duration) -> RunPhase {
    if elapsed < plan.ramp_up {
        RunPhase::RampUp
    } else if elapsed < plan.ramp_up + plan.steady {
        RunPhase::Steady
    } else if elapsed < plan.total_duration() {
        RunPhase::RampDown
    } else {
        RunPhase::Draining
    }
}

fn set_phase(current: &mut RunPhase, next: RunPhase) {
    if *current != next {
        info!("entering {:?} phase", next);
        *current = next;
    }
}

/// The instantaneous target rate after `elapsed` time: a piecewise-linear
/// ramp up to `target`, a steady hold, and a linear ramp back down.
pub(crate) fn current_rate(plan: &LoadPlan, target: f64, elapsed: Duration) -> f64 {
    let elapsed = elapsed.as_secs_f64();
    let ramp_up = plan.ramp_up.as_secs_f64();
    let steady_end = ramp_up + plan.steady.as_secs_f64();
    let total = steady_end + plan.ramp_down.as_secs_f64();

    if elapsed < ramp_up {
        target * (elapsed / ramp_up)
    } else if elapsed < steady_end {
        target
    } else if elapsed < total {
        let ramp_down = plan.ramp_down.as_secs_f64();
        if ramp_down == 0.0 {
            0.0
        } else {
            target * ((total - elapsed) / ramp_down)
        }
    } else {
        0.0
    }
}

/// Reset the emission cursor to now when it has fallen more than
/// [`DEBT_RESET_THRESHOLD`] behind. After the guard fires the cursor is
/// never more than the threshold in the past.
pub(crate) fn reset_debt(cursor: Instant, now: Instant) -> Instant {
    if now.saturating_duration_since(cursor) > DEBT_RESET_THRESHOLD {
        warn!(
            "scheduler fell {:?} behind, resetting emission schedule",
            now.saturating_duration_since(cursor)
        );
        now
    } else {
        cursor
    }
}

/// Run the constant-arrival-rate schedule until the configured duration
/// elapses or the run is canceled, then drain in-flight requests.
pub(crate) async fn open_loop(
    plan: &LoadPlan,
    target: f64,
    executor: &Arc<RequestExecutor>,
    canceled: &Arc<AtomicBool>,
) {
    let total = plan.total_duration();
    let started = Instant::now();
    let mut cursor = started;
    let mut requests: JoinSet<()> = JoinSet::new();
    let mut phase = RunPhase::Idle;

    info!(
        "open loop: target {} req/s for {:?} ({:?} ramp up, {:?} ramp down)",
        target, total, plan.ramp_up, plan.ramp_down
    );

    loop {
        if canceled.load(Ordering::SeqCst) {
            break;
        }
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        set_phase(&mut phase, phase_at(plan, elapsed));

        let rate = current_rate(plan, target, elapsed);
        if rate < MINIMUM_RATE {
            // Don't accumulate schedule debt while the rate is zero.
            tokio::time::sleep(ZERO_RATE_POLL).await;
            cursor = Instant::now();
            reap(&mut requests);
            continue;
        }

        let period = Duration::from_secs_f64(1.0 / rate);
        cursor = reset_debt(cursor, Instant::now());

        // Emit every request the schedule owes us, each stamped with the
        // instant it was supposed to begin.
        while cursor <= Instant::now() {
            if canceled.load(Ordering::SeqCst) {
                break;
            }
            let scheduled = cursor;
            let executor = executor.clone();
            requests.spawn(async move {
                // Open loop: a fresh virtual user per request.
                let user = UserIdentity::fresh();
                executor.execute(scheduled, &user).await;
            });
            cursor += period;
        }

        reap(&mut requests);
        tokio::time::sleep_until(cursor).await;
    }

    set_phase(&mut phase, RunPhase::Draining);
    while requests.join_next().await.is_some() {}
    set_phase(&mut phase, RunPhase::Done);
}

/// Run the fixed-concurrency schedule: `users` workers, each with a stable
/// identity, looping request + think time until the configured duration
/// elapses or the run is canceled.
pub(crate) async fn closed_loop(
    plan: &LoadPlan,
    users: usize,
    executor: &Arc<RequestExecutor>,
    canceled: &Arc<AtomicBool>,
) {
    let total = plan.total_duration();
    let started = Instant::now();
    let mut workers: JoinSet<()> = JoinSet::new();

    // Approximate a linear user ramp by staggering worker launch across
    // the ramp-up window.
    let stagger = if plan.ramp_up > Duration::ZERO && users > 1 {
        plan.ramp_up / users as u32
    } else {
        Duration::ZERO
    };

    info!(
        "closed loop: {} users for {:?} (think time {:?})",
        users, total, plan.think_time
    );

    for number in 0..users {
        if canceled.load(Ordering::SeqCst) {
            break;
        }
        let executor = executor.clone();
        let canceled = canceled.clone();
        let think_time = plan.think_time;
        workers.spawn(async move {
            let user = UserIdentity::fresh();
            debug!("launching user {} as {}...", number + 1, user.id);
            loop {
                if canceled.load(Ordering::SeqCst) || started.elapsed() >= total {
                    break;
                }
                // Closed loop: the worker is the queue, so the scheduled
                // instant is now and queue wait is intrinsically zero.
                executor.execute(Instant::now(), &user).await;

                if !think_time.is_zero()
                    && !sleep_through(think_time, &canceled, started, total).await
                {
                    break;
                }
            }
            debug!("exiting user {}...", number + 1);
        });

        if !stagger.is_zero() && number + 1 < users {
            tokio::time::sleep(stagger).await;
        }
    }

    // Ramp-down adds no semantics here; workers simply exit at the total
    // duration, and joining them is the drain.
    while workers.join_next().await.is_some() {}
    info!("all users exited");
}

/// Sleep for `think_time` in short slices, waking early on cancellation or
/// end of run. Returns false when the worker should exit.
async fn sleep_through(
    think_time: Duration,
    canceled: &AtomicBool,
    started: Instant,
    total: Duration,
) -> bool {
    let mut remaining = think_time;
    while !remaining.is_zero() {
        if canceled.load(Ordering::SeqCst) || started.elapsed() >= total {
            return false;
        }
        let slice = remaining.min(MAXIMUM_SLEEP);
        tokio::time::sleep(slice).await;
        remaining -= slice;
    }
    true
}

/// Discard completed request tasks without blocking.
fn reap(requests: &mut JoinSet<()>) {
    while requests.try_join_next().is_some() {}
}
