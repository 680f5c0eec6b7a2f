use std::collections::HashSet;
use std::time::Duration;

use httpmock::Method::GET;
use httpmock::MockServer;
use serial_test::serial;

mod common;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

// Scenario: 10 users with 100 ms think time against a 10 ms server.
// Throughput converges on users / (latency + think time) and concurrency
// never exceeds the user count.
#[test]
#[serial]
fn think_time_paces_the_users() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).delay(Duration::from_millis(10));
    });

    let mut configuration = common::build_configuration(&server.url("/"));
    configuration.users = Some(10);
    configuration.think_time = "100ms".to_string();
    configuration.duration = "3s".to_string();

    let (report, snapshots) = runtime().block_on(common::run_load_test(configuration));

    // 10 / (0.010 + 0.100) is about 91 req/s; allow for startup and
    // scheduling overhead.
    let requests = report.snapshot.requests;
    assert!(
        (250..=300).contains(&requests),
        "expected 250..=300 requests, got {}",
        requests
    );
    assert_eq!(mock.hits() as u64, requests);
    assert_eq!(report.snapshot.successes, requests);

    // A closed loop can never have more requests in flight than users.
    for snapshot in &snapshots {
        assert!(
            snapshot.in_flight <= 10,
            "in-flight {} exceeded the user count",
            snapshot.in_flight
        );
    }
    assert_eq!(report.snapshot.in_flight, 0);

    // Queue wait is intrinsically zero in a closed loop.
    assert!(report.snapshot.average_queue_wait_ms < 1.0);
}

// Saturation: with no think time, steady-state throughput approaches
// users / service-latency.
#[test]
#[serial]
fn saturated_users_converge_on_server_latency() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).delay(Duration::from_millis(20));
    });

    let mut configuration = common::build_configuration(&server.url("/"));
    configuration.users = Some(5);
    configuration.duration = "2s".to_string();

    let (report, snapshots) = runtime().block_on(common::run_load_test(configuration));

    // 5 / 0.020 is 250 req/s, so about 500 requests in 2 s; per-request
    // overhead pushes the real number below the ideal.
    let requests = report.snapshot.requests;
    assert!(
        (300..=550).contains(&requests),
        "expected 300..=550 requests at saturation, got {}",
        requests
    );
    assert_eq!(mock.hits() as u64, requests);

    for snapshot in &snapshots {
        assert!(snapshot.in_flight <= 5);
    }
}

// Each closed-loop worker keeps one stable virtual-user identity for the
// whole run, while request ids stay unique.
#[test]
#[serial]
fn workers_keep_stable_identities() {
    let runtime = runtime();
    let (report, bodies) = runtime.block_on(async {
        let server = common::TestServer::start(Duration::ZERO).await;

        let mut configuration = common::build_configuration(&server.url());
        configuration.method = "POST".to_string();
        configuration.body = "{{userID}}|{{requestID}}".to_string();
        configuration.users = Some(2);
        configuration.duration = "1s".to_string();

        let (report, _snapshots) = common::run_load_test(configuration).await;
        (report, server.bodies())
    });

    assert_eq!(bodies.len() as u64, report.snapshot.requests);
    let mut users = HashSet::new();
    let mut request_ids = HashSet::new();
    for body in &bodies {
        let (user, request) = body.split_once('|').expect("body must carry both ids");
        users.insert(user.to_string());
        request_ids.insert(request.to_string());
    }
    // Two workers, two identities, stable across every request each made.
    assert_eq!(users.len(), 2);
    // Request ids are fresh per request.
    assert_eq!(request_ids.len(), bodies.len());
}

// Workers are spawned staggered across the ramp-up window, so early
// snapshots see fewer in-flight users than late ones.
#[test]
#[serial]
fn ramp_up_staggers_worker_launch() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).delay(Duration::from_millis(50));
    });

    let mut configuration = common::build_configuration(&server.url("/"));
    configuration.users = Some(8);
    configuration.ramp_up = "2s".to_string();
    configuration.duration = "1s".to_string();

    let (report, snapshots) = runtime().block_on(common::run_load_test(configuration));

    assert!(mock.hits() > 0);
    assert_eq!(report.snapshot.in_flight, 0);

    // Midway through the ramp only part of the pool can be running.
    let early_max = snapshots
        .iter()
        .filter(|s| s.elapsed < Duration::from_millis(900))
        .map(|s| s.in_flight)
        .max()
        .unwrap_or(0);
    assert!(
        early_max < 8,
        "saw {} users in flight before the ramp finished",
        early_max
    );
}
