use std::sync::atomic::Ordering;
use std::time::Duration;

use httpmock::Method::GET;
use httpmock::MockServer;
use serial_test::serial;

mod common;

use stampede::LoadTest;

// Scenario: a long run canceled two seconds in. Cancellation is a
// one-way latch: emission stops, in-flight requests drain under their
// timeout, control returns promptly, and the snapshot stream still
// carries the final counters.
#[test]
#[serial]
fn cancellation_drains_and_returns() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).delay(Duration::from_millis(10));
    });

    let mut configuration = common::build_configuration(&server.url("/"));
    configuration.rate = Some(200.0);
    configuration.duration = "60s".to_string();
    configuration.timeout = "2s".to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let (report, snapshots, cancel_to_return) = runtime.block_on(async {
        let load_test = LoadTest::new(configuration).expect("configuration must be valid");
        let snapshots = load_test.snapshots();
        let canceled = load_test.cancel_handle();

        let collector = tokio::spawn(async move {
            let mut collected = Vec::new();
            while let Ok(snapshot) = snapshots.recv_async().await {
                collected.push(snapshot);
            }
            collected
        });
        let run = tokio::spawn(load_test.execute());

        tokio::time::sleep(Duration::from_secs(2)).await;
        canceled.store(true, Ordering::SeqCst);
        let canceled_at = tokio::time::Instant::now();

        let report = run
            .await
            .expect("run task must not panic")
            .expect("run must complete");
        let cancel_to_return = canceled_at.elapsed();
        let snapshots = collector.await.expect("collector must finish");
        (report, snapshots, cancel_to_return)
    });

    // Control returned well within twice the per-request timeout.
    assert!(
        cancel_to_return < Duration::from_secs(4),
        "drain took {:?}",
        cancel_to_return
    );

    // Roughly two seconds of a 60 second run happened.
    let requests = report.snapshot.requests;
    assert!(requests > 0);
    assert!(
        requests < 1000,
        "cancellation should have stopped emission early, got {} requests",
        requests
    );
    assert_eq!(mock.hits() as u64, requests);

    // Nothing left in flight, and the accounting closed cleanly.
    assert_eq!(report.snapshot.in_flight, 0);
    assert_eq!(
        report.snapshot.successes + report.snapshot.failures,
        requests
    );
    assert_eq!(report.outcomes.len() as u64, requests);

    // The final snapshot on the channel carries the final counters.
    let last = snapshots.last().expect("at least one snapshot");
    assert_eq!(last.requests, requests);
    assert_eq!(last.in_flight, 0);
}
