#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use stampede::{Configuration, LoadTest, RunReport, Snapshot};

/// Build a configuration against the given url with a short default run.
pub fn build_configuration(url: &str) -> Configuration {
    Configuration {
        url: url.to_string(),
        duration: "2s".to_string(),
        timeout: "5s".to_string(),
        ..Configuration::default()
    }
}

/// Run a load test to completion, collecting every published snapshot.
pub async fn run_load_test(configuration: Configuration) -> (RunReport, Vec<Snapshot>) {
    let load_test = LoadTest::new(configuration).expect("configuration must be valid");
    let snapshots = load_test.snapshots();
    let collector = tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Ok(snapshot) = snapshots.recv_async().await {
            collected.push(snapshot);
        }
        collected
    });

    let report = load_test.execute().await.expect("load test must complete");
    let snapshots = collector.await.expect("snapshot collector must finish");
    (report, snapshots)
}

/// A minimal keep-alive HTTP server for the cases
/// [`httpmock`](https://docs.rs/httpmock/) can't express: capturing
/// request bodies and stalling responses mid-run.
pub struct TestServer {
    pub address: SocketAddr,
    /// Requests served so far.
    pub hits: Arc<AtomicU64>,
    /// Every non-empty request body, in arrival order.
    pub bodies: Arc<Mutex<Vec<String>>>,
    /// While set, responses are withheld.
    pub stalled: Arc<AtomicBool>,
}

#[derive(Clone)]
struct ServerState {
    latency: Duration,
    hits: Arc<AtomicU64>,
    bodies: Arc<Mutex<Vec<String>>>,
    stalled: Arc<AtomicBool>,
}

impl TestServer {
    /// Bind to an ephemeral local port and serve 200s with the given
    /// artificial latency.
    pub async fn start(latency: Duration) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let address = listener.local_addr().expect("test server has no address");

        let state = ServerState {
            latency,
            hits: Arc::new(AtomicU64::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
            stalled: Arc::new(AtomicBool::new(false)),
        };
        let server = TestServer {
            address,
            hits: state.hits.clone(),
            bodies: state.bodies.clone(),
            stalled: state.stalled.clone(),
        };

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        tokio::spawn(serve_connection(socket, state.clone()));
                    }
                    Err(_) => break,
                }
            }
        });

        server
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.address)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().expect("bodies mutex poisoned").clone()
    }

    /// Withhold all responses until [`resume`](Self::resume) is called.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stalled.store(false, Ordering::SeqCst);
    }
}

async fn serve_connection(mut socket: TcpStream, state: ServerState) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    // Serve requests on this connection until the client closes it.
    loop {
        // Read until the end of the request head.
        let header_end = loop {
            if let Some(position) = find_subsequence(&buffer, b"\r\n\r\n") {
                break position + 4;
            }
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let content_length = content_length(&head);
        while buffer.len() < header_end + content_length {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }
        let body =
            String::from_utf8_lossy(&buffer[header_end..header_end + content_length]).to_string();
        buffer.drain(..header_end + content_length);

        if !body.is_empty() {
            state
                .bodies
                .lock()
                .expect("bodies mutex poisoned")
                .push(body);
        }

        if !state.latency.is_zero() {
            tokio::time::sleep(state.latency).await;
        }
        while state.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        state.hits.fetch_add(1, Ordering::SeqCst);
        let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nOK";
        if socket.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn content_length(head: &str) -> usize {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
