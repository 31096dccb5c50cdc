// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{body::Bytes, http::HeaderMap, http::StatusCode, routing::post, Router};
use hec_relay::config::{Config, HecConfig, ListenerConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub const RAW_PATH: &str = "/services/collector/raw";

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub status: u16,
    pub at: Instant,
}

/// Collector stub answering with a scripted status sequence, then 200.
pub struct StubHec {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl StubHec {
    pub async fn start(script: &[u16]) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(script.iter().copied().collect::<VecDeque<_>>()));

        let app = {
            let requests = Arc::clone(&requests);
            Router::new().route(
                RAW_PATH,
                post(move |headers: HeaderMap, body: Bytes| {
                    let requests = Arc::clone(&requests);
                    let script = Arc::clone(&script);
                    async move {
                        let status = script.lock().unwrap().pop_front().unwrap_or(200);
                        let headers = headers
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                            .collect();
                        requests.lock().unwrap().push(CapturedRequest {
                            headers,
                            body: body.to_vec(),
                            status,
                            at: Instant::now(),
                        });
                        (StatusCode::from_u16(status).unwrap(), "{}")
                    }
                }),
            )
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind stub collector");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("Stub collector failed");
        });

        StubHec { addr, requests }
    }

    pub fn url(&self) -> reqwest::Url {
        reqwest::Url::parse(&format!("http://{}{RAW_PATH}", self.addr)).unwrap()
    }

    pub fn hec_config(&self) -> HecConfig {
        let mut hec = HecConfig::new(self.url(), "11111111-2222-3333-4444-555555555555");
        hec.source_type = Some("zpa:user-activity".to_string());
        hec.timeout = Duration::from_secs(5);
        hec
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Waits until at least `count` requests arrived, or gives up after five seconds.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<CapturedRequest> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let requests = self.requests();
            if requests.len() >= count || Instant::now() > deadline {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn listener(name: &str, dir: &Path) -> ListenerConfig {
    ListenerConfig::new(name, loopback(), dir, "zpa")
}

pub fn single_listener_config(listener: ListenerConfig) -> Config {
    Config {
        log_level: "debug".to_string(),
        health: None,
        listeners: vec![listener],
    }
}

pub fn today_file(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!(
        "{prefix}-{}.ndjson",
        chrono::Utc::now().format("%Y-%m-%d")
    ))
}

/// Connects, writes `payload`, half-closes and waits for the relay to close its side.
pub async fn send(addr: SocketAddr, payload: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    wait_for_close(&mut stream).await;
}

pub async fn wait_for_close(stream: &mut TcpStream) {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 64];
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
