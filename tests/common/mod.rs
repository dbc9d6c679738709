//! Shared test infrastructure for integration tests.
//!
//! Spawns a real `jcache-s3store` binary against a scratch data directory
//! and exposes a thin HTTP client for raw S3-style requests.

#![allow(dead_code)]

use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

/// Test server wrapper that spawns a real `jcache-s3store` binary with
/// auth disabled (no JCACHE_S3_ACCESS_KEY_ID/SECRET set).
pub struct TestServer {
    process: Child,
    port: u16,
    _data_dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let data_dir = TempDir::new().expect("failed to create temp dir");

        let process = Command::new(env!("CARGO_BIN_EXE_jcache-s3store"))
            .env("JCACHE_S3_LISTEN_ADDR", format!("127.0.0.1:{}", port))
            .env("JCACHE_S3_VMP", data_dir.path().join("s3"))
            .env("JCACHE_S3_USER_MAP", data_dir.path().join("s3-user-map"))
            .env("JCACHE_S3_MULTIPART", data_dir.path().join("s3-multipart"))
            .env("JCACHE_S3_LOG_LEVEL", "jcache_s3store=warn")
            .spawn()
            .expect("failed to start jcache-s3store");

        let mut server = Self {
            process,
            port,
            _data_dir: data_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(50)).await;
                return;
            }
            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("server exited before becoming ready: {}", status);
            }
            sleep(Duration::from_millis(100)).await;
        }
        let _ = self.process.kill();
        panic!("timed out waiting for server on {}", addr);
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

/// Generate deterministic binary data for payload-size tests.
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}
