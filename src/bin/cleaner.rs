//! Standalone JCache cleaner CLI.
//!
//! `cleaner <directory> <high-watermark-bytes> <low-watermark-bytes> <interval-seconds>`
//!
//! Runs the watermark-driven eviction loop against a single directory tree
//! until killed. Exits `1` on argument error; never returns on success.

use jcache_s3store::jcache::{Cleaner, CleanerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!(
        "usage: cleaner <directory> <high-watermark-bytes> <low-watermark-bytes> <interval-seconds>"
    );
    std::process::exit(1);
}

fn parse_u64(arg: &str) -> u64 {
    arg.parse().unwrap_or_else(|_| usage())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        usage();
    }

    let path = PathBuf::from(&args[1]);
    if !path.is_dir() {
        eprintln!("error: {:?} is not a directory", path);
        std::process::exit(1);
    }

    let high_watermark = parse_u64(&args[2]);
    let low_watermark = parse_u64(&args[3]);
    let interval_secs = parse_u64(&args[4]);

    if low_watermark > high_watermark {
        eprintln!("error: low-watermark must not exceed high-watermark");
        std::process::exit(1);
    }
    if interval_secs == 0 {
        eprintln!("error: interval-seconds must be greater than zero");
        std::process::exit(1);
    }

    let cleaner = Cleaner::new(CleanerConfig {
        path,
        high_watermark,
        low_watermark,
        scan: true,
        interval: Duration::from_secs(interval_secs),
    });

    tracing::info!(
        "cleaner starting: high={} low={} interval={}s",
        high_watermark,
        low_watermark,
        interval_secs
    );

    cleaner.spawn().await.expect("cleaner task panicked");
}
