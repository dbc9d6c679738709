//! jcache-s3store — S3-compatible object store proxy backed by a POSIX
//! filesystem, fronted by an axum HTTP server with SigV4 auth and
//! Prometheus metrics.

use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use clap::Parser;
use jcache_s3store::api::auth::{sigv4_auth_middleware, AuthConfig};
use jcache_s3store::api::handlers::{
    bucket_get_handler, create_bucket, delete_bucket, delete_object, delete_objects, get_object,
    get_stats, head_bucket, head_object, head_root, health_check, list_buckets, post_object,
    put_object_or_copy, AppState,
};
use jcache_s3store::config::Config;
use jcache_s3store::metrics::Metrics;
use jcache_s3store::object_store::{ObjectStore, ObjectStoreConfig};
use jcache_s3store::types::Owner;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Version string including build timestamp for --version output.
fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("JCACHE_S3STORE_BUILD_TIME"),
        )
    })
}

/// jcache-s3store — S3-compatible object store proxy.
#[derive(Parser, Debug)]
#[command(name = "jcache-s3store")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Access key / secret for SigV4 auth, read from the environment. Auth is
/// disabled (open access) when either variable is unset.
fn auth_config_from_env() -> Option<Arc<AuthConfig>> {
    let access_key_id = std::env::var("JCACHE_S3_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("JCACHE_S3_SECRET_ACCESS_KEY").ok()?;
    Some(Arc::new(AuthConfig {
        access_key_id,
        secret_access_key,
    }))
}

/// The owner attributed to every bucket this proxy creates. There is no
/// credential-to-owner mapping file yet (see `DESIGN.md` Open Question 5),
/// so every bucket is owned by the process's own uid/gid.
fn default_owner() -> Owner {
    // SAFETY: geteuid/getegid are infallible syscalls with no preconditions.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    Owner {
        id: "default".to_string(),
        display_name: "default".to_string(),
        uid,
        gid,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("JCACHE_S3_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("jcache_s3store=trace,tower_http=trace")
            } else {
                EnvFilter::new("jcache_s3store=info,tower_http=info")
            }
        });

    tracing_subscriber::registry()
        .with(initial_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    info!(
        "Starting jcache-s3store v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("JCACHE_S3STORE_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!("  Bucket root (vmp): {:?}", config.s3.vmp);
    info!("  User map: {:?}", config.s3.user_map);
    info!("  Multipart scratch root: {:?}", config.s3.multipart);
    info!("  Region: {}", config.s3.region);

    let auth_config = auth_config_from_env();
    if auth_config.is_some() {
        info!("  Authentication: SigV4 ENABLED");
    } else {
        warn!(
            "  Authentication: DISABLED (open access) — set JCACHE_S3_ACCESS_KEY_ID and \
             JCACHE_S3_SECRET_ACCESS_KEY to enable"
        );
    }

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    let store = ObjectStore::new(ObjectStoreConfig {
        vmp: config.s3.vmp.clone(),
        user_map: config.s3.user_map.clone(),
        mtpu: config.s3.multipart.clone(),
    })?;

    let state = Arc::new(AppState {
        store: Arc::new(store),
        auth: auth_config.clone(),
        metrics: Some(metrics.clone()),
        owner: default_owner(),
    });

    // S3 API paths:
    //   GET / - list buckets
    //   PUT /{bucket} - create bucket
    //   DELETE /{bucket} - delete bucket
    //   HEAD /{bucket} - head bucket
    //   GET /{bucket}?list-type=2 - list objects
    //   POST /{bucket}?delete - delete multiple objects
    //   PUT /{bucket}/{key...} - upload object (or copy with x-amz-copy-source)
    //   GET /{bucket}/{key...} - download object
    //   HEAD /{bucket}/{key...} - get object metadata
    //   DELETE /{bucket}/{key...} - delete object
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route(
            "/metrics",
            get(jcache_s3store::metrics::metrics_handler),
        )
        .route("/", get(list_buckets).head(head_root))
        .route(
            "/:bucket/*key",
            get(get_object)
                .put(put_object_or_copy)
                .delete(delete_object)
                .head(head_object)
                .post(post_object),
        )
        .route(
            "/:bucket",
            get(bucket_get_handler)
                .put(create_bucket)
                .delete(delete_bucket)
                .head(head_bucket)
                .post(delete_objects),
        )
        .route(
            "/:bucket/",
            get(bucket_get_handler)
                .put(create_bucket)
                .delete(delete_bucket)
                .head(head_bucket)
                .post(delete_objects),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            jcache_s3store::metrics::http_metrics_middleware,
        ))
        .layer(middleware::from_fn(sigv4_auth_middleware))
        .layer(axum::Extension(auth_config))
        .layer(axum::Extension(Some(metrics) as Option<Arc<Metrics>>))
        .layer(DefaultBodyLimit::max(
            jcache_s3store::object_store::MAX_PUT_SIZE as usize,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("jcache-s3store listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
