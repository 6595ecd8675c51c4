//! Visage-DB CLI
//!
//! A face-recognition service backed by an HNSW descriptor index.
//!
//! # Usage
//!
//! ```bash
//! # Start the service
//! visage-db serve --data-dir ./data --port 8080 \
//!     --detector-model models/face_detector.onnx \
//!     --embedder-model models/face_embedder.onnx
//!
//! # Rebuild the ANN index from the descriptor store
//! visage-db rebuild-index --data-dir ./data
//!
//! # Inspect a persisted index
//! visage-db stats --data-dir ./data
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use visage_db::api::{create_router, ServiceState};
use visage_db::batch::BatchEngine;
use visage_db::cache::ResultCache;
use visage_db::config::{Profile, RecognitionConfig};
use visage_db::embedder::{DetectorProfile, FaceEmbedder, OnnxEmbedder, StubEmbedder};
use visage_db::error::RecognitionError;
use visage_db::index::FaceIndex;
use visage_db::metrics::Metrics;
use visage_db::recognizer::Recognizer;
use visage_db::store::{DescriptorStore, SqliteStore};

#[derive(Parser)]
#[command(name = "visage-db")]
#[command(about = "A face-recognition service backed by an HNSW descriptor index")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Data directory (SQLite store, index files)
        #[arg(long, env = "VISAGE_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, env = "VISAGE_PORT", default_value = "8080")]
        port: u16,

        /// Face detector ONNX model
        #[arg(long, env = "VISAGE_DETECTOR_MODEL")]
        detector_model: Option<PathBuf>,

        /// Face embedder ONNX model
        #[arg(long, env = "VISAGE_EMBEDDER_MODEL")]
        embedder_model: Option<PathBuf>,

        /// Use the deterministic stub embedder (no models; smoke testing only)
        #[arg(long, default_value = "false")]
        stub_embedder: bool,

        /// Redis URL for the distributed result cache
        #[arg(long, env = "VISAGE_REDIS_URL")]
        redis_url: Option<String>,

        /// Match cut-off in Euclidean distance
        #[arg(long, env = "VISAGE_CONFIDENCE_THRESHOLD")]
        confidence_threshold: Option<f32>,

        /// Threshold profile: high_security, balanced, fast, permissive
        #[arg(long, env = "VISAGE_PROFILE")]
        profile: Option<String>,

        /// Accepted face box minimum side, pixels
        #[arg(long, env = "VISAGE_MIN_FACE_SIZE")]
        min_face_size: Option<u32>,

        /// Accepted face box maximum side, pixels
        #[arg(long, env = "VISAGE_MAX_FACE_SIZE")]
        max_face_size: Option<u32>,

        /// Per-job batch item cap
        #[arg(long, env = "VISAGE_MAX_BATCH_SIZE")]
        max_batch_size: Option<usize>,

        /// In-job parallel workers
        #[arg(long, env = "VISAGE_MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,

        /// Terminal batch job retention, milliseconds
        #[arg(long, env = "VISAGE_JOB_TTL_MS")]
        job_ttl_ms: Option<u64>,

        /// HNSW graph connectivity
        #[arg(long, env = "VISAGE_HNSW_M")]
        hnsw_m: Option<usize>,

        /// HNSW construction beam width
        #[arg(long, env = "VISAGE_HNSW_EF_CONSTRUCTION")]
        hnsw_ef_construction: Option<usize>,

        /// HNSW query beam width
        #[arg(long, env = "VISAGE_HNSW_EF_SEARCH")]
        hnsw_ef_search: Option<usize>,

        /// Index capacity
        #[arg(long, env = "VISAGE_MAX_ELEMENTS")]
        max_elements: Option<u64>,

        /// Result cache TTL, seconds
        #[arg(long, env = "VISAGE_CACHE_TTL")]
        cache_ttl_secs: Option<u64>,

        /// In-process cache key cap
        #[arg(long, env = "VISAGE_CACHE_MAX_SIZE")]
        cache_max_size: Option<usize>,
    },

    /// Rebuild the ANN index from the descriptor store
    RebuildIndex {
        #[arg(long, env = "VISAGE_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
    },

    /// Display statistics about a persisted index
    Stats {
        #[arg(long, env = "VISAGE_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            data_dir,
            host,
            port,
            detector_model,
            embedder_model,
            stub_embedder,
            redis_url,
            confidence_threshold,
            profile,
            min_face_size,
            max_face_size,
            max_batch_size,
            max_concurrency,
            job_ttl_ms,
            hnsw_m,
            hnsw_ef_construction,
            hnsw_ef_search,
            max_elements,
            cache_ttl_secs,
            cache_max_size,
        } => {
            let mut config = RecognitionConfig::from_data_dir(data_dir);
            if let Some(name) = profile {
                match Profile::parse(&name) {
                    Some(p) => config.apply_profile(p),
                    None => anyhow::bail!("unknown profile '{}'", name),
                }
            }
            if let Some(v) = confidence_threshold {
                config.confidence_threshold = v;
            }
            if let Some(v) = min_face_size {
                config.min_face_size = v;
            }
            if let Some(v) = max_face_size {
                config.max_face_size = v;
            }
            if let Some(v) = max_batch_size {
                config.max_batch_size = v;
            }
            if let Some(v) = max_concurrency {
                config.max_concurrency = v;
            }
            if let Some(v) = job_ttl_ms {
                config.job_ttl = Duration::from_millis(v);
            }
            if let Some(v) = hnsw_m {
                config.index.m = v;
            }
            if let Some(v) = hnsw_ef_construction {
                config.index.ef_construction = v;
            }
            if let Some(v) = hnsw_ef_search {
                config.index.ef_search = v;
            }
            if let Some(v) = max_elements {
                config.index.max_elements = v;
            }
            if let Some(v) = cache_ttl_secs {
                config.cache_ttl = Duration::from_secs(v);
            }
            if let Some(v) = cache_max_size {
                config.cache_max_size = v;
            }
            config.redis_url = redis_url;

            let embedder: Arc<dyn FaceEmbedder> = if stub_embedder {
                warn!("serving with the stub embedder; descriptors are synthetic");
                Arc::new(StubEmbedder)
            } else {
                let (Some(detector), Some(embedder_path)) = (detector_model, embedder_model)
                else {
                    anyhow::bail!(
                        "serve requires --detector-model and --embedder-model (or --stub-embedder)"
                    );
                };
                let profile = DetectorProfile {
                    register_floor: config.detection_confidence_register,
                    recognize_floor: config.detection_confidence_recognize,
                    precise_floor: config.detection_confidence_precise,
                };
                Arc::new(
                    OnnxEmbedder::new(&detector, &embedder_path, profile)
                        .map_err(|e| anyhow::anyhow!("loading vision models: {}", e))?,
                )
            };

            serve(config, embedder, host, port).await
        }

        Commands::RebuildIndex { data_dir } => {
            let config = RecognitionConfig::from_data_dir(data_dir);
            let metrics = Arc::new(Metrics::new());
            let store = SqliteStore::open(&config.database_path, metrics)?;

            let mut index = FaceIndex::new(
                config.index,
                config.persist_every,
                config.index_path.clone(),
                config.meta_path.clone(),
            );
            index
                .init()
                .map_err(|e| anyhow::anyhow!("initializing index: {}", e))?;

            let users = store
                .list_active()
                .map_err(|e| anyhow::anyhow!("loading users: {}", e))?;
            info!("rebuilding index from {} active users", users.len());
            index
                .rebuild(&users)
                .map_err(|e| anyhow::anyhow!("rebuild failed: {}", e))?;

            println!("index rebuilt: {} vectors", index.size());
            Ok(())
        }

        Commands::Stats { data_dir } => {
            let config = RecognitionConfig::from_data_dir(data_dir);
            let mut index = FaceIndex::new(
                config.index,
                config.persist_every,
                config.index_path.clone(),
                config.meta_path.clone(),
            );
            index
                .init()
                .map_err(|e| anyhow::anyhow!("initializing index: {}", e))?;

            let stats = index.stats();
            println!("Face index: {:?}", config.index_path);
            println!("  Live vectors: {}", stats.live_vectors);
            println!("  Physical vectors: {}", stats.physical_vectors);
            println!("  Masked vectors: {}", stats.masked_vectors);
            println!("  Dimensions: {}", stats.dim);
            println!("  M: {}", stats.m);
            println!("  ef_construction: {}", stats.ef_construction);
            println!("  ef_search: {}", stats.ef_search);
            match stats.last_rebuild_at {
                Some(at) => println!("  Last rebuild: {}", at.to_rfc3339()),
                None => println!("  Last rebuild: never"),
            }
            Ok(())
        }
    }
}

async fn serve(
    config: RecognitionConfig,
    embedder: Arc<dyn FaceEmbedder>,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());

    // Startup order: store → vision warmup → index (+ bulk load) → gauges.
    let store: Arc<dyn DescriptorStore> =
        Arc::new(SqliteStore::open(&config.database_path, metrics.clone())?);
    info!("descriptor store ready at {:?}", config.database_path);

    warmup_with_timeout(embedder.clone(), config.model_load_timeout).await?;
    info!("vision models warm");

    let mut face_index = FaceIndex::new(
        config.index,
        config.persist_every,
        config.index_path.clone(),
        config.meta_path.clone(),
    );
    face_index
        .init()
        .map_err(|e| anyhow::anyhow!("initializing index: {}", e))?;

    if face_index.size() == 0 {
        let users = store
            .list_active()
            .map_err(|e| anyhow::anyhow!("loading users for index bootstrap: {}", e))?;
        if !users.is_empty() {
            info!("bootstrapping empty index from {} active users", users.len());
            face_index
                .rebuild(&users)
                .map_err(|e| anyhow::anyhow!("index bootstrap failed: {}", e))?;
        }
    }
    let index = Arc::new(RwLock::new(face_index));

    let cache = Arc::new(
        ResultCache::connect(
            config.redis_url.as_deref(),
            config.cache_ttl,
            config.cache_max_size,
        )
        .await,
    );

    let save_interval = config.save_interval;
    let max_batch_size = config.max_batch_size;
    let max_concurrency = config.max_concurrency;
    let job_ttl = config.job_ttl;

    let recognizer = Arc::new(Recognizer::new(
        embedder,
        store,
        index.clone(),
        cache,
        metrics.clone(),
        Arc::new(RwLock::new(config)),
    ));
    recognizer.prime_gauges().await;

    let batch = Arc::new(BatchEngine::new(
        recognizer.clone(),
        metrics.clone(),
        max_batch_size,
        max_concurrency,
        job_ttl,
    ));
    batch.spawn_eviction_loop();
    spawn_periodic_save(index.clone(), save_interval);

    let state = Arc::new(ServiceState {
        recognizer,
        batch,
        metrics,
        started_at: Instant::now(),
    });
    let router = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown: in-flight requests have drained; persist the index last.
    info!("shutting down, persisting index");
    let final_index = index.clone();
    let save_result = tokio::task::spawn_blocking(move || final_index.read().save()).await;
    match save_result {
        Ok(Ok(())) => info!("index persisted"),
        Ok(Err(e)) => error!("final index persist failed: {}", e),
        Err(e) => error!("final index persist panicked: {}", e),
    }

    Ok(())
}

async fn warmup_with_timeout(
    embedder: Arc<dyn FaceEmbedder>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let task = tokio::task::spawn_blocking(move || embedder.warmup());
    match tokio::time::timeout(timeout, task).await {
        Err(_) => Err(anyhow::anyhow!(
            "vision model warmup exceeded {}s",
            timeout.as_secs()
        )),
        Ok(Err(join_err)) => Err(anyhow::anyhow!("warmup task failed: {}", join_err)),
        Ok(Ok(Err(e))) => Err(anyhow::anyhow!("vision model warmup failed: {}", e)),
        Ok(Ok(Ok(()))) => Ok(()),
    }
}

fn spawn_periodic_save(index: Arc<RwLock<FaceIndex>>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would save an index that just loaded.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let index = index.clone();
            let result = tokio::task::spawn_blocking(move || index.read().save()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(RecognitionError::NotInitialized)) => {}
                Ok(Err(e)) => warn!("periodic index save failed: {}", e),
                Err(e) => warn!("periodic index save panicked: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
