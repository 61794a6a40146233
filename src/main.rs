use anyhow::{Context, Result};
use ragdesk::{
    api::{self, AppState},
    chat::ConversationalRag,
    config::{self, Config},
    dispatcher::{JobDispatcher, UploadPolicy},
    embedding::{EmbeddingClient, build_embedding_client},
    knowledge, logging,
    llm::OllamaChatClient,
    metrics::PipelineMetrics,
    namespace::NamespaceManager,
    pipeline::{
        CommandStage, IndexingStage, JobQueue, PassThroughStage, PipelineOrchestrator,
        PipelineStages, Stage, chunking::ChunkingSettings, staging::sweep_orphans, worker,
    },
    qdrant::QdrantService,
    retrieval::HybridRetriever,
    session::{SessionStore, spawn_idle_sweeper},
    status::InMemoryStatusStore,
    store::VectorStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const BASE_MARKDOWN: &str = "base.md";
const ENRICHED_MARKDOWN: &str = "enriched.md";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let config = config::init_config().context("Failed to load configuration")?;

    let store: Arc<dyn VectorStore> = Arc::new(
        QdrantService::new(&config.qdrant_url, config.qdrant_api_key.clone())
            .context("Failed to create Qdrant client")?,
    );
    let embedder =
        build_embedding_client(config).context("Failed to create embedding client")?;

    let swept = sweep_orphans(&config.staging_root);
    if swept > 0 {
        tracing::info!(swept, root = %config.staging_root.display(), "Removed orphaned staging areas");
    }

    if let Err(error) = knowledge::seed_global_knowledge(
        store.as_ref(),
        embedder.as_ref(),
        &config.global_collection_name,
        &config.knowledge_path,
    )
    .await
    {
        tracing::error!(error = %error, "Global knowledge ingestion failed; continuing without it");
    }

    let metrics = Arc::new(PipelineMetrics::new());
    let status = Arc::new(InMemoryStatusStore::new());
    let namespace = NamespaceManager::new(store.clone()).with_status(status.clone());
    let orchestrator = PipelineOrchestrator::new(
        status.clone(),
        namespace.clone(),
        build_stages(config, store.clone(), embedder.clone(), metrics.clone())?,
        metrics.clone(),
    );
    let (queue, receiver) = JobQueue::new(config.pipeline_queue_capacity);
    worker::spawn_workers(config.pipeline_workers, receiver, orchestrator);

    let idle_timeout = Duration::from_secs(config.session_idle_timeout_secs);
    let sessions = Arc::new(SessionStore::new(idle_timeout));
    spawn_idle_sweeper(
        sessions.clone(),
        namespace.clone(),
        (idle_timeout / 4).max(Duration::from_secs(5)),
    );

    let retriever = HybridRetriever::new(
        store.clone(),
        embedder,
        config.global_collection_name.clone(),
        config.retrieval_top_k,
    );
    let llm = OllamaChatClient::from_config(config).context("Failed to create chat client")?;

    let state = Arc::new(AppState {
        dispatcher: JobDispatcher::new(
            UploadPolicy::from_config(config),
            status,
            namespace.clone(),
            queue,
            metrics.clone(),
        ),
        chat: ConversationalRag::new(retriever, Arc::new(llm)),
        sessions,
        namespace,
        store,
        metrics,
        session_issuer_secret: config.session_issuer_secret.clone(),
    });
    let app = api::create_router(state);

    let (listener, port) = bind_listener()
        .await
        .context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn build_stages(
    config: &Config,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    metrics: Arc<PipelineMetrics>,
) -> Result<PipelineStages> {
    let conversion = CommandStage::new("conversion", &config.conversion_command, BASE_MARKDOWN)
        .context("CONVERSION_COMMAND is empty")?;
    let enrichment: Arc<dyn Stage> = match config
        .enrichment_command
        .as_deref()
        .and_then(|template| CommandStage::new("enrichment", template, ENRICHED_MARKDOWN))
    {
        Some(stage) => Arc::new(stage),
        None => {
            tracing::info!("No enrichment command configured; passing converted text through");
            Arc::new(PassThroughStage::new("enrichment", ENRICHED_MARKDOWN))
        }
    };
    let settings = ChunkingSettings::resolve(
        config.text_splitter_chunk_size,
        config.text_splitter_chunk_overlap,
        config.embedding_provider,
        config.embedding_model.clone(),
    );
    tracing::debug!(chunk_size = settings.chunk_size, overlap = settings.overlap, "Chunking settings");

    Ok(PipelineStages {
        conversion: Arc::new(conversion),
        enrichment,
        indexing: Arc::new(IndexingStage::new(store, embedder, settings, metrics)),
    })
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 8000..=8099;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 8000-8099",
    ))
}
