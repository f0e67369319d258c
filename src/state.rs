use crate::config::Config;
use crate::error::{Error, Result};
use crate::services::agent_instance::{AgentInstance, AgentTool, KnowledgeRetrieverTool};
use crate::services::channels::{ChannelRouter, ChannelSender, WsHub};
use crate::services::dispatcher::{AgentFactory, DispatchSink, Dispatcher};
use crate::services::embeddings::{Embedder, OpenAiEmbedder};
use crate::services::file_store::FileStore;
use crate::services::handler_registry::HandlerRegistry;
use crate::services::indexer::IndexingWorker;
use crate::services::knowledge::KnowledgeService;
use crate::services::memory::DbMemory;
use crate::services::retrieval::RetrievalService;
use crate::services::runner::OpenAiRunner;
use crate::services::sparse::TfidfSparseEmbedder;
use crate::services::vector_index::VectorIndex;
use crate::workers::spawn_agent_cache_cleanup;
use crate::DbPool;
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

/// Process-wide wiring: clients are constructed once at startup and handed to
/// components here, never through ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: DbPool,
    pub vector_index: Arc<VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub sparse: Arc<TfidfSparseEmbedder>,
    pub file_store: Arc<FileStore>,
    pub retrieval: Arc<RetrievalService>,
    pub indexer: Arc<IndexingWorker>,
    pub knowledge: Arc<KnowledgeService>,
    pub ws_hub: Arc<WsHub>,
    pub registry: Arc<HandlerRegistry>,
}

impl AppState {
    /// Builds every component from configuration. Fails fast on anything the
    /// runtime cannot operate without.
    pub async fn initialize(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let pool = DbPool::connect(config.database.connection_string().expose_secret())
            .await
            .map_err(|e| Error::Internal(format!("failed to connect to database: {}", e)))?;

        let vector_index = Arc::new(VectorIndex::connect(&config.qdrant)?);
        vector_index
            .ensure_collection(config.qdrant.create_collections)
            .await?;

        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(&config.embeddings));

        let sparse = Arc::new(TfidfSparseEmbedder::new(
            Some(PathBuf::from(&config.ingest.sparse_vocab_path)),
            TfidfSparseEmbedder::DEFAULT_MAX_FEATURES,
            TfidfSparseEmbedder::DEFAULT_TOP_K,
        ));
        sparse.load().await;

        let file_store = Arc::new(FileStore::new(
            &config.ingest.upload_dir,
            config.ingest.max_upload_bytes,
        ));
        file_store.init().await?;

        let retrieval = Arc::new(RetrievalService::new(
            pool.clone(),
            vector_index.clone(),
            embedder.clone(),
        ));

        let indexer = Arc::new(IndexingWorker::new(
            pool.clone(),
            vector_index.clone(),
            embedder.clone(),
            Some(sparse.clone()),
            config.ingest.clone(),
        ));

        let knowledge = Arc::new(KnowledgeService::new(
            pool.clone(),
            vector_index.clone(),
            file_store.clone(),
            indexer.clone(),
        ));

        let ws_hub = Arc::new(WsHub::new());
        let router: Arc<dyn ChannelSender> = Arc::new(ChannelRouter::new(ws_hub.clone()));

        let runner = Arc::new(OpenAiRunner::new(
            &config.llm.api_base,
            config.llm.api_key.clone(),
            &config.llm.model,
        ));
        let memory = Arc::new(DbMemory::new(pool.clone()));
        let catalog: Vec<Arc<dyn AgentTool>> = vec![Arc::new(KnowledgeRetrieverTool::new())];

        let registry = {
            let pool = pool.clone();
            let retrieval = retrieval.clone();
            let dispatch_config = config.dispatch.clone();
            let sender = router.clone();

            Arc::new(HandlerRegistry::new(
                pool.clone(),
                config.queues.clone(),
                move |scope, metrics| {
                    let factory: AgentFactory = {
                        let scope = scope.clone();
                        let pool = pool.clone();
                        let runner = runner.clone();
                        let memory = memory.clone();
                        let retrieval = retrieval.clone();
                        let catalog = catalog.clone();
                        Box::new(move |customer_id, _project_id| {
                            Arc::new(AgentInstance::new(
                                scope.business_id,
                                scope.agent_id,
                                customer_id.to_string(),
                                pool.clone(),
                                runner.clone(),
                                memory.clone(),
                                retrieval.clone(),
                                catalog.clone(),
                            ))
                        })
                    };
                    let dispatcher = Arc::new(Dispatcher::new(
                        scope.clone(),
                        pool.clone(),
                        dispatch_config.clone(),
                        sender.clone(),
                        metrics,
                        factory,
                    ));
                    spawn_agent_cache_cleanup(Arc::downgrade(&dispatcher));
                    Arc::new(DispatchSink::new(dispatcher))
                },
            ))
        };

        Ok(Self {
            config,
            pool,
            vector_index,
            embedder,
            sparse,
            file_store,
            retrieval,
            indexer,
            knowledge,
            ws_hub,
            registry,
        })
    }
}
