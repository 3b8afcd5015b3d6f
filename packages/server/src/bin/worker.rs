//! Job worker host: runs the scheduler and every job handler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use extraction::{
    Classifier, Deduplicator, DirectLmBroker, EmbeddingPipeline, EntityExtractor,
    ExtractionPipeline, LmBroker, SchemaOrchestrator, TemperatureSchedule, VectorRepo,
};
use server_core::broker::{RedisLmBroker, StreamConfig};
use server_core::clients::{EmbeddingHttpClient, FetcherHttpClient, LmHttpClient};
use server_core::config::Config;
use server_core::jobs::{JobScheduler, JobType, PostgresJobStore, SchedulerConfig};
use server_core::kernel::ServerKernel;
use server_core::rate_limit::{DomainRateLimiter, RateLimitConfig};
use server_core::repos::{
    PgBoilerplateRepo, PgEntityRepo, PgExtractionRepo, PgProjectRepo, PgReportRepo,
    PgSourceRepo, PgVectorRepo,
};
use server_core::workers::{
    CrawlHandler, ExtractHandler, MaintenanceHandler, ReportHandler, ScrapeHandler,
};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);
    info!("starting job worker host");

    let kernel = ServerKernel::connect(config.clone()).await?;
    let pipeline_config = config.pipeline_config();

    // Repositories
    let sources = Arc::new(PgSourceRepo::new(kernel.db.clone()));
    let extractions = Arc::new(PgExtractionRepo::new(kernel.db.clone()));
    let entities = Arc::new(PgEntityRepo::new(kernel.db.clone()));
    let fingerprints = Arc::new(PgBoilerplateRepo::new(kernel.db.clone()));
    let projects = Arc::new(PgProjectRepo::new(kernel.db.clone()));
    let reports = Arc::new(PgReportRepo::new(kernel.db.clone()));
    let vectors = Arc::new(PgVectorRepo::new(
        kernel.db.clone(),
        config.embedding_dimension,
    ));
    vectors.init_collection(config.embedding_dimension).await?;

    // External services
    let embedder = Arc::new(EmbeddingHttpClient::new(
        &config.embedding_endpoint_url,
        &config.lm_api_key,
        &config.embedding_model,
        config.embedding_dimension,
    )?);
    let fetcher = Arc::new(FetcherHttpClient::new(
        &config.fetcher_url,
        config.fetch_timeout(),
    )?);

    // Broker mode or direct completion
    let broker: Arc<dyn LmBroker> = if config.lm_queue_enabled {
        Arc::new(RedisLmBroker::new(
            kernel.redis.clone(),
            StreamConfig {
                max_queue_depth: config.lm_queue_max_depth,
                slow_queue_depth: config.lm_queue_slow_depth,
                ..StreamConfig::default()
            },
        ))
    } else {
        let endpoint = Arc::new(LmHttpClient::new(
            &config.lm_endpoint_url,
            &config.lm_api_key,
            &config.lm_model,
            Duration::from_secs(config.lm_request_timeout_secs),
        )?);
        Arc::new(
            DirectLmBroker::new(endpoint)
                .with_max_retries(config.lm_max_retries)
                .with_schedule(TemperatureSchedule {
                    base: config.lm_base_temperature,
                    increment: config.lm_temperature_increment,
                }),
        )
    };

    // Pipeline assembly
    let classifier = Arc::new(Classifier::new(
        pipeline_config.classifier.clone(),
        embedder.clone(),
    )?);
    let orchestrator = Arc::new(SchemaOrchestrator::new(
        broker.clone(),
        classifier,
        pipeline_config.chunker,
        pipeline_config.orchestrator,
    ));
    let deduplicator = Arc::new(Deduplicator::new(
        embedder.clone(),
        vectors.clone(),
        pipeline_config.dedup,
    ));
    let embedding = Arc::new(EmbeddingPipeline::new(
        embedder.clone(),
        vectors.clone(),
        extractions.clone(),
    ));
    let entity_extractor = Arc::new(
        EntityExtractor::new(broker.clone(), entities.clone(), extractions.clone())
            .with_request_timeout(Duration::from_secs(config.lm_request_timeout_secs)),
    );
    let pipeline = Arc::new(ExtractionPipeline::new(
        sources.clone(),
        extractions.clone(),
        fingerprints.clone(),
        orchestrator,
        deduplicator,
        embedding.clone(),
        entity_extractor.clone(),
        pipeline_config,
    ));

    let rate_limiter = Arc::new(DomainRateLimiter::new(
        kernel.redis.clone(),
        RateLimitConfig {
            delay_min: Duration::from_millis(config.scrape_delay_min_ms),
            delay_max: Duration::from_millis(config.scrape_delay_max_ms),
            max_concurrent_per_domain: config.scrape_max_concurrent_per_domain,
            daily_limit: config.scrape_daily_limit,
        },
    ));

    // Scheduler
    let store = Arc::new(PostgresJobStore::new(kernel.db.clone()));
    let scheduler_config = SchedulerConfig {
        poll_interval: config.scheduler_poll_interval(),
        stale_thresholds: [
            (JobType::Scrape, Duration::from_secs(config.stale_scrape_secs)),
            (JobType::Crawl, Duration::from_secs(config.stale_crawl_secs)),
            (
                JobType::Extract,
                Duration::from_secs(config.stale_extract_secs),
            ),
            (JobType::Report, Duration::from_secs(config.stale_report_secs)),
            (JobType::Dedup, Duration::from_secs(config.stale_report_secs)),
        ]
        .into(),
        concurrency: [
            (JobType::Scrape, 1),
            (JobType::Crawl, config.crawl_max_concurrent),
            (JobType::Extract, 1),
            (JobType::Report, 1),
            (JobType::Dedup, 1),
        ]
        .into(),
    };

    let scheduler = JobScheduler::new(store.clone(), scheduler_config)
        .register(Arc::new(ScrapeHandler::new(
            fetcher.clone(),
            sources.clone(),
            rate_limiter,
            config.fetch_timeout_secs,
        )))
        .register(Arc::new(CrawlHandler::new(
            fetcher,
            sources.clone(),
            store.clone(),
            broker.clone(),
            fingerprints.clone(),
            config.scheduler_poll_interval(),
        )
        .with_boilerplate(config.boilerplate_enabled.then(|| {
            extraction::BoilerplateParams {
                threshold_pct: config.boilerplate_threshold_pct,
                min_pages: config.boilerplate_min_pages,
                min_block_chars: config.boilerplate_min_block_chars,
            }
        }))))
        .register(Arc::new(ExtractHandler::new(projects.clone(), pipeline)))
        .register(Arc::new(ReportHandler::new(
            extractions.clone(),
            Some(reports),
        )))
        .register(Arc::new(MaintenanceHandler::new(
            projects,
            sources,
            extractions,
            embedding,
            entity_extractor,
        )));

    let shutdown = scheduler.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    scheduler.run().await;
    info!("job worker host stopped");
    Ok(())
}
