//! DCP monitor daemon

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use dcp_monitor::config::AppConfig;
use dcp_monitor::errors::DcpMonError;
use dcp_monitor::groups::DcpGroupList;
use dcp_monitor::ingest::IngestServer;
use dcp_monitor::pdt::ReferenceData;
use dcp_monitor::pipeline::Pipeline;
use dcp_monitor::queue::{run_drain_worker, WriteQueue};
use dcp_monitor::report::ReportEngine;
use dcp_monitor::scrub::RetentionScrubber;
use dcp_monitor::server::ReportServer;
use dcp_monitor::storage::{Db, GroupStore, XmitStore};

#[tokio::main]
async fn main() -> Result<(), DcpMonError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;

    let db = Arc::new(Db::open(&config.database.path)?);
    let store: Arc<dyn XmitStore> = db.clone();
    let group_store: Arc<dyn GroupStore> = db;

    let groups = Arc::new(DcpGroupList::new(
        &config.reference.group_files,
        &config.reference.store_groups,
        Some(group_store),
    ));
    let refdata = Arc::new(ReferenceData::load(
        config.reference.pdt_path.clone(),
        config.reference.channel_map_path.clone(),
        config.reference.receiver_list_path.clone(),
    ));
    let scrubber = Arc::new(RetentionScrubber::new(store.clone(), config.retention.days));

    let queue = Arc::new(WriteQueue::new(
        config.queue.capacity,
        config.queue.settle_time,
    ));
    let drain = tokio::spawn(run_drain_worker(queue.clone(), store.clone()));

    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        store.clone(),
        groups.clone(),
        refdata.clone(),
        scrubber.clone(),
        config.pipeline.clone(),
    ));
    let engine = Arc::new(ReportEngine::new(
        store,
        groups,
        refdata,
        scrubber,
        config.thresholds.clone(),
    ));

    let ingest_listener = TcpListener::bind(&config.server.ingest_bind).await?;
    info!("Ingest listener on {}", config.server.ingest_bind);
    let ingest = Arc::new(IngestServer::new(pipeline.clone()));
    let ingest_task = tokio::spawn(ingest.run(ingest_listener));

    let report_listener = TcpListener::bind(&config.server.bind).await?;
    info!("Report server on {}", config.server.bind);
    let report = Arc::new(ReportServer::new(engine, pipeline, queue.clone()));
    let report_task = tokio::spawn(report.run(report_listener));

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received shutdown signal"),
        _ = ingest_task => error!("Ingest listener exited"),
        _ = report_task => error!("Report server exited"),
    }

    // Flush whatever is still resident before exit.
    queue.begin_shutdown();
    if let Err(e) = drain.await {
        error!("Drain worker did not shut down cleanly: {e}");
    }
    info!("Shutdown complete");

    Ok(())
}
