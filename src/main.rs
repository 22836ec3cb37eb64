use anyhow::Context;
use campaign_sendout::adapters::{ConfiguredMailer, MemoryStore, OffsetClock, SystemClock};
use campaign_sendout::domain::ports::{Clock, MemoryProbe};
use campaign_sendout::utils::monitor::SystemMonitor;
use campaign_sendout::utils::{logger, validation::Validate};
use campaign_sendout::{
    BatchOutcome, BatchProcessor, CampaignConfig, CliConfig, SendoutEngine, SendoutManager,
    SubscriptionService,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();

    let config = match &cli.config {
        Some(path) => CampaignConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => CampaignConfig::default(),
    };

    // 初始化日誌
    let level = config.logging.level.as_deref();
    if config.logging.json {
        logger::init_json_logger(level);
    } else {
        logger::init_cli_logger(cli.verbose, level);
    }

    tracing::info!("Starting campaign-sendout CLI");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    // 驗證配置
    if let Err(e) = cli.validate().and_then(|_| config.validate()) {
        tracing::error!("❌ Configuration validation failed: {}", e);
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }

    if cli.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }
    if config.test_mode {
        tracing::info!("🧪 Test mode: messages are written to {}", config.transport.output_path);
    }

    let store = Arc::new(
        MemoryStore::load(&cli.data)
            .await
            .with_context(|| format!("failed to load data snapshot from {}", cli.data))?,
    );
    let clock: Arc<dyn Clock> = match cli.now {
        // 從指定時間起算，批次時間預算照常計時
        Some(now) => Arc::new(OffsetClock::starting_at(now)),
        None => Arc::new(SystemClock),
    };
    let monitor = Arc::new(SystemMonitor::new(cli.monitor));
    let memory: Arc<dyn MemoryProbe> = monitor.clone();
    let mailer = Arc::new(ConfiguredMailer::from_config(&config)?);

    let processor = BatchProcessor::new(
        Arc::clone(&store),
        mailer,
        Arc::clone(&clock),
        memory,
        config.batch.clone(),
        config.pro,
    );
    let manager = SendoutManager::new(Arc::clone(&store), Arc::clone(&clock), &config);
    let subscriptions = SubscriptionService::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.pending_contacts.clone(),
    );

    let mut engine = SendoutEngine::new(Arc::clone(&store), processor, manager, subscriptions)
        .with_max_batches(cli.max_batches)
        .with_monitoring(Arc::clone(&monitor));
    if cli.no_delay {
        engine = engine.with_batch_delay(Duration::ZERO);
    }

    let runs = match &cli.sendout {
        Some(key) => vec![engine.run_one(key).await?],
        None => engine.run_due().await?,
    };

    for run in &runs {
        let sendout = engine.manager().get(run.sendout_id).await?;
        let progress = engine.manager().progress_label(&sendout).await?;
        println!(
            "{} {} [{}] {:?} after {} batch(es), {} sent, {} failed {}",
            sendout.sid,
            sendout.title,
            sendout.send_status,
            run.outcome,
            run.batches,
            sendout.recipients,
            sendout.failed_recipients,
            progress
        );
    }

    if cli.write_back {
        store
            .save(&cli.data)
            .await
            .with_context(|| format!("failed to write data snapshot to {}", cli.data))?;
        tracing::info!("📁 Snapshot saved to: {}", cli.data);
    }

    monitor.log_final_stats();

    if runs.iter().any(|run| run.outcome == BatchOutcome::Failed) {
        std::process::exit(2);
    }

    Ok(())
}
