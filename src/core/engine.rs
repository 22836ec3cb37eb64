use crate::core::manager::SendoutManager;
use crate::core::pending::SubscriptionService;
use crate::core::processor::BatchProcessor;
use crate::domain::model::{BatchOutcome, SendoutId};
use crate::domain::ports::{AudienceStore, Mailer, PendingContactStore, SendoutStore};
use crate::domain::status::SendStatus;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What one sendout did during an engine pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendoutRun {
    pub sendout_id: SendoutId,
    pub batches: usize,
    pub outcome: BatchOutcome,
}

/// Plays the job queue: invokes batches back to back with the configured
/// delay until a sendout stops asking to be requeued.
pub struct SendoutEngine<S, M> {
    store: Arc<S>,
    processor: BatchProcessor<S, M>,
    manager: SendoutManager<S>,
    subscriptions: SubscriptionService<S>,
    batch_delay: Duration,
    max_batches: Option<usize>,
    monitor: Option<Arc<SystemMonitor>>,
}

impl<S, M> SendoutEngine<S, M>
where
    S: SendoutStore + AudienceStore + PendingContactStore,
    M: Mailer,
{
    pub fn new(
        store: Arc<S>,
        processor: BatchProcessor<S, M>,
        manager: SendoutManager<S>,
        subscriptions: SubscriptionService<S>,
    ) -> Self {
        let batch_delay = processor.config().batch_job_delay.as_duration();
        Self {
            store,
            processor,
            manager,
            subscriptions,
            batch_delay,
            max_batches: None,
            monitor: None,
        }
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn with_monitoring(mut self, monitor: Arc<SystemMonitor>) -> Self {
        if monitor.is_enabled() {
            self.monitor = Some(monitor);
        }
        self
    }

    pub fn manager(&self) -> &SendoutManager<S> {
        &self.manager
    }

    /// One scheduler pass: purge stale pending contacts, queue what is due,
    /// then drive every queued or in-flight sendout.
    pub async fn run_due(&self) -> Result<Vec<SendoutRun>> {
        tracing::info!("Starting sendout pass...");
        self.subscriptions.purge_expired().await?;

        let mut ids = self.manager.queue_due().await?;
        // Runs interrupted mid-flight are picked up again.
        for status in [SendStatus::Queued, SendStatus::Sending] {
            for sendout in self.store.find_sendouts(status).await? {
                if !ids.contains(&sendout.id) {
                    ids.push(sendout.id);
                }
            }
        }

        if ids.is_empty() {
            tracing::info!("No sendouts due");
        }

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            runs.push(self.run_sendout(id).await);
        }
        Ok(runs)
    }

    /// Runs a single sendout given its id or sid, queueing it first when it
    /// is pending and due.
    pub async fn run_one(&self, key: &str) -> Result<SendoutRun> {
        let sendout = self.manager.find(key).await?;
        if sendout.send_status == SendStatus::Pending && !self.manager.queue(&sendout).await? {
            tracing::info!(sendout = %sendout.sid, "⏭️ Sendout is not due");
        }
        Ok(self.run_sendout(sendout.id).await)
    }

    pub async fn run_sendout(&self, sendout_id: SendoutId) -> SendoutRun {
        if let Some(monitor) = &self.monitor {
            monitor.log_stats("Sendout started.");
        }

        let max_retries = self.processor.config().max_retry_attempts as usize;
        let mut batches = 0;
        let mut retries_in_a_row = 0;

        let outcome = loop {
            let outcome = self.processor.process_batch(sendout_id).await;
            batches += 1;
            tracing::debug!(sendout_id, batch = batches, ?outcome, "batch finished");

            if let Some(monitor) = &self.monitor {
                monitor.log_stats(&format!("Batch {} finished.", batches));
            }

            if !outcome.should_requeue() {
                break outcome;
            }
            if outcome == BatchOutcome::Retrying {
                retries_in_a_row += 1;
                // The processor normally fails the sendout first; this only
                // trips when the failure itself could not be recorded.
                if retries_in_a_row > max_retries {
                    tracing::error!(sendout_id, "giving up after {} retries", retries_in_a_row);
                    break outcome;
                }
            } else {
                retries_in_a_row = 0;
            }
            if self.max_batches.is_some_and(|max| batches >= max) {
                tracing::info!(sendout_id, batches, "Batch limit reached, leaving sendout for the next pass");
                break outcome;
            }
            if !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        };

        tracing::info!(sendout_id, batches, ?outcome, "Sendout pass finished");
        SendoutRun {
            sendout_id,
            batches,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::clock::ManualClock;
    use crate::adapters::mailer::MemoryMailer;
    use crate::adapters::memory_store::MemoryStore;
    use crate::config::units::{MemoryLimit, Seconds};
    use crate::config::{BatchConfig, CampaignConfig, PendingContactsConfig};
    use crate::domain::model::{
        Campaign, Contact, MailingList, Sendout, SendoutType, Subscription, SubscriptionStatus,
    };
    use crate::domain::ports::Clock;
    use crate::utils::monitor::StaticMemoryProbe;
    use chrono::{TimeZone, Utc};

    fn engine(store: Arc<MemoryStore>, mailer: Arc<MemoryMailer>) -> SendoutEngine<MemoryStore, MemoryMailer> {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let config = CampaignConfig {
            batch: BatchConfig {
                max_batch_size: 2,
                memory_limit: MemoryLimit(None),
                time_limit: Seconds(0),
                ..Default::default()
            },
            ..Default::default()
        };
        let processor = BatchProcessor::new(
            Arc::clone(&store),
            mailer,
            Arc::clone(&clock),
            Arc::new(StaticMemoryProbe(0)),
            config.batch.clone(),
            config.pro,
        );
        let manager = SendoutManager::new(Arc::clone(&store), Arc::clone(&clock), &config);
        let subscriptions =
            SubscriptionService::new(Arc::clone(&store), clock, PendingContactsConfig::default());
        SendoutEngine::new(store, processor, manager, subscriptions).with_batch_delay(Duration::ZERO)
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store
            .insert_mailing_list(MailingList {
                id: 10,
                title: "All".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .insert_campaign(Campaign {
                id: 1,
                ..Default::default()
            })
            .unwrap();
        for id in 1..=5 {
            let mut contact = Contact {
                id,
                email: format!("c{}@example.com", id),
                ..Default::default()
            };
            contact.subscriptions.insert(
                10,
                Subscription {
                    status: SubscriptionStatus::Subscribed,
                    subscribed: None,
                    source: None,
                },
            );
            store.insert_contact(contact).unwrap();
        }
        store
            .insert_sendout(Sendout {
                id: 1,
                sid: "sengine".to_string(),
                send_status: SendStatus::Pending,
                campaign_id: Some(1),
                mailing_list_ids: vec![10],
                ..Sendout::new("Engine", SendoutType::Regular)
            })
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_run_due_drives_sendout_to_completion() {
        let store = seeded();
        let mailer = Arc::new(MemoryMailer::new());
        let engine = engine(Arc::clone(&store), Arc::clone(&mailer));

        let runs = engine.run_due().await.unwrap();
        assert_eq!(
            runs,
            vec![SendoutRun {
                sendout_id: 1,
                batches: 3,
                outcome: BatchOutcome::Completed,
            }]
        );
        assert_eq!(mailer.sent().len(), 5);
    }

    #[tokio::test]
    async fn test_max_batches_leaves_work_for_next_pass() {
        let store = seeded();
        let mailer = Arc::new(MemoryMailer::new());
        let engine = engine(Arc::clone(&store), Arc::clone(&mailer)).with_max_batches(Some(1));

        let run = engine.run_one("sengine").await.unwrap();
        assert_eq!(run.outcome, BatchOutcome::Continued);
        assert_eq!(mailer.sent().len(), 2);

        // The in-flight sendout is picked up again by the next pass.
        let runs = engine.run_due().await.unwrap();
        assert_eq!(runs[0].outcome, BatchOutcome::Continued);
        assert_eq!(mailer.sent().len(), 4);
    }
}
