use crate::config::BatchConfig;
use crate::core::budget::BatchBudget;
use crate::core::resolver::RecipientResolver;
use crate::core::scheduler::ScheduleEvaluator;
use crate::domain::model::{
    BatchOutcome, DeliveryOutcome, DeliveryRecord, OutgoingMessage, Recipient, Sendout,
    SendoutId, SendoutType,
};
use crate::domain::ports::{AudienceStore, Clock, DispatchError, Mailer, MemoryProbe, SendoutStore};
use crate::domain::schedule::Schedule;
use crate::domain::status::SendStatus;
use crate::utils::error::{Result, SendoutError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Message bodies shared by every recipient of a run.
struct Content {
    html_body: String,
    plaintext_body: String,
}

/// Runs one bounded batch of a sendout per call.
///
/// `process_batch` never returns an error. Whatever goes wrong ends up
/// either as a per-recipient failure, a retry, or the `failed` status with
/// a message an operator can read.
pub struct BatchProcessor<S, M> {
    store: Arc<S>,
    mailer: Arc<M>,
    resolver: RecipientResolver<S>,
    schedule: ScheduleEvaluator<S>,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
    config: BatchConfig,
}

impl<S, M> BatchProcessor<S, M>
where
    S: SendoutStore + AudienceStore,
    M: Mailer,
{
    pub fn new(
        store: Arc<S>,
        mailer: Arc<M>,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemoryProbe>,
        config: BatchConfig,
        pro: bool,
    ) -> Self {
        let resolver = RecipientResolver::new(Arc::clone(&store), pro);
        Self {
            schedule: ScheduleEvaluator::new(resolver.clone(), pro),
            resolver,
            store,
            mailer,
            clock,
            memory,
            config,
        }
    }

    pub fn resolver(&self) -> &RecipientResolver<S> {
        &self.resolver
    }

    pub fn schedule(&self) -> &ScheduleEvaluator<S> {
        &self.schedule
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn process_batch(&self, sendout_id: SendoutId) -> BatchOutcome {
        match self.try_process(sendout_id).await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_invocation_failure(sendout_id, e).await,
        }
    }

    async fn try_process(&self, sendout_id: SendoutId) -> Result<BatchOutcome> {
        let Some(mut sendout) = self.store.get_sendout(sendout_id).await? else {
            tracing::warn!(sendout_id, "sendout not found, nothing to process");
            return Ok(BatchOutcome::Skipped);
        };

        match sendout.send_status {
            SendStatus::Paused => return Ok(BatchOutcome::Paused),
            status if !status.is_sendable() => {
                tracing::debug!(sendout = %sendout.sid, %status, "sendout not sendable, skipping");
                return Ok(BatchOutcome::Skipped);
            }
            _ => {}
        }

        // 1. 排程檢查與搶佔: 只有 queued 需要判斷是否到期
        let now = self.clock.now();
        if sendout.send_status == SendStatus::Queued {
            if !self.schedule.can_send_now(&sendout, now).await? {
                self.store
                    .update_status(sendout.id, SendStatus::Queued, SendStatus::Pending, None)
                    .await?;
                tracing::info!(sendout = %sendout.sid, "⏭️ Sendout not due yet, back to pending");
                return Ok(BatchOutcome::Skipped);
            }
            let claimed = self
                .store
                .update_status(sendout.id, SendStatus::Queued, SendStatus::Sending, None)
                .await?;
            if !claimed {
                tracing::debug!(sendout = %sendout.sid, "run already claimed");
                return Ok(BatchOutcome::Skipped);
            }
            sendout.send_status = SendStatus::Sending;
            tracing::info!(sendout = %sendout.sid, title = %sendout.title, "🚀 Sendout run started");
        }

        // 2. 取得本批次收件人
        let budget = BatchBudget::start(&self.config, self.clock.as_ref(), self.memory.as_ref());
        let recipients = self
            .resolver
            .pending_recipients(&sendout, now, self.config.max_batch_size)
            .await?;

        // 沒有待寄送的收件人，直接完成本輪
        if recipients.is_empty() {
            return self.complete(sendout_id).await;
        }

        let content = self.content(&sendout).await?;
        let run = sendout.current_run();
        let total = recipients.len();
        let (mut sent, mut failed, mut stopped_early) = (0usize, 0usize, false);

        tracing::debug!(sendout = %sendout.sid, total, "📥 Resolved batch");

        // 3. 逐一寄送並記錄結果
        for recipient in recipients {
            let message = compose(&sendout, &content, &recipient);
            let outcome = match self.mailer.send(&message).await {
                Ok(()) => DeliveryOutcome::Sent,
                Err(DispatchError::Rejected(reason)) => {
                    tracing::warn!(sendout = %sendout.sid, to = %message.to, %reason, "recipient rejected");
                    DeliveryOutcome::Failed { reason }
                }
                // 傳輸中斷時其餘收件人也會失敗，整批交給重試機制
                Err(DispatchError::Unavailable(reason)) => {
                    return Err(SendoutError::TransportUnavailable { message: reason });
                }
            };

            let is_sent = outcome == DeliveryOutcome::Sent;
            let recorded = self
                .store
                .record_delivery(DeliveryRecord {
                    sendout_id: sendout.id,
                    contact_id: recipient.contact.id,
                    mailing_list_id: recipient.mailing_list_id,
                    run,
                    delivered_at: self.clock.now(),
                    outcome,
                })
                .await?;
            if recorded && is_sent {
                sent += 1;
            } else if recorded {
                failed += 1;
            }

            // 每寄一封檢查一次記憶體與時間預算
            if let Some(limit) = budget.exceeded() {
                tracing::info!(sendout = %sendout.sid, %limit, "⏸️ Batch budget reached, stopping early");
                stopped_early = true;
                break;
            }
        }

        tracing::info!(
            sendout = %sendout.sid,
            sent,
            failed,
            "📨 Batch dispatched {} of {} recipients",
            sent + failed,
            total
        );

        // 4. 成功跑完一批，重試次數歸零
        self.reset_retries(sendout_id).await?;

        // 5. 沒有提早停止且已無待寄送者，同一次呼叫內完成
        if !stopped_early && !self.resolver.has_pending(&sendout, self.clock.now()).await? {
            return self.complete(sendout_id).await;
        }

        self.observe_status(sendout_id, BatchOutcome::Continued).await
    }

    /// Finishes the current run. The status write is a compare-and-set
    /// against `sending`, so a pause or cancel that arrived mid-batch wins.
    async fn complete(&self, sendout_id: SendoutId) -> Result<BatchOutcome> {
        let Some(mut sendout) = self.store.get_sendout(sendout_id).await? else {
            return Ok(BatchOutcome::Skipped);
        };
        if sendout.send_status != SendStatus::Sending {
            return self.observe_status(sendout_id, BatchOutcome::Skipped).await;
        }

        let now = self.clock.now();
        // 依類型決定下一個狀態
        let target = match sendout.sendout_type {
            SendoutType::Regular | SendoutType::Scheduled => {
                let content = self.content(&sendout).await?;
                sendout.html_body = Some(content.html_body);
                sendout.plaintext_body = Some(content.plaintext_body);
                SendStatus::Sent
            }
            SendoutType::Automated => SendStatus::Pending,
            SendoutType::Recurring => match sendout.schedule.as_mut() {
                Some(Schedule::Recurring(recurring)) => {
                    // 推進到下一次排程，次數用完才算送出
                    let next = recurring.advance();
                    if recurring.is_exhausted() {
                        SendStatus::Sent
                    } else {
                        tracing::info!(sendout = %sendout.sid, next_run = ?next, "🔁 Recurring run finished");
                        SendStatus::Pending
                    }
                }
                _ => SendStatus::Sent,
            },
        };

        sendout.transition_to(target)?;
        sendout.last_sent = Some(now);
        sendout.retry_attempts = 0;
        sendout.send_status_message = None;

        if !self
            .store
            .save_sendout_if(&sendout, SendStatus::Sending)
            .await?
        {
            return self.observe_status(sendout_id, BatchOutcome::Skipped).await;
        }

        tracing::info!(
            sendout = %sendout.sid,
            status = %sendout.send_status,
            recipients = sendout.recipients,
            failed = sendout.failed_recipients,
            "✅ Sendout run completed"
        );

        if target == SendStatus::Sent {
            self.notify(&sendout).await;
        }

        Ok(BatchOutcome::Completed)
    }

    async fn handle_invocation_failure(&self, sendout_id: SendoutId, error: SendoutError) -> BatchOutcome {
        tracing::error!(sendout_id, error = %error, "❌ Batch invocation failed");
        match self.record_failure(sendout_id, &error).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(sendout_id, error = %e, "could not record batch failure");
                BatchOutcome::Retrying
            }
        }
    }

    async fn record_failure(&self, sendout_id: SendoutId, error: &SendoutError) -> Result<BatchOutcome> {
        let Some(mut sendout) = self.store.get_sendout(sendout_id).await? else {
            return Ok(BatchOutcome::Skipped);
        };
        let expected = sendout.send_status;
        match expected {
            SendStatus::Paused => return Ok(BatchOutcome::Paused),
            status if !status.is_sendable() => return Ok(BatchOutcome::Skipped),
            _ => {}
        }

        // 可重試的錯誤在上限內保留狀態，否則標記為 failed
        sendout.retry_attempts = sendout.retry_attempts.saturating_add(1);
        let attempts = sendout.retry_attempts;
        let max = self.config.max_retry_attempts;

        let outcome = if error.is_retryable() && attempts < max {
            sendout.send_status_message = Some(format!("Attempt {} of {} failed: {}", attempts, max, error));
            tracing::warn!(sendout = %sendout.sid, attempts, max, "🔄 Batch will be retried");
            BatchOutcome::Retrying
        } else {
            sendout.transition_to(SendStatus::Failed)?;
            sendout.send_status_message = Some(if error.is_retryable() {
                format!("Sending failed after {} attempts: {}", attempts, error)
            } else {
                format!("Sending failed: {}", error)
            });
            tracing::error!(sendout = %sendout.sid, attempts, "Sendout marked as failed");
            BatchOutcome::Failed
        };

        if self.store.save_sendout_if(&sendout, expected).await? {
            Ok(outcome)
        } else {
            self.observe_status(sendout_id, BatchOutcome::Skipped).await
        }
    }

    async fn reset_retries(&self, sendout_id: SendoutId) -> Result<()> {
        let Some(mut sendout) = self.store.get_sendout(sendout_id).await? else {
            return Ok(());
        };
        if sendout.retry_attempts == 0 {
            return Ok(());
        }
        sendout.retry_attempts = 0;
        sendout.send_status_message = None;
        self.store
            .save_sendout_if(&sendout, SendStatus::Sending)
            .await?;
        Ok(())
    }

    /// Reports an operator pause that happened while we were busy.
    async fn observe_status(&self, sendout_id: SendoutId, otherwise: BatchOutcome) -> Result<BatchOutcome> {
        let status = self
            .store
            .get_sendout(sendout_id)
            .await?
            .map(|s| s.send_status);
        Ok(match status {
            Some(SendStatus::Paused) => {
                tracing::info!(sendout_id, "⏸️ Sendout paused during batch");
                BatchOutcome::Paused
            }
            Some(SendStatus::Cancelled) | None => BatchOutcome::Skipped,
            _ => otherwise,
        })
    }

    async fn content(&self, sendout: &Sendout) -> Result<Content> {
        match sendout.campaign_id {
            Some(campaign_id) => {
                let campaign = self
                    .store
                    .get_campaign(campaign_id)
                    .await?
                    .ok_or_else(|| SendoutError::not_found("campaign", campaign_id))?;
                Ok(Content {
                    html_body: campaign.html_body,
                    plaintext_body: campaign.plaintext_body,
                })
            }
            None => Ok(Content {
                html_body: sendout.html_body.clone().unwrap_or_default(),
                plaintext_body: sendout.plaintext_body.clone().unwrap_or_default(),
            }),
        }
    }

    /// Best effort: a lost notification never affects the sendout.
    async fn notify(&self, sendout: &Sendout) {
        let Some(to) = sendout.notification_email_address.as_deref() else {
            return;
        };
        if to.is_empty() {
            return;
        }

        let summary = format!(
            "Sendout \"{}\" completed: {} sent, {} failed.",
            sendout.title, sendout.recipients, sendout.failed_recipients
        );
        let message = OutgoingMessage {
            sendout_sid: sendout.sid.clone(),
            contact_id: 0,
            mailing_list_id: 0,
            to: to.to_string(),
            from_name: sendout.from_name.clone(),
            from_email: sendout.from_email.clone(),
            subject: format!("Sendout completed: {}", sendout.title),
            html_body: format!("<p>{}</p>", summary),
            plaintext_body: summary,
        };

        if let Err(e) = self.mailer.send(&message).await {
            tracing::warn!(sendout = %sendout.sid, error = %e, "completion notification not delivered");
        }
    }

    /// Fraction of the run that has gone out, in `[0, 1]`.
    pub async fn progress(&self, sendout: &Sendout, now: DateTime<Utc>) -> Result<f64> {
        if sendout.send_status == SendStatus::Sent {
            return Ok(1.0);
        }
        let pending = self.resolver.pending_count(sendout, now).await?;
        Ok(progress_fraction(sendout.recipients, pending))
    }
}

pub fn progress_fraction(recipients: u64, pending: u64) -> f64 {
    if pending == 0 {
        return 1.0;
    }
    (recipients as f64 / (recipients + pending) as f64).min(1.0)
}

fn compose(sendout: &Sendout, content: &Content, recipient: &Recipient) -> OutgoingMessage {
    OutgoingMessage {
        sendout_sid: sendout.sid.clone(),
        contact_id: recipient.contact.id,
        mailing_list_id: recipient.mailing_list_id,
        to: recipient.contact.email.clone(),
        from_name: sendout.from_name.clone(),
        from_email: sendout.from_email.clone(),
        subject: sendout.subject.clone(),
        html_body: content.html_body.clone(),
        plaintext_body: content.plaintext_body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::clock::ManualClock;
    use crate::adapters::mailer::MemoryMailer;
    use crate::adapters::memory_store::MemoryStore;
    use crate::config::units::{MemoryLimit, Seconds};
    use crate::domain::model::{Campaign, Contact, ContactId, Subscription, SubscriptionStatus};
    use crate::domain::schedule::{Frequency, RecurringSchedule};
    use crate::utils::monitor::StaticMemoryProbe;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn contact(id: ContactId) -> Contact {
        let mut contact = Contact {
            id,
            email: format!("c{}@example.com", id),
            ..Default::default()
        };
        contact.subscriptions.insert(
            10,
            Subscription {
                status: SubscriptionStatus::Subscribed,
                subscribed: Some(start()),
                source: None,
            },
        );
        contact
    }

    fn seeded(contacts: u64, sendout: Sendout) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        for id in 1..=contacts {
            store.insert_contact(contact(id)).unwrap();
        }
        store
            .insert_campaign(Campaign {
                id: 1,
                title: "January".to_string(),
                html_body: "<h1>News</h1>".to_string(),
                plaintext_body: "News".to_string(),
            })
            .unwrap();
        store.insert_sendout(sendout).unwrap();
        Arc::new(store)
    }

    fn queued(sendout_type: SendoutType) -> Sendout {
        Sendout {
            id: 1,
            sid: "sjan".to_string(),
            title: "January news".to_string(),
            sendout_type,
            send_status: SendStatus::Queued,
            campaign_id: Some(1),
            subject: "News".to_string(),
            mailing_list_ids: vec![10],
            ..Default::default()
        }
    }

    fn config(max_batch_size: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            memory_limit: MemoryLimit(None),
            time_limit: Seconds(0),
            max_retry_attempts: 3,
            ..Default::default()
        }
    }

    fn processor(
        store: Arc<MemoryStore>,
        mailer: Arc<MemoryMailer>,
        config: BatchConfig,
    ) -> BatchProcessor<MemoryStore, MemoryMailer> {
        BatchProcessor::new(
            store,
            mailer,
            Arc::new(ManualClock::new(start())),
            Arc::new(StaticMemoryProbe(0)),
            config,
            true,
        )
    }

    #[tokio::test]
    async fn test_batches_until_sent() {
        let store = seeded(5, queued(SendoutType::Regular));
        let mailer = Arc::new(MemoryMailer::new());
        let processor = processor(Arc::clone(&store), Arc::clone(&mailer), config(2));

        // 5 contacts in batches of 2
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Continued);
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Continued);
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Completed);

        // Verify the final state and the body snapshot
        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert_eq!(sendout.send_status, SendStatus::Sent);
        assert_eq!(sendout.recipients, 5);
        assert_eq!(sendout.html_body.as_deref(), Some("<h1>News</h1>"));
        assert_eq!(sendout.last_sent, Some(start()));
        assert_eq!(mailer.sent().len(), 5);
        assert_eq!(processor.progress(&sendout, start()).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_rejections_do_not_stop_the_batch() {
        let store = seeded(3, queued(SendoutType::Regular));
        let mailer = Arc::new(MemoryMailer::new());
        mailer.reject("c2@example.com");
        let processor = processor(Arc::clone(&store), Arc::clone(&mailer), config(10));

        assert_eq!(processor.process_batch(1).await, BatchOutcome::Completed);

        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert_eq!(sendout.recipients, 2);
        assert_eq!(sendout.failed_recipients, 1);
        assert_eq!(sendout.send_status, SendStatus::Sent);
    }

    #[tokio::test]
    async fn test_unavailable_transport_retries_then_fails() {
        let store = seeded(2, queued(SendoutType::Regular));
        let mailer = Arc::new(MemoryMailer::new());
        mailer.set_unavailable(true);
        let processor = processor(Arc::clone(&store), Arc::clone(&mailer), config(10));

        // max_retry_attempts = 3: two retries, then failed
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Retrying);
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Retrying);
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Failed);

        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert_eq!(sendout.send_status, SendStatus::Failed);
        assert_eq!(sendout.retry_attempts, 3);
        assert!(sendout
            .send_status_message
            .as_deref()
            .is_some_and(|m| m.contains("after 3 attempts")));
        assert_eq!(sendout.recipients, 0);
    }

    #[tokio::test]
    async fn test_clean_batch_resets_retries() {
        let store = seeded(3, queued(SendoutType::Regular));
        let mailer = Arc::new(MemoryMailer::new());
        mailer.set_unavailable(true);
        let processor = processor(Arc::clone(&store), Arc::clone(&mailer), config(1));

        assert_eq!(processor.process_batch(1).await, BatchOutcome::Retrying);
        mailer.set_unavailable(false);
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Continued);

        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert_eq!(sendout.retry_attempts, 0);
        assert_eq!(sendout.send_status_message, None);
    }

    #[tokio::test]
    async fn test_missing_campaign_fails_without_retry() {
        let mut sendout = queued(SendoutType::Regular);
        sendout.campaign_id = Some(42);
        let store = seeded(1, sendout);
        let processor = processor(Arc::clone(&store), Arc::new(MemoryMailer::new()), config(10));

        assert_eq!(processor.process_batch(1).await, BatchOutcome::Failed);
        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert!(sendout.send_status.is_deletable());
    }

    #[tokio::test]
    async fn test_not_due_goes_back_to_pending() {
        let mut sendout = queued(SendoutType::Scheduled);
        sendout.send_date = Some(start() + chrono::Duration::days(1));
        let store = seeded(1, sendout);
        let processor = processor(Arc::clone(&store), Arc::new(MemoryMailer::new()), config(10));

        assert_eq!(processor.process_batch(1).await, BatchOutcome::Skipped);
        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert_eq!(sendout.send_status, SendStatus::Pending);
    }

    #[tokio::test]
    async fn test_paused_and_draft_are_left_alone() {
        let mut sendout = queued(SendoutType::Regular);
        sendout.send_status = SendStatus::Paused;
        let store = seeded(1, sendout);
        let mailer = Arc::new(MemoryMailer::new());
        let processor = processor(Arc::clone(&store), Arc::clone(&mailer), config(10));

        assert_eq!(processor.process_batch(1).await, BatchOutcome::Paused);
        store
            .update_status(1, SendStatus::Paused, SendStatus::Cancelled, None)
            .await
            .unwrap();
        assert_eq!(processor.process_batch(1).await, BatchOutcome::Skipped);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_run_returns_to_pending() {
        let mut sendout = queued(SendoutType::Recurring);
        let mut schedule = RecurringSchedule::new(Frequency::Daily, start());
        schedule.max_runs = Some(2);
        sendout.schedule = Some(Schedule::Recurring(schedule));
        let store = seeded(2, sendout);
        let processor = processor(Arc::clone(&store), Arc::new(MemoryMailer::new()), config(10));

        assert_eq!(processor.process_batch(1).await, BatchOutcome::Completed);

        let sendout = store.get_sendout(1).await.unwrap().unwrap();
        assert_eq!(sendout.send_status, SendStatus::Pending);
        match sendout.schedule {
            Some(Schedule::Recurring(schedule)) => assert_eq!(schedule.runs, 1),
            other => panic!("unexpected schedule: {:?}", other),
        }
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(progress_fraction(0, 0), 1.0);
        assert_eq!(progress_fraction(5, 0), 1.0);
        assert_eq!(progress_fraction(1, 3), 0.25);
    }
}
