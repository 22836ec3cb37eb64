use crate::config::toml_config::{CampaignConfig, SendersConfig};
use crate::core::processor::progress_fraction;
use crate::core::resolver::RecipientResolver;
use crate::core::scheduler::ScheduleEvaluator;
use crate::domain::model::{sendout_types, Sendout, SendoutId, SendoutType};
use crate::domain::ports::{AudienceStore, Clock, SendoutStore};
use crate::domain::schedule::Schedule;
use crate::domain::status::SendStatus;
use crate::utils::error::{Result, SendoutError};
use crate::utils::validation;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

const MAX_SID_LENGTH: usize = 32;
const MAX_TEXT_LENGTH: usize = 255;

/// Operator-facing lifecycle of sendouts.
pub struct SendoutManager<S> {
    store: Arc<S>,
    resolver: RecipientResolver<S>,
    schedule: ScheduleEvaluator<S>,
    clock: Arc<dyn Clock>,
    senders: SendersConfig,
    pro: bool,
}

impl<S: SendoutStore + AudienceStore> SendoutManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &CampaignConfig) -> Self {
        let resolver = RecipientResolver::new(Arc::clone(&store), config.pro);
        Self {
            schedule: ScheduleEvaluator::new(resolver.clone(), config.pro),
            resolver,
            store,
            clock,
            senders: config.senders.clone(),
            pro: config.pro,
        }
    }

    pub fn sendout_types(&self) -> Vec<SendoutType> {
        sendout_types(self.pro)
    }

    /// A new, unsaved draft with a fresh sid.
    pub fn create(&self, title: &str, sendout_type: SendoutType) -> Result<Sendout> {
        if !self.sendout_types().contains(&sendout_type) {
            return Err(SendoutError::validation(
                "sendout_type",
                format!("{} sendouts require the pro edition", sendout_type),
            ));
        }
        let mut sendout = Sendout::new(title, sendout_type);
        sendout.sid = generate_sid();
        Ok(sendout)
    }

    pub async fn get(&self, id: SendoutId) -> Result<Sendout> {
        self.store
            .get_sendout(id)
            .await?
            .ok_or_else(|| SendoutError::not_found("sendout", id))
    }

    /// Accepts a numeric id or a sid.
    pub async fn find(&self, key: &str) -> Result<Sendout> {
        if let Ok(id) = key.parse::<SendoutId>() {
            if let Some(sendout) = self.store.get_sendout(id).await? {
                return Ok(sendout);
            }
        }
        self.store
            .find_sendout_by_sid(key)
            .await?
            .ok_or_else(|| SendoutError::not_found("sendout", key))
    }

    /// Validates and persists an editable sendout, assigning `id` and `sid`
    /// to new ones.
    pub async fn save(&self, sendout: &mut Sendout) -> Result<()> {
        if sendout.id == 0 {
            if sendout.send_status != SendStatus::Draft {
                return Err(SendoutError::validation("send_status", "new sendouts start as draft"));
            }
        } else {
            let stored = self.get(sendout.id).await?;
            if !stored.send_status.is_editable() {
                return Err(SendoutError::NotActionable {
                    status: stored.send_status.to_string(),
                    action: "edited",
                });
            }
            carry_run_state(&stored, sendout);
        }
        if sendout.sid.is_empty() {
            sendout.sid = generate_sid();
        }

        self.validate(sendout)?;
        self.check_references(sendout).await?;
        self.store.save_sendout(sendout).await?;

        tracing::info!(sendout = %sendout.sid, id = sendout.id, "💾 Sendout saved");
        Ok(())
    }

    pub fn validate(&self, sendout: &Sendout) -> Result<()> {
        validation::validate_required_string("title", &sendout.title)?;
        validation::validate_max_length("title", &sendout.title, MAX_TEXT_LENGTH)?;
        validation::validate_max_length("sid", &sendout.sid, MAX_SID_LENGTH)?;

        for (field, value) in [
            ("from_name", &sendout.from_name),
            ("from_email", &sendout.from_email),
            ("subject", &sendout.subject),
        ] {
            validation::validate_required_string(field, value)?;
            validation::validate_max_length(field, value, MAX_TEXT_LENGTH)?;
        }
        validation::validate_email("from_email", &sendout.from_email)?;

        if let Some(address) = &sendout.notification_email_address {
            validation::validate_max_length("notification_email_address", address, MAX_TEXT_LENGTH)?;
            validation::validate_email("notification_email_address", address)?;
        }

        validation::validate_present("campaign_id", &sendout.campaign_id)?;
        if sendout.mailing_list_ids.is_empty() {
            return Err(SendoutError::validation(
                "mailing_list_ids",
                "at least one mailing list is required",
            ));
        }

        if !self.senders.allows(&sendout.from_name, &sendout.from_email) {
            return Err(SendoutError::validation(
                "from_email",
                format!("{} is not an allowed sender", sendout.from_name_email()),
            ));
        }

        if !self.sendout_types().contains(&sendout.sendout_type) {
            return Err(SendoutError::validation(
                "sendout_type",
                format!("{} sendouts require the pro edition", sendout.sendout_type),
            ));
        }

        match (&sendout.sendout_type, &sendout.schedule) {
            (SendoutType::Regular, None) => Ok(()),
            (SendoutType::Scheduled, None) => {
                validation::validate_present("send_date", &sendout.send_date)?;
                Ok(())
            }
            (SendoutType::Automated, Some(Schedule::Automated(_))) => Ok(()),
            (SendoutType::Recurring, Some(Schedule::Recurring(recurring))) => {
                if recurring.interval == 0 {
                    return Err(SendoutError::validation("schedule.interval", "must be at least 1"));
                }
                if recurring.end_date.is_some_and(|end| end < recurring.start_date) {
                    return Err(SendoutError::validation(
                        "schedule.end_date",
                        "must not be before the start date",
                    ));
                }
                Ok(())
            }
            (sendout_type, _) => Err(SendoutError::validation(
                "schedule",
                format!("schedule does not match a {} sendout", sendout_type),
            )),
        }
    }

    /// List, segment and campaign ids must point at existing entities.
    async fn check_references(&self, sendout: &Sendout) -> Result<()> {
        let wanted: BTreeSet<_> = sendout
            .mailing_list_ids
            .iter()
            .chain(&sendout.excluded_mailing_list_ids)
            .copied()
            .collect();
        let ids: Vec<_> = wanted.iter().copied().collect();
        let found: BTreeSet<_> = self
            .store
            .mailing_lists(&ids)
            .await?
            .into_iter()
            .map(|l| l.id)
            .collect();
        if let Some(missing) = wanted.difference(&found).next() {
            return Err(SendoutError::not_found("mailing list", missing));
        }

        if self.pro && !sendout.segment_ids.is_empty() {
            let wanted: BTreeSet<_> = sendout.segment_ids.iter().copied().collect();
            let ids: Vec<_> = wanted.iter().copied().collect();
            let found: BTreeSet<_> = self
                .store
                .segments(&ids)
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect();
            if let Some(missing) = wanted.difference(&found).next() {
                return Err(SendoutError::not_found("segment", missing));
            }
        }

        if let Some(campaign_id) = sendout.campaign_id {
            if self.store.get_campaign(campaign_id).await?.is_none() {
                return Err(SendoutError::not_found("campaign", campaign_id));
            }
        }

        Ok(())
    }

    /// `draft -> pending`, after a final validation.
    pub async fn launch(&self, id: SendoutId) -> Result<Sendout> {
        let sendout = self.get(id).await?;
        self.validate(&sendout)?;
        self.check_references(&sendout).await?;
        self.change_status(sendout, "launched", SendStatus::Pending).await
    }

    /// Moves every pending sendout that may fire now to `queued` and
    /// returns their ids.
    pub async fn queue_due(&self) -> Result<Vec<SendoutId>> {
        let mut queued = Vec::new();
        for sendout in self.store.find_sendouts(SendStatus::Pending).await? {
            if self.queue(&sendout).await? {
                queued.push(sendout.id);
            }
        }
        Ok(queued)
    }

    /// `pending -> queued` when the schedule allows it now.
    pub async fn queue(&self, sendout: &Sendout) -> Result<bool> {
        if sendout.send_status != SendStatus::Pending {
            return Ok(false);
        }
        if !self.schedule.can_send_now(sendout, self.clock.now()).await? {
            return Ok(false);
        }
        let queued = self
            .store
            .update_status(sendout.id, SendStatus::Pending, SendStatus::Queued, None)
            .await?;
        if queued {
            tracing::info!(sendout = %sendout.sid, "📬 Sendout queued");
        }
        Ok(queued)
    }

    pub async fn pause(&self, id: SendoutId) -> Result<Sendout> {
        let sendout = self.get(id).await?;
        if !sendout.send_status.is_pausable() {
            return Err(not_actionable(&sendout, "paused"));
        }
        self.change_status(sendout, "paused", SendStatus::Paused).await
    }

    /// Back to `pending` with a clean retry counter.
    pub async fn resume(&self, id: SendoutId) -> Result<Sendout> {
        let mut sendout = self.get(id).await?;
        if !sendout.send_status.is_resumable() {
            return Err(not_actionable(&sendout, "resumed"));
        }
        let expected = sendout.send_status;
        sendout.transition_to(SendStatus::Pending)?;
        sendout.retry_attempts = 0;
        sendout.send_status_message = None;

        if !self.store.save_sendout_if(&sendout, expected).await? {
            return Err(self.conflict(id, "resumed").await);
        }
        tracing::info!(sendout = %sendout.sid, "▶️ Sendout resumed");
        Ok(sendout)
    }

    pub async fn cancel(&self, id: SendoutId) -> Result<Sendout> {
        let sendout = self.get(id).await?;
        if !sendout.send_status.is_cancellable() {
            return Err(not_actionable(&sendout, "cancelled"));
        }
        self.change_status(sendout, "cancelled", SendStatus::Cancelled).await
    }

    pub async fn delete(&self, id: SendoutId) -> Result<()> {
        let sendout = self.get(id).await?;
        if !sendout.send_status.is_deletable() {
            return Err(not_actionable(&sendout, "deleted"));
        }
        self.store.delete_sendout(id).await?;
        tracing::info!(sendout = %sendout.sid, "🗑️ Sendout deleted");
        Ok(())
    }

    pub async fn pending_recipient_count(&self, sendout: &Sendout) -> Result<u64> {
        self.resolver.pending_count(sendout, self.clock.now()).await
    }

    pub async fn progress_fraction(&self, sendout: &Sendout) -> Result<f64> {
        if sendout.send_status == SendStatus::Sent {
            return Ok(1.0);
        }
        let pending = self.pending_recipient_count(sendout).await?;
        Ok(progress_fraction(sendout.recipients, pending))
    }

    /// Percentage for listings. Drafts and repeating sendouts have none.
    pub async fn progress_label(&self, sendout: &Sendout) -> Result<String> {
        if sendout.send_status == SendStatus::Draft || sendout.sendout_type.is_repeating() {
            return Ok(String::new());
        }
        let fraction = self.progress_fraction(sendout).await?;
        Ok(format!("{}%", (fraction * 100.0).round() as u32))
    }

    async fn change_status(
        &self,
        mut sendout: Sendout,
        action: &'static str,
        to: SendStatus,
    ) -> Result<Sendout> {
        let expected = sendout.send_status;
        sendout.transition_to(to)?;
        if !self
            .store
            .update_status(sendout.id, expected, to, None)
            .await?
        {
            return Err(self.conflict(sendout.id, action).await);
        }
        sendout.send_status_message = None;
        tracing::info!(sendout = %sendout.sid, status = %to, "Sendout {}", action);
        Ok(sendout)
    }

    /// The status moved under us; report what it is now.
    async fn conflict(&self, id: SendoutId, action: &'static str) -> SendoutError {
        match self.get(id).await {
            Ok(current) => not_actionable(&current, action),
            Err(e) => e,
        }
    }
}

fn not_actionable(sendout: &Sendout, action: &'static str) -> SendoutError {
    SendoutError::NotActionable {
        status: sendout.send_status.to_string(),
        action,
    }
}

/// Status, counters, run history and body snapshots only move through the
/// lifecycle operations and the batch processor; an edit never resets them.
fn carry_run_state(stored: &Sendout, sendout: &mut Sendout) {
    sendout.send_status = stored.send_status;
    sendout.recipients = stored.recipients;
    sendout.failed_recipients = stored.failed_recipients;
    sendout.last_sent = stored.last_sent;
    sendout.retry_attempts = stored.retry_attempts;
    sendout.html_body = stored.html_body.clone();
    sendout.plaintext_body = stored.plaintext_body.clone();

    // 已完成的週期次數不可被表單資料覆寫
    if let (Some(Schedule::Recurring(before)), Some(Schedule::Recurring(after))) =
        (&stored.schedule, sendout.schedule.as_mut())
    {
        after.runs = before.runs;
    }
}

fn generate_sid() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("s{}", &token[..16])
}
