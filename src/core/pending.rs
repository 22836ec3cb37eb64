use crate::config::PendingContactsConfig;
use crate::domain::model::{
    Contact, MailingListId, PendingContact, Subscription, SubscriptionStatus,
};
use crate::domain::ports::{AudienceStore, Clock, PendingContactStore};
use crate::utils::error::{Result, SendoutError};
use crate::utils::validation;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    /// Double opt-in list: waiting for the contact to confirm.
    Pending(PendingContact),
    Subscribed(Contact),
}

/// 訂閱與待確認聯絡人
pub struct SubscriptionService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: PendingContactsConfig,
}

impl<S: AudienceStore + PendingContactStore> SubscriptionService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: PendingContactsConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn subscribe(
        &self,
        email: &str,
        mailing_list_id: MailingListId,
        source: Option<String>,
        field_data: HashMap<String, Value>,
    ) -> Result<SubscribeOutcome> {
        validation::validate_email("email", email)?;

        let list = self
            .store
            .mailing_lists(&[mailing_list_id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SendoutError::not_found("mailing list", mailing_list_id))?;

        let double_opt_in = match list.mailing_list_type_id {
            Some(type_id) => self
                .store
                .mailing_list_type(type_id)
                .await?
                .is_some_and(|t| t.double_opt_in),
            None => false,
        };

        if double_opt_in {
            let pending = self.stage(email, mailing_list_id, source, field_data).await?;
            Ok(SubscribeOutcome::Pending(pending))
        } else {
            let contact = self
                .subscribe_contact(email, mailing_list_id, source, field_data)
                .await?;
            Ok(SubscribeOutcome::Subscribed(contact))
        }
    }

    /// Stores a pending contact, evicting the oldest entries for the same
    /// email and list once `max_pending_contacts` would be exceeded.
    pub async fn stage(
        &self,
        email: &str,
        mailing_list_id: MailingListId,
        source: Option<String>,
        field_data: HashMap<String, Value>,
    ) -> Result<PendingContact> {
        validation::validate_email("email", email)?;

        let existing = self.store.pending_contacts_for(email, mailing_list_id).await?;
        let keep = self.config.max_pending_contacts.saturating_sub(1);
        let evict = existing.len().saturating_sub(keep);
        for old in existing.iter().take(evict) {
            self.store.delete_pending_contact(&old.pid).await?;
        }
        if evict > 0 {
            tracing::debug!(email, mailing_list_id, evict, "evicted oldest pending contacts");
        }

        let pending = PendingContact {
            pid: Uuid::new_v4().simple().to_string(),
            email: email.to_string(),
            mailing_list_id,
            source,
            field_data,
            created: self.clock.now(),
        };
        self.store.save_pending_contact(&pending).await?;
        Ok(pending)
    }

    /// Promotes a pending contact to a subscribed one.
    pub async fn confirm(&self, pid: &str) -> Result<Contact> {
        let pending = self
            .store
            .find_pending_contact(pid)
            .await?
            .ok_or_else(|| SendoutError::not_found("pending contact", pid))?;

        if self
            .cutoff()
            .is_some_and(|cutoff| pending.created < cutoff)
        {
            self.store.delete_pending_contact(pid).await?;
            return Err(SendoutError::validation("pid", "verification link has expired"));
        }

        let contact = self
            .subscribe_contact(
                &pending.email,
                pending.mailing_list_id,
                pending.source.clone(),
                pending.field_data.clone(),
            )
            .await?;

        for other in self
            .store
            .pending_contacts_for(&pending.email, pending.mailing_list_id)
            .await?
        {
            self.store.delete_pending_contact(&other.pid).await?;
        }

        tracing::info!(email = %pending.email, mailing_list_id = pending.mailing_list_id, "✅ Subscription confirmed");
        Ok(contact)
    }

    /// Removes pending contacts older than the purge duration. A zero
    /// duration disables purging.
    pub async fn purge_expired(&self) -> Result<usize> {
        let Some(cutoff) = self.cutoff() else {
            return Ok(0);
        };
        let purged = self.store.purge_pending_contacts(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "🧹 Purged expired pending contacts");
        }
        Ok(purged)
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        let duration = self.config.purge_pending_contacts_duration;
        if duration.is_zero() {
            return None;
        }
        let secs = i64::try_from(duration.0).ok()?;
        self.clock.now().checked_sub_signed(Duration::seconds(secs))
    }

    async fn subscribe_contact(
        &self,
        email: &str,
        mailing_list_id: MailingListId,
        source: Option<String>,
        field_data: HashMap<String, Value>,
    ) -> Result<Contact> {
        let mut contact = self
            .store
            .find_contact_by_email(email)
            .await?
            .unwrap_or_else(|| Contact {
                email: email.to_string(),
                ..Default::default()
            });

        contact.field_data.extend(field_data);
        contact.subscriptions.insert(
            mailing_list_id,
            Subscription {
                status: SubscriptionStatus::Subscribed,
                subscribed: Some(self.clock.now()),
                source,
            },
        );

        self.store.save_contact(&mut contact).await?;
        Ok(contact)
    }
}
