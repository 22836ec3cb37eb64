use crate::domain::model::{
    Contact, ContactId, MailingListId, Recipient, Segment, Sendout, SendoutId, SendoutType,
};
use crate::domain::ports::{AudienceStore, SendoutStore};
use crate::domain::schedule::{AutomatedSchedule, AutomatedTrigger, Schedule};
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: usize = 500;

/// Everything about a sendout's audience that does not change while paging.
struct Audience<'a> {
    sendout: &'a Sendout,
    /// `None` when no segment filtering applies.
    segments: Option<Vec<Segment>>,
    automated: Option<&'a AutomatedSchedule>,
    run: u32,
}

/// Works out who a sendout still has to reach.
///
/// Nothing is cached between calls: each call pages through the store by
/// contact id, so memory stays bounded by the page size and the answer
/// always reflects the latest send history.
pub struct RecipientResolver<S> {
    store: Arc<S>,
    pro: bool,
    page_size: usize,
}

impl<S> Clone for RecipientResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            pro: self.pro,
            page_size: self.page_size,
        }
    }
}

impl<S: SendoutStore + AudienceStore> RecipientResolver<S> {
    pub fn new(store: Arc<S>, pro: bool) -> Self {
        Self {
            store,
            pro,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Up to `limit` recipients, in contact id order.
    pub async fn pending_recipients(
        &self,
        sendout: &Sendout,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Recipient>> {
        let mut recipients = Vec::new();
        if limit == 0 {
            return Ok(recipients);
        }
        let Some(audience) = self.audience(sendout).await? else {
            return Ok(recipients);
        };

        // 以 contact id 分頁，避免一次載入整個名單
        let mut cursor = None;
        loop {
            let page = self
                .store
                .subscribed_contacts(&sendout.mailing_list_ids, cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            let last_page = page.len() < self.page_size;

            // 過濾後可能整頁都不符合，繼續下一頁
            for recipient in self.filter_page(&audience, page, now).await? {
                recipients.push(recipient);
                if recipients.len() >= limit {
                    return Ok(recipients);
                }
            }

            if last_page {
                break;
            }
        }

        Ok(recipients)
    }

    pub async fn pending_count(&self, sendout: &Sendout, now: DateTime<Utc>) -> Result<u64> {
        let Some(audience) = self.audience(sendout).await? else {
            return Ok(0);
        };

        let mut count = 0u64;
        let mut cursor = None;
        loop {
            let page = self
                .store
                .subscribed_contacts(&sendout.mailing_list_ids, cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            let last_page = page.len() < self.page_size;

            count += self.filter_page(&audience, page, now).await?.len() as u64;

            if last_page {
                break;
            }
        }

        Ok(count)
    }

    pub async fn has_pending(&self, sendout: &Sendout, now: DateTime<Utc>) -> Result<bool> {
        Ok(!self.pending_recipients(sendout, now, 1).await?.is_empty())
    }

    async fn audience<'a>(&self, sendout: &'a Sendout) -> Result<Option<Audience<'a>>> {
        if sendout.mailing_list_ids.is_empty() {
            return Ok(None);
        }

        let automated = match (&sendout.sendout_type, &sendout.schedule) {
            (SendoutType::Automated, Some(Schedule::Automated(schedule))) => Some(schedule),
            (SendoutType::Automated, _) => {
                tracing::warn!(sendout = %sendout.sid, "automated sendout has no automated schedule");
                return Ok(None);
            }
            _ => None,
        };

        // Segments are a pro feature. Ids that no longer resolve are dropped,
        // but a segment-targeted sendout never widens to the whole list.
        let segments = if self.pro && !sendout.segment_ids.is_empty() {
            let segments = self.store.segments(&sendout.segment_ids).await?;
            if segments.is_empty() {
                tracing::warn!(
                    sendout = %sendout.sid,
                    segment_ids = ?sendout.segment_ids,
                    "⚠️ None of the sendout's segments exist, no recipients selected"
                );
                return Ok(None);
            }
            if segments.len() < sendout.segment_ids.len() {
                tracing::debug!(sendout = %sendout.sid, "some segments no longer exist");
            }
            Some(segments)
        } else {
            None
        };

        Ok(Some(Audience {
            sendout,
            segments,
            automated,
            run: sendout.current_run(),
        }))
    }

    async fn filter_page(
        &self,
        audience: &Audience<'_>,
        page: Vec<Contact>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>> {
        let sendout = audience.sendout;
        let ids: Vec<ContactId> = page.iter().map(|c| c.id).collect();

        // 1. 本輪已寄送(或已失敗)的聯絡人
        let contacted: HashSet<ContactId> = self
            .store
            .deliveries(sendout.id, &ids)
            .await?
            .into_iter()
            .filter(|d| d.run == audience.run)
            .map(|d| d.contact_id)
            .collect();

        // 2. 序列觸發: 前一封 sendout 的首次成功寄送時間
        let delivered_at = match audience.automated.map(|a| &a.trigger) {
            Some(AutomatedTrigger::SendoutDelivered { sendout_id }) => {
                self.first_deliveries(*sendout_id, &ids).await?
            }
            _ => HashMap::new(),
        };

        // 3. 依序套用排除名單、分群條件與自動觸發延遲
        let recipients = page
            .into_iter()
            .filter(|contact| !contacted.contains(&contact.id))
            .filter(|contact| {
                !sendout
                    .excluded_mailing_list_ids
                    .iter()
                    .any(|id| contact.is_subscribed_to(*id))
            })
            .filter(|contact| match &audience.segments {
                // 多個分群之間為 OR
                Some(segments) => segments.iter().any(|s| s.conditions.evaluate(contact)),
                None => true,
            })
            .filter_map(|contact| {
                let mailing_list_id = qualifying_list(sendout, &contact)?;
                if let Some(schedule) = audience.automated {
                    let reference = match &schedule.trigger {
                        AutomatedTrigger::Subscribed => contact.subscribed_since(mailing_list_id),
                        AutomatedTrigger::SendoutDelivered { .. } => {
                            delivered_at.get(&contact.id).copied()
                        }
                    }?;
                    // Events older than the sendout's start date never trigger it.
                    if sendout.send_date.is_some_and(|start| reference < start) {
                        return None;
                    }
                    if !schedule.is_triggered(reference, now) {
                        return None;
                    }
                }
                Some(Recipient {
                    contact,
                    mailing_list_id,
                })
            })
            .collect();

        Ok(recipients)
    }

    /// Earliest successful delivery of `sendout_id` per contact.
    async fn first_deliveries(
        &self,
        sendout_id: SendoutId,
        ids: &[ContactId],
    ) -> Result<HashMap<ContactId, DateTime<Utc>>> {
        let mut first = HashMap::new();
        for record in self.store.deliveries(sendout_id, ids).await? {
            if !record.is_sent() {
                continue;
            }
            first
                .entry(record.contact_id)
                .and_modify(|at: &mut DateTime<Utc>| *at = (*at).min(record.delivered_at))
                .or_insert(record.delivered_at);
        }
        Ok(first)
    }
}

/// First of the sendout's lists, in configured order, the contact is on.
fn qualifying_list(sendout: &Sendout, contact: &Contact) -> Option<MailingListId> {
    sendout
        .mailing_list_ids
        .iter()
        .copied()
        .find(|id| contact.is_subscribed_to(*id))
}
