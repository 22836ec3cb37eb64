use crate::domain::model::{
    Campaign, CampaignId, Contact, ContactId, DeliveryRecord, MailingList, MailingListId,
    MailingListType, MailingListTypeId, PendingContact, Segment, SegmentId, Sendout, SendoutId,
};
use crate::domain::ports::{AudienceStore, PendingContactStore, SendoutStore};
use crate::domain::status::SendStatus;
use crate::utils::error::{Result, SendoutError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Serialized form of a [`MemoryStore`], used for CLI data files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub sendouts: Vec<Sendout>,
    pub campaigns: Vec<Campaign>,
    pub mailing_lists: Vec<MailingList>,
    pub mailing_list_types: Vec<MailingListType>,
    pub segments: Vec<Segment>,
    pub contacts: Vec<Contact>,
    pub pending_contacts: Vec<PendingContact>,
    pub deliveries: Vec<DeliveryRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    sendouts: BTreeMap<SendoutId, Sendout>,
    campaigns: HashMap<CampaignId, Campaign>,
    mailing_lists: BTreeMap<MailingListId, MailingList>,
    mailing_list_types: HashMap<MailingListTypeId, MailingListType>,
    segments: BTreeMap<SegmentId, Segment>,
    contacts: BTreeMap<ContactId, Contact>,
    pending_contacts: BTreeMap<String, PendingContact>,
    deliveries: BTreeMap<(SendoutId, ContactId, u32), DeliveryRecord>,
}

impl Inner {
    fn next_sendout_id(&self) -> SendoutId {
        self.sendouts.keys().next_back().map_or(1, |id| id + 1)
    }

    fn next_contact_id(&self) -> ContactId {
        self.contacts.keys().next_back().map_or(1, |id| id + 1)
    }
}

/// Store backed by maps behind an `RwLock`.
///
/// Every write happens under a single lock acquisition, which gives the
/// per-record atomicity the batch processor relies on. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut inner = Inner::default();
        inner.sendouts = snapshot.sendouts.into_iter().map(|s| (s.id, s)).collect();
        inner.campaigns = snapshot.campaigns.into_iter().map(|c| (c.id, c)).collect();
        inner.mailing_lists = snapshot
            .mailing_lists
            .into_iter()
            .map(|l| (l.id, l))
            .collect();
        inner.mailing_list_types = snapshot
            .mailing_list_types
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
        inner.segments = snapshot.segments.into_iter().map(|s| (s.id, s)).collect();
        inner.contacts = snapshot.contacts.into_iter().map(|c| (c.id, c)).collect();
        inner.pending_contacts = snapshot
            .pending_contacts
            .into_iter()
            .map(|p| (p.pid.clone(), p))
            .collect();
        inner.deliveries = snapshot
            .deliveries
            .into_iter()
            .map(|d| ((d.sendout_id, d.contact_id, d.run), d))
            .collect();

        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let inner = self.read()?;
        Ok(Snapshot {
            sendouts: inner.sendouts.values().cloned().collect(),
            campaigns: inner.campaigns.values().cloned().collect(),
            mailing_lists: inner.mailing_lists.values().cloned().collect(),
            mailing_list_types: inner.mailing_list_types.values().cloned().collect(),
            segments: inner.segments.values().cloned().collect(),
            contacts: inner.contacts.values().cloned().collect(),
            pending_contacts: inner.pending_contacts.values().cloned().collect(),
            deliveries: inner.deliveries.values().cloned().collect(),
        })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.snapshot()?)?;
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| SendoutError::StoreError {
            message: "memory store lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| SendoutError::StoreError {
            message: "memory store lock poisoned".to_string(),
        })
    }

    // Fixture helpers. These overwrite by id and never fail on a healthy lock.

    pub fn insert_campaign(&self, campaign: Campaign) -> Result<()> {
        self.write()?.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    pub fn insert_mailing_list(&self, list: MailingList) -> Result<()> {
        self.write()?.mailing_lists.insert(list.id, list);
        Ok(())
    }

    pub fn insert_mailing_list_type(&self, list_type: MailingListType) -> Result<()> {
        self.write()?.mailing_list_types.insert(list_type.id, list_type);
        Ok(())
    }

    pub fn insert_segment(&self, segment: Segment) -> Result<()> {
        self.write()?.segments.insert(segment.id, segment);
        Ok(())
    }

    pub fn insert_contact(&self, contact: Contact) -> Result<()> {
        self.write()?.contacts.insert(contact.id, contact);
        Ok(())
    }

    pub fn insert_sendout(&self, sendout: Sendout) -> Result<()> {
        self.write()?.sendouts.insert(sendout.id, sendout);
        Ok(())
    }

    pub fn deliveries_for(&self, sendout_id: SendoutId) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .read()?
            .deliveries
            .values()
            .filter(|d| d.sendout_id == sendout_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SendoutStore for MemoryStore {
    async fn get_sendout(&self, id: SendoutId) -> Result<Option<Sendout>> {
        Ok(self.read()?.sendouts.get(&id).cloned())
    }

    async fn find_sendout_by_sid(&self, sid: &str) -> Result<Option<Sendout>> {
        Ok(self
            .read()?
            .sendouts
            .values()
            .find(|s| s.sid == sid)
            .cloned())
    }

    async fn find_sendouts(&self, status: SendStatus) -> Result<Vec<Sendout>> {
        Ok(self
            .read()?
            .sendouts
            .values()
            .filter(|s| s.send_status == status)
            .cloned()
            .collect())
    }

    async fn save_sendout(&self, sendout: &mut Sendout) -> Result<()> {
        let mut inner = self.write()?;
        if sendout.id == 0 {
            sendout.id = inner.next_sendout_id();
        }
        inner.sendouts.insert(sendout.id, sendout.clone());
        Ok(())
    }

    async fn save_sendout_if(&self, sendout: &Sendout, expected: SendStatus) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.sendouts.get_mut(&sendout.id) {
            Some(stored) if stored.send_status == expected => {
                *stored = sendout.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_sendout(&self, id: SendoutId) -> Result<bool> {
        let mut inner = self.write()?;
        let removed = inner.sendouts.remove(&id).is_some();
        if removed {
            inner.deliveries.retain(|(sendout_id, _, _), _| *sendout_id != id);
        }
        Ok(removed)
    }

    async fn update_status(
        &self,
        id: SendoutId,
        expected: SendStatus,
        status: SendStatus,
        message: Option<String>,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.sendouts.get_mut(&id) {
            Some(sendout) if sendout.send_status == expected => {
                sendout.send_status = status;
                sendout.send_status_message = message;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_delivery(&self, record: DeliveryRecord) -> Result<bool> {
        let mut inner = self.write()?;
        let key = (record.sendout_id, record.contact_id, record.run);
        if inner.deliveries.contains_key(&key) {
            return Ok(false);
        }

        if let Some(sendout) = inner.sendouts.get_mut(&record.sendout_id) {
            if record.is_sent() {
                sendout.recipients += 1;
            } else {
                sendout.failed_recipients += 1;
            }
        }
        inner.deliveries.insert(key, record);
        Ok(true)
    }

    async fn deliveries(
        &self,
        sendout_id: SendoutId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<DeliveryRecord>> {
        let inner = self.read()?;
        Ok(inner
            .deliveries
            .range((sendout_id, 0, 0)..=(sendout_id, ContactId::MAX, u32::MAX))
            .filter(|((_, contact_id, _), _)| contact_ids.contains(contact_id))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.read()?.campaigns.get(&id).cloned())
    }
}

#[async_trait]
impl AudienceStore for MemoryStore {
    async fn mailing_lists(&self, ids: &[MailingListId]) -> Result<Vec<MailingList>> {
        let inner = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.mailing_lists.get(id).cloned())
            .collect())
    }

    async fn mailing_list_type(&self, id: MailingListTypeId) -> Result<Option<MailingListType>> {
        Ok(self.read()?.mailing_list_types.get(&id).cloned())
    }

    async fn segments(&self, ids: &[SegmentId]) -> Result<Vec<Segment>> {
        let inner = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.segments.get(id).cloned())
            .collect())
    }

    async fn subscribed_contacts(
        &self,
        mailing_list_ids: &[MailingListId],
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<Contact>> {
        let inner = self.read()?;
        let start = after.map_or(0, |id| id.saturating_add(1));
        Ok(inner
            .contacts
            .range(start..)
            .map(|(_, contact)| contact)
            .filter(|contact| mailing_list_ids.iter().any(|id| contact.is_subscribed_to(*id)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>> {
        Ok(self
            .read()?
            .contacts
            .values()
            .find(|c| c.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn save_contact(&self, contact: &mut Contact) -> Result<()> {
        let mut inner = self.write()?;
        if contact.id == 0 {
            contact.id = inner.next_contact_id();
        }
        inner.contacts.insert(contact.id, contact.clone());
        Ok(())
    }
}

#[async_trait]
impl PendingContactStore for MemoryStore {
    async fn save_pending_contact(&self, pending: &PendingContact) -> Result<()> {
        self.write()?
            .pending_contacts
            .insert(pending.pid.clone(), pending.clone());
        Ok(())
    }

    async fn find_pending_contact(&self, pid: &str) -> Result<Option<PendingContact>> {
        Ok(self.read()?.pending_contacts.get(pid).cloned())
    }

    async fn pending_contacts_for(
        &self,
        email: &str,
        mailing_list_id: MailingListId,
    ) -> Result<Vec<PendingContact>> {
        let mut matching: Vec<PendingContact> = self
            .read()?
            .pending_contacts
            .values()
            .filter(|p| p.mailing_list_id == mailing_list_id && p.email.eq_ignore_ascii_case(email))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.pid.cmp(&b.pid)));
        Ok(matching)
    }

    async fn delete_pending_contact(&self, pid: &str) -> Result<bool> {
        Ok(self.write()?.pending_contacts.remove(pid).is_some())
    }

    async fn purge_pending_contacts(&self, created_before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.pending_contacts.len();
        inner.pending_contacts.retain(|_, p| p.created >= created_before);
        Ok(before - inner.pending_contacts.len())
    }
}
