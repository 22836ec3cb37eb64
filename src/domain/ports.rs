use crate::domain::model::{
    Campaign, CampaignId, Contact, ContactId, DeliveryRecord, MailingList, MailingListId, MailingListType,
    MailingListTypeId, OutgoingMessage, PendingContact, Segment, SegmentId, Sendout, SendoutId,
};
use crate::domain::status::SendStatus;
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[async_trait]
pub trait SendoutStore: Send + Sync {
    async fn get_sendout(&self, id: SendoutId) -> Result<Option<Sendout>>;

    async fn find_sendout_by_sid(&self, sid: &str) -> Result<Option<Sendout>>;

    async fn find_sendouts(&self, status: SendStatus) -> Result<Vec<Sendout>>;

    /// Inserts when `sendout.id` is 0 (assigning the id), updates otherwise.
    async fn save_sendout(&self, sendout: &mut Sendout) -> Result<()>;

    /// Writes the whole sendout only while the stored status is still
    /// `expected`. Returns `false` without writing otherwise.
    async fn save_sendout_if(&self, sendout: &Sendout, expected: SendStatus) -> Result<bool>;

    async fn delete_sendout(&self, id: SendoutId) -> Result<bool>;

    /// Compare-and-set on the status column. Returns `false` without writing
    /// when the stored status is no longer `expected`.
    async fn update_status(
        &self,
        id: SendoutId,
        expected: SendStatus,
        status: SendStatus,
        message: Option<String>,
    ) -> Result<bool>;

    /// Stores the record and bumps `recipients` or `failed_recipients` in the
    /// same write. Returns `false` when `(sendout, contact, run)` is already
    /// recorded, leaving the counters untouched.
    async fn record_delivery(&self, record: DeliveryRecord) -> Result<bool>;

    async fn deliveries(
        &self,
        sendout_id: SendoutId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<DeliveryRecord>>;

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;
}

#[async_trait]
pub trait AudienceStore: Send + Sync {
    async fn mailing_lists(&self, ids: &[MailingListId]) -> Result<Vec<MailingList>>;

    async fn mailing_list_type(&self, id: MailingListTypeId) -> Result<Option<MailingListType>>;

    async fn segments(&self, ids: &[SegmentId]) -> Result<Vec<Segment>>;

    /// One page of contacts actively subscribed to any of the lists,
    /// ordered by id and starting strictly after `after`.
    async fn subscribed_contacts(
        &self,
        mailing_list_ids: &[MailingListId],
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<Contact>>;

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>>;

    /// Inserts when `contact.id` is 0 (assigning the id), updates otherwise.
    async fn save_contact(&self, contact: &mut Contact) -> Result<()>;
}

#[async_trait]
pub trait PendingContactStore: Send + Sync {
    async fn save_pending_contact(&self, pending: &PendingContact) -> Result<()>;

    async fn find_pending_contact(&self, pid: &str) -> Result<Option<PendingContact>>;

    /// Oldest first.
    async fn pending_contacts_for(
        &self,
        email: &str,
        mailing_list_id: MailingListId,
    ) -> Result<Vec<PendingContact>>;

    async fn delete_pending_contact(&self, pid: &str) -> Result<bool>;

    async fn purge_pending_contacts(&self, created_before: DateTime<Utc>) -> Result<usize>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The transport refused this message. Other recipients may still work.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The transport itself is down; the rest of the batch would fail too.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> std::result::Result<(), DispatchError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub trait MemoryProbe: Send + Sync {
    /// Resident memory of the current process in bytes.
    fn used_bytes(&self) -> u64;
}
