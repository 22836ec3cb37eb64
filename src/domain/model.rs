use crate::domain::conditions::ConditionTree;
use crate::domain::schedule::Schedule;
use crate::domain::status::SendStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub type SendoutId = u64;
pub type CampaignId = u64;
pub type ContactId = u64;
pub type MailingListId = u64;
pub type MailingListTypeId = u64;
pub type SegmentId = u64;
pub type SiteId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendoutType {
    #[default]
    Regular,
    Scheduled,
    Automated,
    Recurring,
}

impl SendoutType {
    pub fn requires_pro(&self) -> bool {
        matches!(self, SendoutType::Automated | SendoutType::Recurring)
    }

    /// Types whose runs are gated by a send date or schedule.
    pub fn is_timed(&self) -> bool {
        !matches!(self, SendoutType::Regular)
    }

    /// Automated and recurring sendouts go back to pending after each run.
    pub fn is_repeating(&self) -> bool {
        self.requires_pro()
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendoutType::Regular => "Regular",
            SendoutType::Scheduled => "Scheduled",
            SendoutType::Automated => "Automated",
            SendoutType::Recurring => "Recurring",
        }
    }
}

impl fmt::Display for SendoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The sendout types available for the installed edition.
pub fn sendout_types(pro: bool) -> Vec<SendoutType> {
    let mut types = vec![SendoutType::Regular, SendoutType::Scheduled];
    if pro {
        types.push(SendoutType::Automated);
        types.push(SendoutType::Recurring);
    }
    types
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sendout {
    pub id: SendoutId,
    pub sid: String,
    pub title: String,
    pub sendout_type: SendoutType,
    pub send_status: SendStatus,
    pub send_status_message: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub notification_email_address: Option<String>,
    pub mailing_list_ids: Vec<MailingListId>,
    pub excluded_mailing_list_ids: Vec<MailingListId>,
    pub segment_ids: Vec<SegmentId>,
    pub recipients: u64,
    pub failed_recipients: u64,
    pub retry_attempts: u32,
    pub schedule: Option<Schedule>,
    pub send_date: Option<DateTime<Utc>>,
    pub last_sent: Option<DateTime<Utc>>,
    pub html_body: Option<String>,
    pub plaintext_body: Option<String>,
}

impl Sendout {
    pub fn new(title: impl Into<String>, sendout_type: SendoutType) -> Self {
        Self {
            title: title.into(),
            sendout_type,
            ..Default::default()
        }
    }

    pub fn from_name_email(&self) -> String {
        if self.from_name.is_empty() {
            String::new()
        } else {
            format!("{}:{}", self.from_name, self.from_email)
        }
    }

    /// Run index that delivery records are keyed on.
    ///
    /// Only recurring sendouts allowed to reach a contact more than once
    /// advance it; everything else stays on run 0 for its whole life.
    pub fn current_run(&self) -> u32 {
        match &self.schedule {
            Some(Schedule::Recurring(recurring)) if recurring.can_send_to_contacts_multiple_times => {
                recurring.runs
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailingList {
    pub id: MailingListId,
    pub title: String,
    pub mailing_list_type_id: Option<MailingListTypeId>,
    pub site_id: Option<SiteId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailingListType {
    pub id: MailingListTypeId,
    pub name: String,
    pub handle: String,
    pub site_id: Option<SiteId>,
    pub double_opt_in: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segment {
    pub id: SegmentId,
    pub title: String,
    pub conditions: ConditionTree,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Campaign {
    pub id: CampaignId,
    pub title: String,
    pub html_body: String,
    pub plaintext_body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
    Complained,
    Bounced,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub subscribed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub id: ContactId,
    pub email: String,
    pub subscriptions: BTreeMap<MailingListId, Subscription>,
    pub field_data: HashMap<String, serde_json::Value>,
}

impl Contact {
    pub fn is_subscribed_to(&self, mailing_list_id: MailingListId) -> bool {
        self.subscriptions
            .get(&mailing_list_id)
            .is_some_and(|s| s.status == SubscriptionStatus::Subscribed)
    }

    pub fn subscribed_since(&self, mailing_list_id: MailingListId) -> Option<DateTime<Utc>> {
        self.subscriptions
            .get(&mailing_list_id)
            .filter(|s| s.status == SubscriptionStatus::Subscribed)
            .and_then(|s| s.subscribed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingContact {
    pub pid: String,
    pub email: String,
    pub mailing_list_id: MailingListId,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub field_data: HashMap<String, serde_json::Value>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Failed { reason: String },
}

/// One row of send history: a contact reached (or not) by a sendout run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub sendout_id: SendoutId,
    pub contact_id: ContactId,
    pub mailing_list_id: MailingListId,
    #[serde(default)]
    pub run: u32,
    pub delivered_at: DateTime<Utc>,
    pub outcome: DeliveryOutcome,
}

impl DeliveryRecord {
    pub fn is_sent(&self) -> bool {
        self.outcome == DeliveryOutcome::Sent
    }
}

/// A contact paired with the list that qualified it for a sendout.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub contact: Contact,
    pub mailing_list_id: MailingListId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub sendout_sid: String,
    pub contact_id: ContactId,
    pub mailing_list_id: MailingListId,
    pub to: String,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub html_body: String,
    pub plaintext_body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    /// Partial progress; invoke again after the batch delay.
    Continued,
    /// Nothing left to send for this run.
    Completed,
    /// Paused by an operator while the batch was in flight.
    Paused,
    /// Invocation failed but retries remain.
    Retrying,
    /// Retries exhausted; the sendout is now `failed`.
    Failed,
    /// Not actionable or not due. No work was done.
    Skipped,
}

impl BatchOutcome {
    /// Whether the scheduler should invoke the sendout again.
    pub fn should_requeue(&self) -> bool {
        matches!(self, BatchOutcome::Continued | BatchOutcome::Retrying)
    }
}
