use crate::core::resolver::RecipientResolver;
use crate::domain::model::{Sendout, SendoutType};
use crate::domain::ports::{AudienceStore, SendoutStore};
use crate::domain::schedule::Schedule;
use crate::utils::error::Result;
use chrono::{DateTime, Utc};

/// Decides whether a sendout may fire now.
pub struct ScheduleEvaluator<S> {
    resolver: RecipientResolver<S>,
    pro: bool,
}

impl<S: SendoutStore + AudienceStore> ScheduleEvaluator<S> {
    pub fn new(resolver: RecipientResolver<S>, pro: bool) -> Self {
        Self { resolver, pro }
    }

    pub async fn can_send_now(&self, sendout: &Sendout, now: DateTime<Utc>) -> Result<bool> {
        if sendout.sendout_type.requires_pro() && !self.pro {
            return Ok(false);
        }

        match (&sendout.sendout_type, &sendout.schedule) {
            (SendoutType::Regular, _) => Ok(true),
            (SendoutType::Scheduled, _) => Ok(sendout.send_date.is_some_and(|at| at <= now)),
            (SendoutType::Recurring, Some(Schedule::Recurring(recurring))) => {
                Ok(sendout.send_date.map_or(true, |at| at <= now) && recurring.is_due(now))
            }
            (SendoutType::Automated, Some(Schedule::Automated(automated))) => {
                if !automated.is_active(now) {
                    return Ok(false);
                }
                self.resolver.has_pending(sendout, now).await
            }
            _ => {
                tracing::warn!(
                    sendout = %sendout.sid,
                    sendout_type = %sendout.sendout_type,
                    "schedule does not match sendout type"
                );
                Ok(false)
            }
        }
    }

    /// When the sendout is next expected to fire, where that is known up front.
    pub fn next_run(&self, sendout: &Sendout) -> Option<DateTime<Utc>> {
        match (&sendout.sendout_type, &sendout.schedule) {
            (SendoutType::Scheduled, _) => sendout.send_date,
            (SendoutType::Recurring, Some(Schedule::Recurring(recurring)))
                if !recurring.is_exhausted() =>
            {
                recurring.next_run()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use crate::domain::model::{Contact, Subscription, SubscriptionStatus};
    use crate::domain::schedule::{AutomatedSchedule, DelayUnit, Frequency, RecurringSchedule};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn evaluator(store: MemoryStore, pro: bool) -> ScheduleEvaluator<MemoryStore> {
        ScheduleEvaluator::new(RecipientResolver::new(Arc::new(store), pro), pro)
    }

    #[tokio::test]
    async fn test_regular_and_scheduled() {
        let evaluator = evaluator(MemoryStore::new(), false);

        let regular = Sendout::new("Now", SendoutType::Regular);
        assert!(evaluator.can_send_now(&regular, at(2024, 1, 1)).await.unwrap());

        let mut scheduled = Sendout::new("Later", SendoutType::Scheduled);
        scheduled.send_date = Some(at(2024, 2, 1));
        assert!(!evaluator.can_send_now(&scheduled, at(2024, 1, 31)).await.unwrap());
        assert!(evaluator.can_send_now(&scheduled, at(2024, 2, 1)).await.unwrap());
        assert_eq!(evaluator.next_run(&scheduled), Some(at(2024, 2, 1)));
    }

    #[tokio::test]
    async fn test_recurring_requires_pro() {
        let mut sendout = Sendout::new("Daily", SendoutType::Recurring);
        sendout.schedule = Some(Schedule::Recurring(RecurringSchedule::new(
            Frequency::Daily,
            at(2024, 1, 1),
        )));

        let lite = evaluator(MemoryStore::new(), false);
        assert!(!lite.can_send_now(&sendout, at(2024, 1, 5)).await.unwrap());

        let pro = evaluator(MemoryStore::new(), true);
        assert!(pro.can_send_now(&sendout, at(2024, 1, 5)).await.unwrap());
        assert_eq!(pro.next_run(&sendout), Some(at(2024, 1, 1)));
    }

    #[tokio::test]
    async fn test_automated_fires_when_a_contact_is_due() {
        let store = MemoryStore::new();
        let mut contact = Contact {
            id: 1,
            email: "a@example.com".to_string(),
            ..Default::default()
        };
        contact.subscriptions.insert(
            10,
            Subscription {
                status: SubscriptionStatus::Subscribed,
                subscribed: Some(at(2024, 1, 1)),
                source: None,
            },
        );
        store.insert_contact(contact).unwrap();

        let mut sendout = Sendout::new("Welcome", SendoutType::Automated);
        sendout.id = 1;
        sendout.mailing_list_ids = vec![10];
        sendout.schedule = Some(Schedule::Automated(AutomatedSchedule {
            time_delay: 3,
            time_delay_unit: DelayUnit::Days,
            ..Default::default()
        }));

        let evaluator = evaluator(store, true);
        assert!(!evaluator.can_send_now(&sendout, at(2024, 1, 3)).await.unwrap());
        assert!(evaluator.can_send_now(&sendout, at(2024, 1, 4)).await.unwrap());

        if let Some(Schedule::Automated(schedule)) = sendout.schedule.as_mut() {
            schedule.end_date = Some(at(2024, 1, 2));
        }
        assert!(!evaluator
            .can_send_now(&sendout, at(2024, 1, 4) + Duration::hours(1))
            .await
            .unwrap());
    }
}
