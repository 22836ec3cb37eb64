pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::CampaignConfig;

pub use crate::core::{
    BatchProcessor, RecipientResolver, ScheduleEvaluator, SendoutEngine, SendoutManager,
    SubscriptionService,
};
pub use domain::conditions::{evaluate, ConditionTree};
pub use domain::model::{BatchOutcome, Sendout, SendoutType};
pub use domain::status::SendStatus;
pub use utils::error::{Result, SendoutError};
