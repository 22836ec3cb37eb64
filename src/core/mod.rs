pub mod budget;
pub mod engine;
pub mod manager;
pub mod pending;
pub mod processor;
pub mod resolver;
pub mod scheduler;

pub use budget::{BatchBudget, BudgetLimit};
pub use engine::{SendoutEngine, SendoutRun};
pub use manager::SendoutManager;
pub use pending::{SubscribeOutcome, SubscriptionService};
pub use processor::{progress_fraction, BatchProcessor};
pub use resolver::RecipientResolver;
pub use scheduler::ScheduleEvaluator;
