// Concrete implementations of the domain ports: storage, mail transports, clocks.

pub mod clock;
pub mod mailer;
pub mod memory_store;

pub use clock::{ManualClock, OffsetClock, SystemClock};
pub use mailer::{ConfiguredMailer, FileMailer, HttpMailer, LogMailer, MemoryMailer};
pub use memory_store::{MemoryStore, Snapshot};
