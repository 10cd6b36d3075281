pub mod config;
pub mod domain_utils;
pub mod error;
pub mod input;
pub mod lookup;
pub mod machine;
pub mod output;
pub mod progress;
pub mod proxy;
pub mod record;
pub mod reputation;
pub mod scheduler;
pub mod summary;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use machine::RecordMachine;
pub use record::{Record, Stage, Verdict};
pub use scheduler::BatchScheduler;
pub use summary::RunSummary;
