pub mod job;
pub mod journal;
pub mod queue;

pub use job::{Job, JobOutcome, JobState};
pub use journal::{FileJournal, Journal, JournalRecord, MemoryJournal};
pub use queue::{JobQueue, NackOutcome, QueueStats};
