pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod hosts;
pub mod node;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
