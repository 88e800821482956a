pub mod agent;
pub mod classifier;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod health;
pub mod inference;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
