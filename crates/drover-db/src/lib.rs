//! Durable state for drover: tasks, their transition log, the runner
//! registry mirror, the execution log, health history and adaptation
//! entries, stored in SQLite through `sqlx`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
