//! Query modules, one per table (or table pair).

pub mod adaptations;
pub mod execution_log;
pub mod health;
pub mod runners;
pub mod tasks;
