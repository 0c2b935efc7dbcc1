//! Runtime glue that wires configuration, telemetry, the worker loops, the
//! control-plane routines, and supervisor orchestration.

pub mod config;
pub mod janitor;
pub mod seeder;
pub mod supervisor;
pub mod telemetry;
pub mod worker;
