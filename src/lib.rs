pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod output;
pub mod policy;
pub mod release;
pub mod selector;
pub mod state;
pub mod variables;
pub mod worker;
