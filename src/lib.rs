pub mod aggregate;
pub mod attempt;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod error;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod tracker;
