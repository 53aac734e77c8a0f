//! Mail gate: watches an inbox and answers each message with a pass or fail reply.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod worker;
