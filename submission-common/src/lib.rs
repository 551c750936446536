pub mod envelope;
pub mod metrics;
pub mod retry;
pub mod token;
