pub mod canonical;
pub mod config;
pub mod document;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod preprocessing;
pub mod submission;
pub mod topology;
