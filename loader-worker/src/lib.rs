pub mod config;
pub mod error;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod reconciler;
pub mod submitter;
pub mod tracker;
