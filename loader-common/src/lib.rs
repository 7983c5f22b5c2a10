pub mod batch;
pub mod budget;
pub mod mapping;
pub mod metrics;
pub mod store;
