//! Infrastructure layer: job/run model, durable stores, run orchestration,
//! remote clients and the domain batch workers.

pub mod checkpoint;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod media;
pub mod workers;

mod integration_tests;

pub use error::StoreError;
