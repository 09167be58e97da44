//! Preprocessing stage of a multi-service inference pipeline.
//!
//! Jobs arrive as ids on a Redis list, their descriptions live in a Redis
//! hash per job. Image jobs are fetched, resized to 224x224 and flattened
//! into normalized RGB intensities before the id is handed to the inference
//! stage's queue.

pub mod broker;
pub mod config;
pub mod error;
pub mod intake;
pub mod job;
pub mod process;
pub mod server;
pub mod tensor;
pub mod worker;
