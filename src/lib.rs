//! Fixed-window substrate sampler for local LLM inference runs.
//!
//! A run samples kernel counters, system and process snapshots on fixed
//! schedules while prompts are dispatched to an inference server, and leaves
//! a directory of aligned, timestamped files behind.

pub mod clock;
pub mod config;
pub mod counter;
pub mod dispatch;
pub mod export;
pub mod pid;
pub mod procfs;
pub mod runner;
pub mod sample;
pub mod sampler;
pub mod snapshot;
