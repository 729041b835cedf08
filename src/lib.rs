//! Benchmark execution agent: launches workloads inside cpuset groups,
//! samples hardware counters while they run and routes the samples through
//! a handler pipeline.

pub mod benchmark;
pub mod cgroup;
pub mod config;
pub mod driver;
pub mod message;
pub mod monitor;
pub mod pipeline;
pub mod privilege;
pub mod sink;
