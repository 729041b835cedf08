//! Counter sources sampled for the lifetime of a benchmark.
//!
//! A monitor runs as its own tokio task and pushes one message per sampling
//! interval into the benchmark's pipeline. Stopping is cooperative: `stop()`
//! cancels a token that the sampling loop checks once per iteration, so a
//! monitor blocked on subprocess output notices it only when the next sample
//! arrives. The benchmark bounds that latency with a shutdown timeout.

mod idle;
mod perf;
mod rdtsc;
mod resctrl;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

pub use idle::IdleMonitor;
pub use perf::{parse_perf_version, PerfMonitor, PerfReader, SampleError};
pub use rdtsc::{RdtscMonitor, WALL_CYCLE};
pub use resctrl::ResCtrlMonitor;

use crate::config::MonitorConfig;
use crate::pipeline::Context;

/// Closed set of monitor variants. Carried on every message a monitor emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MonitorKind {
    Perf,
    CycleCounter,
    ResCtrl,
    Idle,
}

impl MonitorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Perf => "perf",
            Self::CycleCounter => "rdtsc",
            Self::ResCtrl => "resctrl",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A counter source bound to one benchmark.
#[async_trait]
pub trait Monitor: Send + Sync {
    fn kind(&self) -> MonitorKind;

    /// Immutable sampling configuration.
    fn config(&self) -> MonitorConfig;

    /// Request the sampling loop to finish after its current iteration.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Sampling loop. Returns when stopped or when the source is exhausted.
    async fn run(&self, ctx: Context) -> Result<()>;
}

/// Spawn `monitor`'s sampling loop inside the benchmark's span.
pub fn start(monitor: Arc<dyn Monitor>, ctx: Context) -> JoinHandle<Result<()>> {
    let span = ctx.benchmark().span().clone();

    tokio::spawn(
        async move {
            let kind = monitor.kind();
            debug!(monitor = %kind, "monitor started");

            let result = monitor.run(ctx).await;
            match &result {
                Ok(()) => debug!(monitor = %kind, "monitor finished"),
                Err(e) => warn!(monitor = %kind, error = %e, "monitor failed"),
            }

            result
        }
        .instrument(span),
    )
}

/// Build the monitors enabled in `cfg`.
pub fn from_config(cfg: &crate::config::Config) -> Vec<Arc<dyn Monitor>> {
    let mut monitors: Vec<Arc<dyn Monitor>> = Vec::with_capacity(3);

    if cfg.perf.enabled {
        monitors.push(Arc::new(PerfMonitor::new(cfg.perf.clone())));
    }
    if cfg.rdtsc.enabled {
        monitors.push(Arc::new(RdtscMonitor::new(cfg.rdtsc.clone())));
    }
    if cfg.resctrl.enabled {
        monitors.push(Arc::new(ResCtrlMonitor::new(cfg.resctrl.clone())));
    }

    monitors
}
