use anyhow::Result;
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Monitor, MonitorKind};
use crate::config::{MonitorConfig, RdtscConfig};
use crate::message::{Message, Payload, Record, Source, Value};
use crate::pipeline::Context;

/// Record key for elapsed cycles.
pub const WALL_CYCLE: &str = "wall_cycle";

/// Read the CPU time-stamp counter.
#[cfg(target_arch = "x86_64")]
fn read_tsc() -> u64 {
    // SAFETY: rdtsc has no preconditions on x86_64.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Monotonic nanoseconds where no time-stamp counter is available.
#[cfg(not(target_arch = "x86_64"))]
fn read_tsc() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Reports elapsed TSC cycles per interval as `wall_cycle`.
pub struct RdtscMonitor {
    cfg: RdtscConfig,
    cancel: CancellationToken,
}

impl RdtscMonitor {
    pub fn new(cfg: RdtscConfig) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Monitor for RdtscMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::CycleCounter
    }

    fn config(&self) -> MonitorConfig {
        MonitorConfig::Rdtsc(self.cfg.clone())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(&self, ctx: Context) -> Result<()> {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately and only sets the baseline.
        ticker.tick().await;
        let mut prev = read_tsc();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let now = read_tsc();
            let elapsed = i64::try_from(now.wrapping_sub(prev)).unwrap_or(i64::MAX);
            prev = now;

            trace!(elapsed, "rdtsc sample");
            let mut record = Record::with_capacity(1);
            record.insert(WALL_CYCLE, Value::Int(elapsed));

            let msg = Message::per_bench(
                Source::Monitor(MonitorKind::CycleCounter),
                Payload::Record(record),
                ctx.benchmark(),
            );
            ctx.send(msg).await;
        }
    }
}
