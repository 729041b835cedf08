use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Monitor, MonitorKind};
use crate::config::{MonitorConfig, ResCtrlConfig};
use crate::message::{Message, Payload, Record, Source, Value};
use crate::pipeline::Context;

/// Raw counters of one L3 monitoring domain (one per socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketCounters {
    llc_occupancy: u64,
    mbm_local_bytes: u64,
    mbm_total_bytes: u64,
}

async fn read_counter(path: &Path) -> Result<u64> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    data.trim()
        .parse()
        .with_context(|| format!("parsing {} value {:?}", path.display(), data.trim()))
}

/// Read every `mon_data/mon_L3_*` domain of a monitoring group, ordered by
/// socket.
async fn read_sockets(group_dir: &Path) -> Result<Vec<SocketCounters>> {
    let mon_data = group_dir.join("mon_data");
    let mut entries = tokio::fs::read_dir(&mon_data)
        .await
        .with_context(|| format!("reading {}", mon_data.display()))?;

    let mut domains = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with("mon_L3_") {
            domains.push(entry.path());
        }
    }
    domains.sort();

    let mut sockets = Vec::with_capacity(domains.len());
    for dir in domains {
        sockets.push(SocketCounters {
            llc_occupancy: read_counter(&dir.join("llc_occupancy")).await?,
            mbm_local_bytes: read_counter(&dir.join("mbm_local_bytes")).await?,
            mbm_total_bytes: read_counter(&dir.join("mbm_total_bytes")).await?,
        });
    }

    Ok(sockets)
}

fn to_int(v: u64) -> Value {
    Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
}

/// One record per socket: occupancy as read, bandwidth counters as the
/// difference to the previous read.
fn socket_records(prev: &[SocketCounters], cur: &[SocketCounters]) -> Vec<Record> {
    prev.iter()
        .zip(cur)
        .map(|(p, c)| {
            let mut record = Record::with_capacity(3);
            record.insert("llc_occupancy", to_int(c.llc_occupancy));
            record.insert(
                "local_mem",
                to_int(c.mbm_local_bytes.saturating_sub(p.mbm_local_bytes)),
            );
            record.insert(
                "total_mem",
                to_int(c.mbm_total_bytes.saturating_sub(p.mbm_total_bytes)),
            );
            record
        })
        .collect()
}

/// Samples cache occupancy and memory bandwidth from a resctrl monitoring
/// group.
pub struct ResCtrlMonitor {
    cfg: ResCtrlConfig,
    cancel: CancellationToken,
}

impl ResCtrlMonitor {
    pub fn new(cfg: ResCtrlConfig) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Monitoring group directory. Defaults to the benchmark identifier.
    fn group_dir(&self, ctx: &Context) -> PathBuf {
        if self.cfg.group.is_empty() {
            self.cfg.root.join(ctx.benchmark().identifier())
        } else {
            self.cfg.root.join(&self.cfg.group)
        }
    }
}

#[async_trait]
impl Monitor for ResCtrlMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::ResCtrl
    }

    fn config(&self) -> MonitorConfig {
        MonitorConfig::ResCtrl(self.cfg.clone())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(&self, ctx: Context) -> Result<()> {
        let group_dir = self.group_dir(&ctx);
        info!(group = %group_dir.display(), "resctrl sampling started");
        if !tokio::fs::try_exists(&group_dir).await.unwrap_or(false) {
            warn!(group = %group_dir.display(), "resctrl group does not exist, no samples will be taken");
        }

        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prev: Option<Vec<SocketCounters>> = None;
        let mut failures = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let cur = match read_sockets(&group_dir).await {
                Ok(cur) => cur,
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!(error = %e, "resctrl read failed, iteration ignored");
                    } else {
                        debug!(error = %e, failures, "resctrl read failed, iteration ignored");
                    }
                    continue;
                }
            };

            // First read, or the domain layout changed: take a new baseline.
            let Some(base) = prev.replace(cur.clone()) else {
                continue;
            };
            if base.len() != cur.len() || cur.is_empty() {
                continue;
            }

            let msg = Message::per_bench(
                Source::Monitor(MonitorKind::ResCtrl),
                Payload::PerSocket(socket_records(&base, &cur)),
                ctx.benchmark(),
            );
            ctx.send(msg).await;
        }
    }
}
