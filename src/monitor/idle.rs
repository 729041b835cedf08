use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Monitor, MonitorKind};
use crate::config::MonitorConfig;
use crate::pipeline::Context;

/// Emits nothing. Keeps a benchmark without counter sources in its
/// monitoring phase until stopped.
#[derive(Debug, Default)]
pub struct IdleMonitor {
    cancel: CancellationToken,
}

impl IdleMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Monitor for IdleMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Idle
    }

    fn config(&self) -> MonitorConfig {
        MonitorConfig::Idle
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(&self, _ctx: Context) -> Result<()> {
        self.cancel.cancelled().await;
        Ok(())
    }
}
