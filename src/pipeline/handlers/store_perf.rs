use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

use super::csv::{self, CsvFile};
use crate::message::Message;
use crate::monitor::MonitorKind;
use crate::pipeline::{Context, Handler};

/// Appends perf samples to `<workspace>/monitored/perf/<identifier>.csv`.
#[derive(Debug, Default)]
pub struct StorePerf {
    dir: Option<PathBuf>,
    columns: Vec<String>,
    file: Option<CsvFile>,
}

impl StorePerf {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Handler for StorePerf {
    fn name(&self) -> &str {
        "store_perf"
    }

    async fn on_init(&mut self, ctx: &Context) -> Result<()> {
        let dir = ctx.benchmark().workspace().join("monitored").join("perf");
        csv::create_dir(&dir, &ctx.privilege().result)?;
        self.dir = Some(dir);
        Ok(())
    }

    async fn on_message(&mut self, ctx: &Context, msg: Message) -> Result<Option<Message>> {
        if msg.monitor_kind() != Some(MonitorKind::Perf) {
            return Ok(Some(msg));
        }

        let record = msg
            .payload()
            .as_record()
            .ok_or_else(|| anyhow!("perf message without record payload"))?;

        if self.file.is_none() {
            let dir = self
                .dir
                .as_ref()
                .ok_or_else(|| anyhow!("store_perf used before on_init"))?;
            let path = dir.join(format!("{}.csv", ctx.benchmark().identifier()));
            let mut file = CsvFile::create(path, &ctx.privilege().result)?;

            let columns: Vec<String> = record.keys().map(str::to_string).collect();
            csv::write_batch(std::slice::from_mut(&mut file), vec![csv::header(&columns)]).await?;

            self.columns = columns;
            self.file = Some(file);
        }

        let line = csv::row(record, &self.columns)?;
        if let Some(file) = self.file.as_mut() {
            csv::write_batch(std::slice::from_mut(file), vec![line]).await?;
        }

        Ok(Some(msg))
    }

    async fn on_end(&mut self, _ctx: &Context) -> Result<()> {
        if let Some(file) = self.file.take() {
            debug!(path = %file.path().display(), "closing perf output");
        }
        Ok(())
    }

    async fn on_destroy(&mut self, _ctx: &Context) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}
