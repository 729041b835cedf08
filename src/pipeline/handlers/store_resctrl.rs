use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::csv::{self, CsvFile};
use crate::message::Message;
use crate::monitor::MonitorKind;
use crate::pipeline::{Context, Handler};

/// Appends resctrl samples to one CSV file per socket:
/// `<workspace>/monitored/resctrl/<socket>_<identifier>.csv`.
///
/// The column order is fixed by the first message's socket 0 record.
/// Messages from other sources pass through untouched.
#[derive(Debug, Default)]
pub struct StoreResCtrl {
    dir: Option<PathBuf>,
    columns: Vec<String>,
    files: Vec<CsvFile>,
}

impl StoreResCtrl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open one file per socket and write the header to each.
    async fn open_files(&mut self, ctx: &Context, sockets: usize, columns: Vec<String>) -> Result<()> {
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| anyhow!("store_resctrl used before on_init"))?;
        let owner = &ctx.privilege().result;
        let identifier = ctx.benchmark().identifier();

        let mut files = Vec::with_capacity(sockets);
        for socket in 0..sockets {
            files.push(CsvFile::create(
                dir.join(format!("{socket}_{identifier}.csv")),
                owner,
            )?);
        }

        let header = csv::header(&columns);
        csv::write_batch(&mut files, vec![header; sockets]).await?;

        info!(
            sockets,
            columns = %columns.join(","),
            dir = %dir.display(),
            "resctrl output opened"
        );

        self.files = files;
        self.columns = columns;
        Ok(())
    }
}

#[async_trait]
impl Handler for StoreResCtrl {
    fn name(&self) -> &str {
        "store_resctrl"
    }

    async fn on_init(&mut self, ctx: &Context) -> Result<()> {
        let dir = ctx.benchmark().workspace().join("monitored").join("resctrl");
        csv::create_dir(&dir, &ctx.privilege().result)?;
        self.dir = Some(dir);
        Ok(())
    }

    async fn on_message(&mut self, ctx: &Context, msg: Message) -> Result<Option<Message>> {
        if msg.monitor_kind() != Some(MonitorKind::ResCtrl) {
            return Ok(Some(msg));
        }

        let sockets = msg
            .payload()
            .as_per_socket()
            .ok_or_else(|| anyhow!("resctrl message without per-socket payload"))?;

        if self.files.is_empty() {
            let first = sockets
                .first()
                .ok_or_else(|| anyhow!("resctrl message without sockets"))?;
            let columns = first.keys().map(str::to_string).collect();
            self.open_files(ctx, sockets.len(), columns).await?;
        }

        if sockets.len() != self.files.len() {
            bail!(
                "resctrl socket count changed from {} to {}",
                self.files.len(),
                sockets.len()
            );
        }

        let rows = sockets
            .iter()
            .map(|record| csv::row(record, &self.columns))
            .collect::<Result<Vec<_>>>()?;
        csv::write_batch(&mut self.files, rows).await?;

        Ok(Some(msg))
    }

    async fn on_end(&mut self, _ctx: &Context) -> Result<()> {
        for file in self.files.drain(..) {
            debug!(path = %file.path().display(), "closing resctrl output");
        }
        Ok(())
    }

    async fn on_destroy(&mut self, _ctx: &Context) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}
