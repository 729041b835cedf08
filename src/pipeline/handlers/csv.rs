//! Offset-tracked CSV files shared by the store handlers.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::try_join_all;

use crate::config::Privilege;
use crate::message::Record;
use crate::privilege::with_privilege;

/// An output file written at explicit offsets.
///
/// The offset only moves once a write is confirmed, so a failed batch never
/// leaves a gap that later rows would be written after.
#[derive(Debug)]
pub(crate) struct CsvFile {
    path: PathBuf,
    file: Arc<File>,
    offset: u64,
}

impl CsvFile {
    /// Create (or truncate) `path` as `owner`.
    pub(crate) fn create(path: PathBuf, owner: &Privilege) -> Result<Self> {
        let file = with_privilege(owner, || {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
        })
        .with_context(|| format!("creating {}", path.display()))?;

        Ok(Self {
            path,
            file: Arc::new(file),
            offset: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }
}

/// Create `dir` and its parents as `owner`.
pub(crate) fn create_dir(dir: &Path, owner: &Privilege) -> Result<()> {
    with_privilege(owner, || std::fs::create_dir_all(dir))
        .with_context(|| format!("creating {}", dir.display()))
}

/// Header line for `columns`.
pub(crate) fn header(columns: &[String]) -> String {
    let mut line = columns.join(",");
    line.push('\n');
    line
}

/// Project `record` onto `columns`. Every column must be present.
pub(crate) fn row(record: &Record, columns: &[String]) -> Result<String> {
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = record
            .get(column)
            .ok_or_else(|| anyhow!("record has no value for column {column}"))?;
        values.push(value.to_string());
    }

    let mut line = values.join(",");
    line.push('\n');
    Ok(line)
}

/// Write one line to each file as a single batch on the blocking pool.
///
/// Offsets advance only after every write of the batch completed.
pub(crate) async fn write_batch(files: &mut [CsvFile], lines: Vec<String>) -> Result<()> {
    if files.len() != lines.len() {
        return Err(anyhow!(
            "batch has {} lines for {} files",
            lines.len(),
            files.len()
        ));
    }

    let writes = files.iter().zip(lines).map(|(f, line)| {
        let file = Arc::clone(&f.file);
        let offset = f.offset;
        let path = f.path.clone();

        async move {
            let len = line.len() as u64;
            tokio::task::spawn_blocking(move || file.write_all_at(line.as_bytes(), offset))
                .await
                .context("write task panicked")?
                .with_context(|| format!("writing {} at {offset}", path.display()))?;
            Ok::<u64, anyhow::Error>(len)
        }
    });

    let written = try_join_all(writes).await?;

    for (file, len) in files.iter_mut().zip(written) {
        file.offset += len;
    }

    Ok(())
}
