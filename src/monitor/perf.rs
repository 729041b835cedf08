use std::io;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{Monitor, MonitorKind};
use crate::config::{MonitorConfig, PerfConfig};
use crate::message::{Message, Payload, Record, Source, Value};
use crate::pipeline::Context;

/// Intervals below this many milliseconds trigger the warm-up workaround on
/// old perf releases.
const WARMUP_INTERVAL_MS: u64 = 100;

/// First perf release that no longer prints a bogus leading line for short
/// intervals.
const WARMUP_FIXED_VERSION: (u32, u32) = (4, 17);

/// A malformed `perf stat -x,` line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("missing value field in {line:?}")]
    MissingField { line: String },

    #[error("unparsable value {value:?}")]
    InvalidValue { value: String },

    #[error("line is not valid UTF-8: {line:?}")]
    InvalidEncoding { line: String },
}

/// Reads `perf stat -x, -I` output one iteration at a time.
///
/// An iteration is one line per requested event, in request order.
pub struct PerfReader<R> {
    reader: R,
    buf: Vec<u8>,
    names: Vec<String>,
}

impl<R: AsyncBufRead + Unpin> PerfReader<R> {
    pub fn new(reader: R, names: Vec<String>) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
            names,
        }
    }

    /// Read one line without its terminator. `Ok(None)` at end of stream.
    async fn next_line(&mut self) -> io::Result<Option<Result<String, SampleError>>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        Ok(Some(match std::str::from_utf8(&self.buf) {
            Ok(line) => Ok(line.to_string()),
            Err(_) => Err(SampleError::InvalidEncoding {
                line: String::from_utf8_lossy(&self.buf).into_owned(),
            }),
        }))
    }

    /// Discard one line. Returns false at end of stream.
    pub async fn skip_line(&mut self) -> io::Result<bool> {
        Ok(self.next_line().await?.is_some())
    }

    /// Read the next iteration.
    ///
    /// `Ok(None)` means the stream ended. A malformed iteration is returned
    /// as the inner error after all of its lines were consumed, so the next
    /// call stays aligned.
    pub async fn next_sample(&mut self) -> io::Result<Option<Result<Record, SampleError>>> {
        let mut raw = Vec::with_capacity(self.names.len());
        let mut undecodable = None;

        for _ in 0..self.names.len() {
            match self.next_line().await? {
                Some(Ok(line)) => raw.push(line),
                Some(Err(e)) => {
                    undecodable.get_or_insert(e);
                }
                None => return Ok(None),
            }
        }

        if let Some(e) = undecodable {
            return Ok(Some(Err(e)));
        }

        Ok(Some(parse_sample(&raw, &self.names)))
    }
}

/// Build a record keyed by `names` from one line per event.
fn parse_sample(lines: &[String], names: &[String]) -> Result<Record, SampleError> {
    let mut record = Record::with_capacity(names.len());

    for (line, name) in lines.iter().zip(names) {
        let field = line
            .split(',')
            .nth(1)
            .ok_or_else(|| SampleError::MissingField { line: line.clone() })?;
        record.insert(name.as_str(), parse_value(field.trim())?);
    }

    Ok(record)
}

fn parse_value(field: &str) -> Result<Value, SampleError> {
    let invalid = || SampleError::InvalidValue {
        value: field.to_string(),
    };

    if field.is_empty() {
        return Err(invalid());
    }

    if field.bytes().all(|b| b.is_ascii_digit()) {
        return field.parse::<i64>().map(Value::Int).map_err(|_| invalid());
    }

    match field.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Value::Float(v)),
        _ => Err(invalid()),
    }
}

/// Extract `(major, minor)` from `perf --version` output such as
/// `"perf version 5.15.85"`.
pub fn parse_perf_version(output: &str) -> Option<(u32, u32)> {
    let version = output.split_whitespace().nth(2)?;
    let mut parts = version.split('.');

    let major = parts.next()?.parse().ok()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    Some((major, minor.parse().ok()?))
}

async fn perf_version(binary: &Path) -> Option<(u32, u32)> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    parse_perf_version(&String::from_utf8_lossy(&output.stdout))
}

/// Samples hardware counters of the benchmark process via `perf stat`.
pub struct PerfMonitor {
    cfg: PerfConfig,
    cancel: CancellationToken,
}

impl PerfMonitor {
    pub fn new(cfg: PerfConfig) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    fn spawn(&self, pid: u32) -> Result<Child> {
        Command::new(&self.cfg.binary)
            .arg("stat")
            .arg("-e")
            .arg(self.cfg.event_str())
            .arg("-p")
            .arg(pid.to_string())
            .arg("-x")
            .arg(",")
            .arg("-I")
            .arg(self.cfg.interval_ms().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} stat", self.cfg.binary.display()))
    }

    async fn needs_warmup_skip(&self) -> bool {
        if self.cfg.interval_ms() >= WARMUP_INTERVAL_MS {
            return false;
        }

        match perf_version(&self.cfg.binary).await {
            Some(version) => version < WARMUP_FIXED_VERSION,
            None => {
                debug!("could not determine perf version");
                false
            }
        }
    }
}

/// Kill `child` if it is still running.
async fn terminate(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!(%status, "perf already exited"),
        Ok(None) => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "perf already gone");
            }
        }
        Err(e) => debug!(error = %e, "perf status unavailable"),
    }
}

#[async_trait]
impl Monitor for PerfMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Perf
    }

    fn config(&self) -> MonitorConfig {
        MonitorConfig::Perf(self.cfg.clone())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(&self, ctx: Context) -> Result<()> {
        let bench = ctx.benchmark();
        let pid = bench
            .pid()
            .ok_or_else(|| anyhow!("benchmark {} has no process", bench.identifier()))?;

        let mut child = self.spawn(pid)?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("perf stderr not captured"))?;

        let names = self.cfg.event_names().map(str::to_string).collect();
        let mut reader = PerfReader::new(BufReader::new(stderr), names);

        if self.needs_warmup_skip().await {
            debug!("discarding perf warm-up line");
            reader.skip_line().await?;
        }

        info!(pid, events = %self.cfg.event_str(), "perf sampling started");

        let result = self.sample_loop(&ctx, &mut reader).await;
        terminate(&mut child).await;
        result
    }
}

impl PerfMonitor {
    /// Emit every well-formed iteration until stopped or until perf closes
    /// its output. Iterations already buffered when perf exits are still
    /// delivered.
    async fn sample_loop<R>(&self, ctx: &Context, reader: &mut PerfReader<R>) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut ignored = 0u64;

        while !self.is_stopped() {
            let record = match reader.next_sample().await.context("reading perf output")? {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    ignored += 1;
                    debug!(error = %e, "malformed perf sample, iteration ignored");
                    continue;
                }
            };

            if self.is_stopped() {
                break;
            }

            trace!(fields = record.len(), "perf sample");
            let msg = Message::per_bench(
                Source::Monitor(MonitorKind::Perf),
                Payload::Record(record),
                ctx.benchmark(),
            );
            ctx.send(msg).await;
        }

        if ignored > 0 {
            info!(ignored, "perf iterations ignored");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_reader_well_formed() {
        let output: &[u8] = b"     1.000195,123456,,instructions,1000412,100.00,,\n\
                              1.000195,98765,,cycles,1000412,100.00,,\n\
                              1.000195,12.5,,task-clock,1000412,100.00,,\n\
                              2.000391,223456,,instructions,1000401,100.00,,\n\
                              2.000391,198765,,cycles,1000401,100.00,,\n\
                              2.000391,13.25,,task-clock,1000401,100.00,,\n";
        let mut reader = PerfReader::new(output, names(&["inst", "cyc", "clock"]));

        let first = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect("well formed");
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            vec!["inst", "cyc", "clock"]
        );
        assert_eq!(first.get("inst"), Some(&Value::Int(123456)));
        assert_eq!(first.get("clock"), Some(&Value::Float(12.5)));

        let second = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect("well formed");
        assert_eq!(second.get("cyc"), Some(&Value::Int(198765)));

        assert!(reader.next_sample().await.expect("io").is_none());
    }

    #[tokio::test]
    async fn test_reader_malformed_iterations_are_skipped() {
        let output: &[u8] = b"1.0,<not counted>,,instructions,0,100.00,,\n\
                              1.0,10,,cycles,0,100.00,,\n\
                              2.0\n\
                              2.0,20,,cycles,0,100.00,,\n\
                              3.0,30,,instructions,0,100.00,,\n\
                              3.0,31,,cycles,0,100.00,,\n";
        let mut reader = PerfReader::new(output, names(&["instructions", "cycles"]));

        let err = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect_err("should fail");
        assert_eq!(
            err,
            SampleError::InvalidValue {
                value: "<not counted>".to_string()
            }
        );

        let err = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect_err("should fail");
        assert!(matches!(err, SampleError::MissingField { .. }));

        let ok = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect("well formed");
        assert_eq!(ok.get("instructions"), Some(&Value::Int(30)));
    }

    #[tokio::test]
    async fn test_reader_undecodable_line_spoils_only_its_iteration() {
        let output: &[u8] = b"1.0,\xff\xfe,,instructions,0,100.00,,\n\
                              1.0,10,,cycles,0,100.00,,\n\
                              2.0,20,,instructions,0,100.00,,\r\n\
                              2.0,21,,cycles,0,100.00,,";
        let mut reader = PerfReader::new(output, names(&["instructions", "cycles"]));

        let err = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect_err("should fail");
        assert!(matches!(err, SampleError::InvalidEncoding { .. }));

        let ok = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect("well formed");
        assert_eq!(ok.get("instructions"), Some(&Value::Int(20)));
        assert_eq!(ok.get("cycles"), Some(&Value::Int(21)));

        assert!(reader.next_sample().await.expect("io").is_none());
    }

    #[tokio::test]
    async fn test_reader_partial_iteration_is_eof() {
        let output: &[u8] = b"1.0,10,,instructions,0,100.00,,\n";
        let mut reader = PerfReader::new(output, names(&["instructions", "cycles"]));
        assert!(reader.next_sample().await.expect("io").is_none());
    }

    #[tokio::test]
    async fn test_reader_skip_line() {
        let output: &[u8] = b"garbage\n1.0,5,,cycles,0,100.00,,\n";
        let mut reader = PerfReader::new(output, names(&["cycles"]));
        assert!(reader.skip_line().await.expect("io"));

        let sample = reader
            .next_sample()
            .await
            .expect("io")
            .expect("sample")
            .expect("well formed");
        assert_eq!(sample.get("cycles"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), Ok(Value::Int(42)));
        assert_eq!(parse_value("0.5"), Ok(Value::Float(0.5)));
        assert_eq!(parse_value("1e3"), Ok(Value::Float(1000.0)));
        assert!(parse_value("").is_err());
        assert!(parse_value("<not supported>").is_err());
        assert!(parse_value("NaN").is_err());
    }

    #[test]
    fn test_parse_perf_version() {
        assert_eq!(parse_perf_version("perf version 5.15.85\n"), Some((5, 15)));
        assert_eq!(
            parse_perf_version("perf version 4.9.g3f4e1a"),
            Some((4, 9))
        );
        assert_eq!(parse_perf_version("perf version 4.17"), Some((4, 17)));
        assert_eq!(parse_perf_version("perf"), None);
        assert_eq!(parse_perf_version("perf version x.y"), None);
    }

    #[test]
    fn test_warmup_cutoff() {
        assert!((4, 9) < WARMUP_FIXED_VERSION);
        assert!((4, 16) < WARMUP_FIXED_VERSION);
        assert!((4, 17) >= WARMUP_FIXED_VERSION);
        assert!((5, 4) >= WARMUP_FIXED_VERSION);
    }
}
