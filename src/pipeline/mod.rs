//! Ordered handler chain every monitor message flows through.

pub mod handlers;
mod stats;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

pub use stats::{PipelineStats, StatsSnapshot};

use crate::benchmark::BenchmarkInfo;
use crate::config::PrivilegeConfig;
use crate::message::Message;

/// Everything a monitor or handler may need while a benchmark runs.
#[derive(Clone)]
pub struct Context {
    benchmark: Arc<BenchmarkInfo>,
    pipeline: Arc<Pipeline>,
    privilege: Arc<PrivilegeConfig>,
}

impl Context {
    pub fn new(
        benchmark: Arc<BenchmarkInfo>,
        pipeline: Arc<Pipeline>,
        privilege: Arc<PrivilegeConfig>,
    ) -> Self {
        Self {
            benchmark,
            pipeline,
            privilege,
        }
    }

    pub fn benchmark(&self) -> &Arc<BenchmarkInfo> {
        &self.benchmark
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn privilege(&self) -> &PrivilegeConfig {
        &self.privilege
    }

    /// Feed `msg` through this context's pipeline.
    pub async fn send(&self, msg: Message) -> Option<Message> {
        self.pipeline.on_message(self, msg).await
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("benchmark", &self.benchmark.identifier())
            .finish_non_exhaustive()
    }
}

/// A stage of the pipeline.
///
/// Handlers own their state privately; they only talk to each other through
/// the messages they return. The lifecycle hooks run in this order:
/// `on_init`, then any number of `on_message`, then `on_end`, then
/// `on_destroy`.
#[async_trait]
pub trait Handler: Send {
    /// Returns the handler's name for logging.
    fn name(&self) -> &str;

    /// Called once before any message flows.
    async fn on_init(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Process one message. Returning `None` consumes it so that no later
    /// handler sees it.
    async fn on_message(&mut self, ctx: &Context, msg: Message) -> Result<Option<Message>>;

    /// Called once after monitoring finished, before teardown.
    async fn on_end(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Called during final teardown.
    async fn on_destroy(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Init,
    End,
    Destroy,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Init => "on_init",
            Self::End => "on_end",
            Self::Destroy => "on_destroy",
        }
    }
}

/// Ordered chain of handlers. Insertion order is processing order.
///
/// Delivery is serialised: one message at a time walks the whole chain.
pub struct Pipeline {
    handlers: Mutex<Vec<Box<dyn Handler>>>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        Self {
            handlers: Mutex::new(handlers),
            stats: PipelineStats::new(),
        }
    }

    /// A pipeline that delivers every message unchanged.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub async fn add_handler(&self, handler: Box<dyn Handler>) {
        self.handlers.lock().await.push(handler);
    }

    pub async fn len(&self) -> usize {
        self.handlers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.lock().await.is_empty()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Feed `msg` through every handler in order.
    ///
    /// Returns what left the last handler, or `None` if a handler consumed
    /// the message or failed on it. A failing handler only aborts this
    /// message.
    pub async fn on_message(&self, ctx: &Context, msg: Message) -> Option<Message> {
        let mut handlers = self.handlers.lock().await;
        let mut current = msg;

        for handler in handlers.iter_mut() {
            match handler.on_message(ctx, current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    trace!(handler = handler.name(), "message consumed");
                    self.stats.record_consumed();
                    return None;
                }
                Err(e) => {
                    warn!(
                        benchmark = %ctx.benchmark().identifier(),
                        handler = handler.name(),
                        error = %e,
                        "handler failed, message dropped"
                    );
                    self.stats.record_failed();
                    return None;
                }
            }
        }

        self.stats.record_delivered();
        Some(current)
    }

    pub async fn on_init(&self, ctx: &Context) -> Result<()> {
        self.run_phase(ctx, Phase::Init).await
    }

    pub async fn on_end(&self, ctx: &Context) -> Result<()> {
        self.run_phase(ctx, Phase::End).await
    }

    pub async fn on_destroy(&self, ctx: &Context) -> Result<()> {
        self.run_phase(ctx, Phase::Destroy).await
    }

    /// Run a lifecycle hook on every handler, even after failures, and
    /// return the first error.
    async fn run_phase(&self, ctx: &Context, phase: Phase) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        let mut first_err = None;

        for handler in handlers.iter_mut() {
            let result = match phase {
                Phase::Init => handler.on_init(ctx).await,
                Phase::End => handler.on_end(ctx).await,
                Phase::Destroy => handler.on_destroy(ctx).await,
            };

            match result {
                Ok(()) => debug!(handler = handler.name(), phase = phase.as_str(), "handler hook done"),
                Err(e) => {
                    warn!(
                        handler = handler.name(),
                        phase = phase.as_str(),
                        error = %e,
                        "handler hook failed"
                    );
                    if first_err.is_none() {
                        first_err = Some(e.context(format!("{} {}", handler.name(), phase.as_str())));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::empty()
    }
}
