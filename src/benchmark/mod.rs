//! A benchmark owns one workload together with its resource group, its
//! monitors and its pipeline, and drives them through a single run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::cgroup::{parse_core_range, CgroupCpuset, PrivilegedFs, ResCtrlGroup};
use crate::config::{BenchConfig, Config, EngineKind, PrivilegeConfig};
use crate::driver::{BenchDriver, DriverRegistry, LaunchEngine};
use crate::monitor::{self, IdleMonitor, Monitor, MonitorKind};
use crate::pipeline::handlers::{Merger, QueueForwarder, StorePerf, StoreResCtrl};
use crate::pipeline::{Context, Handler, Pipeline};
use crate::sink::RecordSink;

/// Identity and live state of a benchmark, shared with its monitors and
/// handlers.
#[derive(Debug)]
pub struct BenchmarkInfo {
    identifier: String,
    name: String,
    workspace: PathBuf,
    pid: AtomicU32,
    running: AtomicBool,
    span: Span,
}

impl BenchmarkInfo {
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        let identifier = identifier.into();
        let span = info_span!("benchmark", id = %identifier);

        Self {
            identifier,
            name: name.into(),
            workspace: workspace.into(),
            pid: AtomicU32::new(0),
            running: AtomicBool::new(false),
            span,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Workload name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory of everything this benchmark writes.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Pid of the monitored process, once launched.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// `<name>_<pid>` while the workload runs, the identifier otherwise.
    pub fn group_name(&self) -> String {
        match self.pid() {
            Some(pid) if self.is_running() => format!("{}_{}", self.name, pid),
            _ => self.identifier.clone(),
        }
    }

    /// Span every log line of this benchmark is recorded in.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// A cpuset group the workload is confined to.
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    manager: CgroupCpuset,
    name: String,
}

impl ResourceGroup {
    pub fn new(manager: CgroupCpuset, name: impl Into<String>) -> Self {
        Self {
            manager,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &CgroupCpuset {
        &self.manager
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workload exited on its own.
    Exited(ExitStatus),
    /// The run was cancelled and the workload killed.
    Cancelled,
}

/// Assembles a [`Benchmark`].
pub struct BenchmarkBuilder {
    info: BenchmarkInfo,
    driver: Box<dyn BenchDriver>,
    monitors: Vec<Arc<dyn Monitor>>,
    handlers: Vec<Box<dyn Handler>>,
    group: Option<ResourceGroup>,
    resctrl: Option<ResCtrlGroup>,
    engine: EngineKind,
    cpus: Option<BTreeSet<u32>>,
    mems: Option<BTreeSet<u32>>,
    privilege: PrivilegeConfig,
    shutdown_timeout: Duration,
}

impl BenchmarkBuilder {
    pub fn new(info: BenchmarkInfo, driver: Box<dyn BenchDriver>) -> Self {
        Self {
            info,
            driver,
            monitors: Vec::new(),
            handlers: Vec::new(),
            group: None,
            resctrl: None,
            engine: EngineKind::Plain,
            cpus: None,
            mems: None,
            privilege: PrivilegeConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Builder for one configured benchmark: driver from `registry`,
    /// monitors and stores per the enabled sources, routable records to
    /// `sink`.
    pub fn from_config(
        cfg: &Config,
        bench: &BenchConfig,
        registry: &DriverRegistry,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let driver = registry.create(bench)?;
        let info = BenchmarkInfo::new(&bench.identifier, &bench.name, &cfg.workspace);

        let mut builder = Self::new(info, driver)
            .engine(bench.engine)
            .privilege(cfg.privilege.clone())
            .shutdown_timeout(cfg.monitor_shutdown_timeout);

        if let Some(cpus) = &bench.cpus {
            builder = builder.cpus(parse_core_range(cpus)?);
        }
        if let Some(mems) = &bench.mems {
            builder = builder.mems(parse_core_range(mems)?);
        }

        if cfg.cgroup.enabled {
            builder = builder.resource_group(ResourceGroup::new(
                CgroupCpuset::from_config(&cfg.cgroup),
                &bench.identifier,
            ));
        }

        // A named resctrl group is managed outside the agent.
        if cfg.resctrl.enabled && cfg.resctrl.group.is_empty() {
            let fs = if cfg.cgroup.use_sudo {
                PrivilegedFs::Sudo
            } else {
                PrivilegedFs::Direct
            };
            builder = builder.resctrl_group(ResCtrlGroup::new(
                &cfg.resctrl.root,
                &cfg.cgroup.proc_root,
                fs,
                &bench.identifier,
            ));
        }

        for m in monitor::from_config(cfg) {
            builder = builder.add_monitor(m);
        }

        // Stores come first: the merger consumes raw samples.
        if cfg.perf.enabled {
            builder = builder.add_handler(Box::new(StorePerf::new()));
        }
        if cfg.resctrl.enabled {
            builder = builder.add_handler(Box::new(StoreResCtrl::new()));
        }
        if cfg.perf.enabled && cfg.rdtsc.enabled && cfg.resctrl.enabled {
            builder = builder.add_handler(Box::new(Merger::new()));
        }
        builder = builder.add_handler(Box::new(QueueForwarder::new(sink)));

        Ok(builder)
    }

    pub fn add_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn add_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn resource_group(mut self, group: ResourceGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Monitoring group created for the run and removed afterwards.
    pub fn resctrl_group(mut self, group: ResCtrlGroup) -> Self {
        self.resctrl = Some(group);
        self
    }

    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn cpus(mut self, cpus: BTreeSet<u32>) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn mems(mut self, mems: BTreeSet<u32>) -> Self {
        self.mems = Some(mems);
        self
    }

    pub fn privilege(mut self, privilege: PrivilegeConfig) -> Self {
        self.privilege = privilege;
        self
    }

    /// How long a stopped monitor may take to finish before it is aborted.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn finalize(mut self) -> Result<Benchmark> {
        if self.monitors.is_empty() {
            self.monitors.push(Arc::new(IdleMonitor::new()));
        }

        let engine = match self.engine {
            EngineKind::Plain => LaunchEngine::Plain,
            EngineKind::NumaCtl => LaunchEngine::NumaCtl {
                cpus: self.cpus.clone(),
                mems: self.mems.clone(),
            },
            EngineKind::Cgroup => match &self.group {
                Some(group) => LaunchEngine::Cgroup {
                    manager: group.manager.clone(),
                    group: group.name.clone(),
                },
                None => bail!(
                    "benchmark {} uses the cgroup engine without a resource group",
                    self.info.identifier()
                ),
            },
        };

        Ok(Benchmark {
            info: Arc::new(self.info),
            driver: self.driver,
            monitors: self.monitors,
            pipeline: Arc::new(Pipeline::new(self.handlers)),
            group: self.group,
            resctrl: self.resctrl,
            engine,
            cpus: self.cpus,
            mems: self.mems,
            privilege: Arc::new(self.privilege),
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// One workload and everything attached to it.
pub struct Benchmark {
    info: Arc<BenchmarkInfo>,
    driver: Box<dyn BenchDriver>,
    monitors: Vec<Arc<dyn Monitor>>,
    pipeline: Arc<Pipeline>,
    group: Option<ResourceGroup>,
    resctrl: Option<ResCtrlGroup>,
    engine: LaunchEngine,
    cpus: Option<BTreeSet<u32>>,
    mems: Option<BTreeSet<u32>>,
    privilege: Arc<PrivilegeConfig>,
    shutdown_timeout: Duration,
}

impl Benchmark {
    pub fn info(&self) -> &Arc<BenchmarkInfo> {
        &self.info
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn monitor_kinds(&self) -> Vec<MonitorKind> {
        self.monitors.iter().map(|m| m.kind()).collect()
    }

    /// Run the workload to completion or until `cancel` fires.
    ///
    /// Setup failures tear down whatever was already set up and are
    /// returned. Once the workload runs, teardown always completes; the
    /// first teardown or monitor error is returned afterwards.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome> {
        let span = self.info.span().clone();
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&self, cancel: CancellationToken) -> Result<RunOutcome> {
        let ctx = Context::new(
            Arc::clone(&self.info),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.privilege),
        );

        if let Err(e) = self.setup_groups().await {
            self.remove_groups().await;
            return Err(e);
        }

        if let Err(e) = self.pipeline.on_init(&ctx).await {
            self.abort_setup(&ctx).await;
            return Err(e.context("initialising pipeline"));
        }

        let mut child = match self
            .engine
            .launch(self.driver.command(), &self.privilege.execute)
        {
            Ok(child) => child,
            Err(e) => {
                self.abort_setup(&ctx).await;
                return Err(e);
            }
        };

        let Some(launched) = child.id() else {
            self.abort_setup(&ctx).await;
            bail!("workload exited before it could be monitored");
        };
        let pid = self.driver.bench_pid(launched);
        self.info.set_pid(pid);
        self.info.set_running(true);

        if let Err(e) = self.attach_threads(pid).await {
            if let Err(kill) = child.kill().await {
                debug!(error = %kill, "workload already gone");
            }
            self.info.set_running(false);
            self.abort_setup(&ctx).await;
            return Err(e);
        }

        let handles: Vec<(MonitorKind, JoinHandle<Result<()>>)> = self
            .monitors
            .iter()
            .map(|m| (m.kind(), monitor::start(Arc::clone(m), ctx.clone())))
            .collect();

        info!(
            pid,
            driver = self.driver.name(),
            engine = self.engine.name(),
            monitors = handles.len(),
            "benchmark started"
        );

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let outcome = match exited {
            Some(status) => status
                .map(RunOutcome::Exited)
                .context("waiting for workload"),
            None => {
                info!("cancelled, killing workload");
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "workload already gone");
                }
                Ok(RunOutcome::Cancelled)
            }
        };
        self.info.set_running(false);

        let monitors = self.stop_monitors(handles).await;
        let end = self.pipeline.on_end(&ctx).await;
        self.remove_groups().await;
        let destroy = self.pipeline.on_destroy(&ctx).await;

        let stats = self.pipeline.stats().snapshot();
        info!(
            delivered = stats.delivered,
            consumed = stats.consumed,
            failed = stats.failed,
            outcome = ?outcome.as_ref().ok(),
            "benchmark finished"
        );

        let outcome = outcome?;
        monitors?;
        end?;
        destroy?;
        Ok(outcome)
    }

    async fn setup_groups(&self) -> Result<()> {
        if let Some(group) = &self.group {
            self.setup_cpuset(group).await?;
        }
        if let Some(resctrl) = &self.resctrl {
            resctrl.create().await?;
        }
        Ok(())
    }

    async fn attach_threads(&self, pid: u32) -> Result<()> {
        if let Some(group) = &self.group {
            group.manager.add_all_threads(&group.name, pid).await?;
        }
        if let Some(resctrl) = &self.resctrl {
            resctrl.add_all_threads(pid).await?;
        }
        Ok(())
    }

    async fn setup_cpuset(&self, group: &ResourceGroup) -> Result<()> {
        let cg = &group.manager;
        let name = group.name.as_str();

        cg.create_group(name).await?;

        match &self.cpus {
            Some(cpus) => cg.assign_cpus(name, cpus).await?,
            None => cg.inherit_setting(name, "cpuset.cpus").await?,
        }
        match &self.mems {
            Some(mems) => cg.assign_mems(name, mems).await?,
            None => cg.inherit_setting(name, "cpuset.mems").await?,
        }

        cg.chown_group(name, &self.privilege.execute).await
    }

    async fn remove_groups(&self) {
        if let Some(resctrl) = &self.resctrl {
            if let Err(e) = resctrl.remove().await {
                warn!(group = %resctrl.name(), error = %e, "failed to remove resctrl group");
            }
        }
        if let Some(group) = &self.group {
            if let Err(e) = group.manager.remove_group(&group.name).await {
                warn!(group = %group.name, error = %e, "failed to remove cpuset group");
            }
        }
    }

    /// Undo a partial setup after on_init has run.
    async fn abort_setup(&self, ctx: &Context) {
        if let Err(e) = self.pipeline.on_destroy(ctx).await {
            warn!(error = %e, "pipeline teardown failed");
        }
        self.remove_groups().await;
    }

    /// Stop every monitor and wait for it, aborting those that overrun the
    /// shutdown timeout. Returns the first monitor failure.
    async fn stop_monitors(&self, handles: Vec<(MonitorKind, JoinHandle<Result<()>>)>) -> Result<()> {
        for m in &self.monitors {
            m.stop();
        }

        let mut first_err = None;
        for (kind, mut handle) in handles {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    first_err.get_or_insert(e.context(format!("monitor {kind}")));
                }
                Ok(Err(e)) => warn!(monitor = %kind, error = %e, "monitor task failed"),
                Err(_) => {
                    warn!(
                        monitor = %kind,
                        timeout = ?self.shutdown_timeout,
                        "monitor did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::MonitorConfig;
    use crate::driver::ExecDriver;
    use crate::message::{Message, Payload, Record, Source};
    use crate::sink::ChannelSink;

    fn exec(argv: &[&str]) -> Box<dyn BenchDriver> {
        Box::new(ExecDriver::new(argv.iter().map(|s| s.to_string()).collect()))
    }

    /// Records lifecycle hooks into a shared log.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail_init: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_init(&mut self, ctx: &Context) -> Result<()> {
            self.log.lock().push(format!("init pid={:?}", ctx.benchmark().pid()));
            if self.fail_init {
                return Err(anyhow!("init refused"));
            }
            Ok(())
        }

        async fn on_message(&mut self, _ctx: &Context, msg: Message) -> Result<Option<Message>> {
            self.log.lock().push("message".to_string());
            Ok(Some(msg))
        }

        async fn on_end(&mut self, ctx: &Context) -> Result<()> {
            self.log
                .lock()
                .push(format!("end running={}", ctx.benchmark().is_running()));
            Ok(())
        }

        async fn on_destroy(&mut self, _ctx: &Context) -> Result<()> {
            self.log.lock().push("destroy".to_string());
            Ok(())
        }
    }

    /// Emits one message once the workload is running, then waits.
    struct OneShot {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Monitor for OneShot {
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

        async fn run(&self, ctx: Context) -> Result<()> {
            let msg = Message::per_bench(
                Source::Handler("oneshot".to_string()),
                Payload::Record(Record::new()),
                ctx.benchmark(),
            );
            ctx.send(msg).await;
            self.cancel.cancelled().await;
            Ok(())
        }
    }

    /// Never returns, even when stopped.
    struct Stuck;

    #[async_trait]
    impl Monitor for Stuck {
        fn kind(&self) -> MonitorKind {
            MonitorKind::Idle
        }

        fn config(&self) -> MonitorConfig {
            MonitorConfig::Idle
        }

        fn stop(&self) {}

        fn is_stopped(&self) -> bool {
            false
        }

        async fn run(&self, _ctx: Context) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_group_name_follows_running_state() {
        let info = BenchmarkInfo::new("stream_1", "stream", "/tmp");
        assert_eq!(info.pid(), None);
        assert_eq!(info.group_name(), "stream_1");

        info.set_pid(77);
        assert_eq!(info.group_name(), "stream_1");

        info.set_running(true);
        assert_eq!(info.group_name(), "stream_77");

        info.set_running(false);
        assert_eq!(info.group_name(), "stream_1");
    }

    #[test]
    fn test_finalize_adds_idle_monitor() {
        let bench = BenchmarkBuilder::new(BenchmarkInfo::new("b", "n", "/tmp"), exec(&["true"]))
            .finalize()
            .expect("finalize");
        assert_eq!(bench.monitor_kinds(), vec![MonitorKind::Idle]);
    }

    #[test]
    fn test_finalize_rejects_cgroup_engine_without_group() {
        let err = BenchmarkBuilder::new(BenchmarkInfo::new("b", "n", "/tmp"), exec(&["true"]))
            .engine(EngineKind::Cgroup)
            .finalize()
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("without a resource group"));
    }

    #[tokio::test]
    async fn test_run_lifecycle_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Vec::new()));

        let bench = BenchmarkBuilder::new(
            BenchmarkInfo::new("b1", "sleeper", dir.path()),
            exec(&["sleep", "0.2"]),
        )
        .add_monitor(Arc::new(OneShot {
            cancel: CancellationToken::new(),
        }))
        .add_handler(Box::new(Recorder {
            log: Arc::clone(&log),
            fail_init: false,
        }))
        .finalize()
        .expect("finalize");

        let outcome = bench.run(CancellationToken::new()).await.expect("run");
        assert!(matches!(outcome, RunOutcome::Exited(status) if status.success()));

        assert_eq!(
            *log.lock(),
            vec![
                "init pid=None".to_string(),
                "message".to_string(),
                "end running=false".to_string(),
                "destroy".to_string(),
            ]
        );
        assert!(bench.info().pid().is_some());
    }

    #[tokio::test]
    async fn test_cancel_kills_workload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bench = BenchmarkBuilder::new(
            BenchmarkInfo::new("b1", "sleeper", dir.path()),
            exec(&["sleep", "30"]),
        )
        .finalize()
        .expect("finalize");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(10), bench.run(cancel))
            .await
            .expect("run finished")
            .expect("run");
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(!bench.info().is_running());
    }

    #[tokio::test]
    async fn test_stuck_monitor_is_aborted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bench = BenchmarkBuilder::new(
            BenchmarkInfo::new("b1", "n", dir.path()),
            exec(&["true"]),
        )
        .add_monitor(Arc::new(Stuck))
        .shutdown_timeout(Duration::from_millis(50))
        .finalize()
        .expect("finalize");

        let outcome = tokio::time::timeout(Duration::from_secs(10), bench.run(CancellationToken::new()))
            .await
            .expect("run finished")
            .expect("run");
        assert!(matches!(outcome, RunOutcome::Exited(_)));
    }

    #[tokio::test]
    async fn test_init_failure_tears_down_without_launch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Vec::new()));
        let marker = dir.path().join("launched");

        let bench = BenchmarkBuilder::new(
            BenchmarkInfo::new("b1", "n", dir.path()),
            exec(&["touch", marker.to_str().expect("utf8 path")]),
        )
        .add_handler(Box::new(Recorder {
            log: Arc::clone(&log),
            fail_init: true,
        }))
        .finalize()
        .expect("finalize");

        bench
            .run(CancellationToken::new())
            .await
            .expect_err("should fail");

        assert_eq!(
            *log.lock(),
            vec!["init pid=None".to_string(), "destroy".to_string()]
        );
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_group_setup_failure_is_returned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Vec::new()));

        // The mount point is a regular file, so the group cannot be created.
        let mount = dir.path().join("not_a_dir");
        std::fs::write(&mount, "").expect("write");
        let manager = CgroupCpuset::new(&mount, "/proc", crate::cgroup::PrivilegedFs::Direct);

        let bench = BenchmarkBuilder::new(BenchmarkInfo::new("b1", "n", dir.path()), exec(&["true"]))
            .resource_group(ResourceGroup::new(manager, "b1"))
            .add_handler(Box::new(Recorder {
                log: Arc::clone(&log),
                fail_init: false,
            }))
            .finalize()
            .expect("finalize");

        let err = bench
            .run(CancellationToken::new())
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("creating cpuset group b1"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resctrl_group_accounts_workload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("resctrl");
        std::fs::create_dir(&root).expect("mkdir");

        let bench = BenchmarkBuilder::new(
            BenchmarkInfo::new("b1", "sleeper", dir.path()),
            exec(&["sleep", "0.3"]),
        )
        .resctrl_group(ResCtrlGroup::new(&root, "/proc", PrivilegedFs::Direct, "b1"))
        .finalize()
        .expect("finalize");

        let outcome = bench.run(CancellationToken::new()).await.expect("run");
        assert!(matches!(outcome, RunOutcome::Exited(status) if status.success()));

        // A plain directory still holds the tasks file, so removal only warns.
        let pid = bench.info().pid().expect("pid");
        let tasks = std::fs::read_to_string(root.join("b1").join("tasks")).expect("tasks");
        assert!(tasks.lines().any(|line| line == pid.to_string()));
    }

    #[tokio::test]
    async fn test_resctrl_setup_failure_skips_launch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("launched");
        let mount = dir.path().join("not_a_dir");
        std::fs::write(&mount, "").expect("write");

        let bench = BenchmarkBuilder::new(
            BenchmarkInfo::new("b1", "n", dir.path()),
            exec(&["touch", marker.to_str().expect("utf8 path")]),
        )
        .resctrl_group(ResCtrlGroup::new(
            &mount,
            "/proc",
            PrivilegedFs::Direct,
            "b1",
        ))
        .finalize()
        .expect("finalize");

        let err = bench
            .run(CancellationToken::new())
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("creating resctrl group b1"));
        assert!(!marker.exists());
    }

    #[test]
    fn test_from_config_assembles_pipeline() {
        let cfg = Config::from_yaml(
            r#"
resctrl:
  enabled: true
cgroup:
  enabled: false
benchmarks:
  - identifier: stream_1
    name: stream
    command: ./stream -n 4
    cpus: "0-3"
    engine: numa_ctl
"#,
        )
        .expect("config");
        let (sink, _rx) = ChannelSink::new(4);

        let bench = BenchmarkBuilder::from_config(
            &cfg,
            &cfg.benchmarks[0],
            &DriverRegistry::new(),
            Arc::new(sink),
        )
        .expect("builder")
        .finalize()
        .expect("finalize");

        assert_eq!(
            bench.monitor_kinds(),
            vec![MonitorKind::Perf, MonitorKind::CycleCounter, MonitorKind::ResCtrl]
        );
        assert_eq!(bench.engine.name(), "numactl");
        assert!(bench.group.is_none());
        let resctrl = bench.resctrl.as_ref().expect("managed resctrl group");
        assert_eq!(resctrl.path(), cfg.resctrl.root.join("stream_1"));
        assert_eq!(bench.info().workspace(), cfg.workspace.as_path());
    }

    #[test]
    fn test_from_config_unknown_driver() {
        let cfg = Config::from_yaml(
            r#"
cgroup:
  enabled: false
benchmarks:
  - identifier: b
    name: n
    driver: spec_cpu
    engine: plain
"#,
        )
        .expect("config");
        let (sink, _rx) = ChannelSink::new(1);

        let err = BenchmarkBuilder::from_config(
            &cfg,
            &cfg.benchmarks[0],
            &DriverRegistry::new(),
            Arc::new(sink),
        )
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("unknown benchmark driver: spec_cpu"));
    }
}
