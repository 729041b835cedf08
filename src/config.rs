use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cgroup::parse_core_range;

/// Top-level configuration for the benchmon agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Root directory for per-benchmark output (CSV files, logs).
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Identities used for result files and launched workloads.
    #[serde(default)]
    pub privilege: PrivilegeConfig,

    /// `perf stat` monitor configuration.
    #[serde(default)]
    pub perf: PerfConfig,

    /// Time-stamp counter monitor configuration.
    #[serde(default)]
    pub rdtsc: RdtscConfig,

    /// Intel RDT (resctrl) monitor configuration.
    #[serde(default)]
    pub resctrl: ResCtrlConfig,

    /// Cpuset resource group configuration.
    #[serde(default)]
    pub cgroup: CgroupConfig,

    /// Upper bound on how long a stopped monitor may take to exit before its
    /// task is aborted. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub monitor_shutdown_timeout: Duration,

    /// Workloads to run, all concurrently.
    #[serde(default)]
    pub benchmarks: Vec<BenchConfig>,
}

/// A user/group pair. Empty fields mean "keep the current identity".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Privilege {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
}

/// Identities the agent switches to for unprivileged work.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivilegeConfig {
    /// Owner of result files written by handlers.
    #[serde(default)]
    pub result: Privilege,

    /// Identity launched workloads run as.
    #[serde(default)]
    pub execute: Privilege,
}

/// A perf event and the alias it is reported under.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PerfEvent {
    /// Event in perf notation (e.g. "cpu/event=0xd1,umask=0x20/").
    pub event: String,
    /// Human readable name used as record key and CSV column.
    pub alias: String,
}

impl PerfEvent {
    pub fn new(event: &str, alias: &str) -> Self {
        Self {
            event: event.to_string(),
            alias: alias.to_string(),
        }
    }
}

/// `perf stat` monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PerfConfig {
    /// Enable the perf monitor. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// perf executable. Default: "perf".
    #[serde(default = "default_perf_binary")]
    pub binary: PathBuf,

    /// Sampling interval, passed to `perf stat -I` in milliseconds. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Events to sample, in output order.
    #[serde(default = "default_perf_events")]
    pub events: Vec<PerfEvent>,
}

impl PerfConfig {
    /// Interval in perf's time unit (milliseconds).
    pub fn interval_ms(&self) -> u64 {
        u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX)
    }

    /// Events joined for `perf stat -e`.
    pub fn event_str(&self) -> String {
        self.events
            .iter()
            .map(|e| e.event.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Event aliases in configured order.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.alias.as_str())
    }
}

/// Time-stamp counter monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RdtscConfig {
    /// Enable the cycle counter monitor. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampling interval. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Intel RDT monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResCtrlConfig {
    /// Enable the resctrl monitor. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// resctrl mount point. Default: "/sys/fs/resctrl".
    #[serde(default = "default_resctrl_root")]
    pub root: PathBuf,

    /// Existing monitoring group under `root`, left untouched. Empty means a
    /// group named after the benchmark's identifier is created for the run
    /// and removed afterwards.
    #[serde(default)]
    pub group: String,

    /// Sampling interval. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Cpuset resource group configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CgroupConfig {
    /// Create a cpuset group per benchmark. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// cgroup v1 cpuset mount point. Default: "/sys/fs/cgroup/cpuset".
    #[serde(default = "default_cpuset_mount")]
    pub mount_point: PathBuf,

    /// procfs mount used for thread discovery. Default: "/proc".
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Run privileged operations through `sudo`. Default: true.
    #[serde(default = "default_true")]
    pub use_sudo: bool,
}

/// How a workload process gets bound to its resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Launch through `cgexec` into the benchmark's cpuset group.
    #[default]
    Cgroup,
    /// Launch through `numactl` with cpu and memory binding.
    NumaCtl,
    /// Launch the command as is.
    Plain,
}

/// A single workload to run and monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    /// Unique identifier, used for file names and group names.
    pub identifier: String,

    /// Workload name, reported in routing keys.
    pub name: String,

    /// Driver used to build the launch command. Default: "exec".
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Command line handed to the driver.
    #[serde(default)]
    pub command: String,

    /// Cores the workload is bound to (e.g. "0-3,8").
    #[serde(default)]
    pub cpus: Option<String>,

    /// Memory nodes the workload is bound to (e.g. "0").
    #[serde(default)]
    pub mems: Option<String>,

    /// Launch engine. Default: cgroup.
    #[serde(default)]
    pub engine: EngineKind,
}

/// Immutable sampling configuration exposed by every monitor.
#[derive(Debug, Clone)]
pub enum MonitorConfig {
    Perf(PerfConfig),
    Rdtsc(RdtscConfig),
    ResCtrl(ResCtrlConfig),
    Idle,
}

impl MonitorConfig {
    /// Sampling interval, if the monitor samples periodically.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::Perf(c) => Some(c.interval),
            Self::Rdtsc(c) => Some(c.interval),
            Self::ResCtrl(c) => Some(c.interval),
            Self::Idle => None,
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_perf_binary() -> PathBuf {
    PathBuf::from("perf")
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_perf_events() -> Vec<PerfEvent> {
    vec![
        PerfEvent::new("instructions", "instructions"),
        PerfEvent::new("cycles", "cycles"),
        PerfEvent::new("LLC-load-misses", "llc_misses"),
    ]
}

fn default_resctrl_root() -> PathBuf {
    PathBuf::from("/sys/fs/resctrl")
}

fn default_cpuset_mount() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/cpuset")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_driver() -> String {
    "exec".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workspace: default_workspace(),
            privilege: PrivilegeConfig::default(),
            perf: PerfConfig::default(),
            rdtsc: RdtscConfig::default(),
            resctrl: ResCtrlConfig::default(),
            cgroup: CgroupConfig::default(),
            monitor_shutdown_timeout: default_shutdown_timeout(),
            benchmarks: Vec::new(),
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_perf_binary(),
            interval: default_interval(),
            events: default_perf_events(),
        }
    }
}

impl Default for RdtscConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
        }
    }
}

impl Default for ResCtrlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_resctrl_root(),
            group: String::new(),
            interval: default_interval(),
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mount_point: default_cpuset_mount(),
            proc_root: default_proc_root(),
            use_sudo: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.benchmarks.is_empty() {
            bail!("at least one benchmark is required");
        }

        if self.monitor_shutdown_timeout.is_zero() {
            bail!("monitor_shutdown_timeout must be positive");
        }

        if self.perf.enabled {
            if self.perf.interval_ms() == 0 {
                bail!("perf.interval must be at least 1ms");
            }
            if self.perf.events.is_empty() {
                bail!("perf.events must not be empty when perf is enabled");
            }

            let mut aliases = HashSet::new();
            for event in &self.perf.events {
                if event.alias.is_empty() || event.event.is_empty() {
                    bail!("perf events need both event and alias");
                }
                if !aliases.insert(event.alias.as_str()) {
                    bail!("duplicate perf event alias: {}", event.alias);
                }
            }
        }

        if self.rdtsc.enabled && self.rdtsc.interval.is_zero() {
            bail!("rdtsc.interval must be positive");
        }

        if self.resctrl.enabled && self.resctrl.interval.is_zero() {
            bail!("resctrl.interval must be positive");
        }

        let mut identifiers = HashSet::new();
        for bench in &self.benchmarks {
            if bench.identifier.is_empty() {
                bail!("benchmark identifier must not be empty");
            }
            if !identifiers.insert(bench.identifier.as_str()) {
                bail!("duplicate benchmark identifier: {}", bench.identifier);
            }
            if bench.name.is_empty() {
                bail!("benchmark {} has no name", bench.identifier);
            }

            if let Some(cpus) = &bench.cpus {
                parse_core_range(cpus)
                    .with_context(|| format!("invalid cpus for {}", bench.identifier))?;
            }
            if let Some(mems) = &bench.mems {
                parse_core_range(mems)
                    .with_context(|| format!("invalid mems for {}", bench.identifier))?;
            }

            if bench.engine == EngineKind::Cgroup && !self.cgroup.enabled {
                bail!(
                    "benchmark {} uses the cgroup engine but cgroup is disabled",
                    bench.identifier
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
benchmarks:
  - identifier: stream_1
    name: stream
    command: ./stream
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = Config::from_yaml(MINIMAL).expect("valid config");

        assert_eq!(cfg.log_level, "info");
        assert!(cfg.perf.enabled);
        assert_eq!(cfg.perf.interval, Duration::from_secs(1));
        assert_eq!(cfg.perf.events.len(), 3);
        assert!(!cfg.resctrl.enabled);
        assert_eq!(cfg.cgroup.mount_point, PathBuf::from("/sys/fs/cgroup/cpuset"));
        assert_eq!(cfg.monitor_shutdown_timeout, Duration::from_secs(5));

        let bench = &cfg.benchmarks[0];
        assert_eq!(bench.driver, "exec");
        assert_eq!(bench.engine, EngineKind::Cgroup);
        assert!(bench.cpus.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
workspace: /tmp/bench
privilege:
  result: { user: bench, group: bench }
  execute: { user: nobody, group: nogroup }
perf:
  interval: 50ms
  events:
    - { event: instructions, alias: inst }
    - { event: "cpu/event=0xd1,umask=0x20/", alias: l3_miss }
resctrl:
  enabled: true
  interval: 200ms
monitor_shutdown_timeout: 2s
benchmarks:
  - identifier: a
    name: canneal
    command: ./canneal 4
    cpus: "0-3"
    mems: "0"
    engine: numa_ctl
"#;
        let cfg = Config::from_yaml(yaml).expect("valid config");

        assert_eq!(cfg.privilege.result.user, "bench");
        assert_eq!(cfg.privilege.execute.group, "nogroup");
        assert_eq!(cfg.perf.interval_ms(), 50);
        assert_eq!(
            cfg.perf.event_str(),
            "instructions,cpu/event=0xd1,umask=0x20/"
        );
        assert_eq!(
            cfg.perf.event_names().collect::<Vec<_>>(),
            vec!["inst", "l3_miss"]
        );
        assert!(cfg.resctrl.enabled);
        assert_eq!(cfg.benchmarks[0].engine, EngineKind::NumaCtl);
    }

    #[test]
    fn test_validate_rejects_no_benchmarks() {
        let err = Config::from_yaml("workspace: /tmp\n").expect_err("should fail");
        assert!(err.to_string().contains("at least one benchmark"));
    }

    #[test]
    fn test_validate_rejects_duplicate_identifiers() {
        let yaml = r#"
benchmarks:
  - { identifier: x, name: a }
  - { identifier: x, name: b }
"#;
        let err = Config::from_yaml(yaml).expect_err("should fail");
        assert!(err.to_string().contains("duplicate benchmark identifier"));
    }

    #[test]
    fn test_validate_rejects_duplicate_aliases() {
        let yaml = r#"
perf:
  events:
    - { event: cycles, alias: c }
    - { event: instructions, alias: c }
benchmarks:
  - { identifier: x, name: a }
"#;
        let err = Config::from_yaml(yaml).expect_err("should fail");
        assert!(err.to_string().contains("duplicate perf event alias"));
    }

    #[test]
    fn test_validate_rejects_bad_core_range() {
        let yaml = r#"
benchmarks:
  - { identifier: x, name: a, cpus: "0-x" }
"#;
        let err = Config::from_yaml(yaml).expect_err("should fail");
        assert!(format!("{err:#}").contains("invalid cpus"));
    }

    #[test]
    fn test_validate_rejects_cgroup_engine_without_cgroup() {
        let yaml = r#"
cgroup:
  enabled: false
benchmarks:
  - { identifier: x, name: a }
"#;
        let err = Config::from_yaml(yaml).expect_err("should fail");
        assert!(err.to_string().contains("cgroup is disabled"));
    }

    #[test]
    fn test_monitor_config_interval() {
        let perf = MonitorConfig::Perf(PerfConfig::default());
        assert_eq!(perf.interval(), Some(Duration::from_secs(1)));
        assert_eq!(MonitorConfig::Idle.interval(), None);
    }
}
