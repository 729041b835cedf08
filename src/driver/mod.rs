//! Launch boundary: which command a benchmark runs and how it is bound to
//! its resources when spawned.
//!
//! Benchmark-suite specific drivers are registered by the embedding
//! application; the agent ships a generic `exec` driver only.

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;

use anyhow::{Context, Result};
use nix::unistd::{getegid, geteuid};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::cgroup::{to_core_range, CgroupCpuset};
use crate::config::{BenchConfig, Privilege};

/// Name of the built-in driver.
pub const EXEC_DRIVER: &str = "exec";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown benchmark driver: {0}")]
    Unknown(String),

    #[error("benchmark {0} has an empty command")]
    EmptyCommand(String),

    #[error("invalid command line for {identifier}: {reason}")]
    InvalidCommand { identifier: String, reason: String },
}

/// Describes how to start one benchmark workload.
pub trait BenchDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Argument vector of the workload.
    fn command(&self) -> &[String];

    /// Process to monitor, given the pid of the launched command. Drivers
    /// whose launcher forks the real workload override this.
    fn bench_pid(&self, launched: u32) -> u32 {
        launched
    }
}

/// Runs the configured command line as is.
#[derive(Debug, Clone)]
pub struct ExecDriver {
    argv: Vec<String>,
}

impl ExecDriver {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn from_config(cfg: &BenchConfig) -> Result<Self, DriverError> {
        let argv = shellwords::split(&cfg.command).map_err(|e| DriverError::InvalidCommand {
            identifier: cfg.identifier.clone(),
            reason: e.to_string(),
        })?;

        if argv.is_empty() {
            return Err(DriverError::EmptyCommand(cfg.identifier.clone()));
        }

        Ok(Self::new(argv))
    }
}

impl BenchDriver for ExecDriver {
    fn name(&self) -> &str {
        EXEC_DRIVER
    }

    fn command(&self) -> &[String] {
        &self.argv
    }
}

/// Builds a driver from benchmark configuration.
pub type DriverFactory = fn(&BenchConfig) -> Result<Box<dyn BenchDriver>, DriverError>;

fn exec_factory(cfg: &BenchConfig) -> Result<Box<dyn BenchDriver>, DriverError> {
    Ok(Box::new(ExecDriver::from_config(cfg)?))
}

/// Name to driver factory lookup.
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl DriverRegistry {
    /// A registry without any drivers.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in drivers.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(EXEC_DRIVER, exec_factory);
        registry
    }

    pub fn register(&self, name: &str, factory: DriverFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the driver named in `cfg`. Unknown names fail.
    pub fn create(&self, cfg: &BenchConfig) -> Result<Box<dyn BenchDriver>, DriverError> {
        let factory = self
            .factories
            .read()
            .get(&cfg.driver)
            .copied()
            .ok_or_else(|| DriverError::Unknown(cfg.driver.clone()))?;

        factory(cfg)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// How the workload process gets bound to its resources at spawn time.
#[derive(Debug, Clone)]
pub enum LaunchEngine {
    /// Run the command without any binding.
    Plain,
    /// Run through `cgexec` inside a cpuset group.
    Cgroup { manager: CgroupCpuset, group: String },
    /// Run through `numactl`.
    NumaCtl {
        cpus: Option<BTreeSet<u32>>,
        mems: Option<BTreeSet<u32>>,
    },
}

impl LaunchEngine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Cgroup { .. } => "cgroup",
            Self::NumaCtl { .. } => "numactl",
        }
    }

    /// The command that runs `argv` under this engine.
    pub fn command(&self, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .context("empty workload command")?;

        match self {
            Self::Plain => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
            Self::Cgroup { manager, group } => manager.scoped_command(group, argv),
            Self::NumaCtl { cpus, mems } => {
                let mut cmd = Command::new("numactl");
                if let Some(cpus) = cpus {
                    cmd.arg(format!("--physcpubind={}", to_core_range(cpus)));
                }
                match mems {
                    Some(mems) => cmd.arg(format!("--membind={}", to_core_range(mems))),
                    None => cmd.arg("--localalloc"),
                };
                cmd.args(argv);
                Ok(cmd)
            }
        }
    }

    /// Spawn `argv` as `privilege`.
    pub fn launch(&self, argv: &[String], privilege: &Privilege) -> Result<Child> {
        let mut cmd = self.command(argv)?;

        let (uid, gid) = privilege.resolve()?;
        if uid != geteuid() || gid != getegid() {
            cmd.uid(uid.as_raw()).gid(gid.as_raw());
        }

        debug!(engine = self.name(), command = %argv.join(" "), %uid, %gid, "launching workload");

        cmd.stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {} via {}", argv.join(" "), self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{parse_core_range, PrivilegedFs};
    use crate::config::EngineKind;

    fn bench(driver: &str, command: &str) -> BenchConfig {
        BenchConfig {
            identifier: "b1".to_string(),
            name: "stream".to_string(),
            driver: driver.to_string(),
            command: command.to_string(),
            cpus: None,
            mems: None,
            engine: EngineKind::Plain,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        let std = cmd.as_std();
        std::iter::once(std.get_program())
            .chain(std.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_exec_driver_splits_command() {
        let driver = DriverRegistry::new()
            .create(&bench("exec", "./stream --size '1 GB' -t 4"))
            .expect("driver");

        assert_eq!(driver.name(), "exec");
        assert_eq!(driver.command(), ["./stream", "--size", "1 GB", "-t", "4"]);
        assert_eq!(driver.bench_pid(17), 17);
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let err = DriverRegistry::new()
            .create(&bench("parsec", "canneal"))
            .err()
            .expect("should fail");
        assert!(matches!(&err, DriverError::Unknown(name) if name == "parsec"));
        assert_eq!(err.to_string(), "unknown benchmark driver: parsec");
    }

    #[test]
    fn test_empty_and_invalid_commands() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.create(&bench("exec", "   ")).err(),
            Some(DriverError::EmptyCommand(_))
        ));
        assert!(matches!(
            registry.create(&bench("exec", "echo 'unterminated")).err(),
            Some(DriverError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_register_custom_driver() {
        fn fixed(_cfg: &BenchConfig) -> Result<Box<dyn BenchDriver>, DriverError> {
            Ok(Box::new(ExecDriver::new(vec!["true".to_string()])))
        }

        let registry = DriverRegistry::empty();
        assert!(registry.names().is_empty());
        registry.register("fixed", fixed);

        assert_eq!(registry.names(), vec!["fixed"]);
        let driver = registry.create(&bench("fixed", "")).expect("driver");
        assert_eq!(driver.command(), ["true"]);
    }

    #[test]
    fn test_engine_commands() {
        let argv = vec!["./bench".to_string(), "-n".to_string()];

        let plain = LaunchEngine::Plain.command(&argv).expect("plain");
        assert_eq!(args(&plain), vec!["./bench", "-n"]);

        let numa = LaunchEngine::NumaCtl {
            cpus: Some(parse_core_range("0-3").expect("range")),
            mems: None,
        }
        .command(&argv)
        .expect("numactl");
        assert_eq!(
            args(&numa),
            vec!["numactl", "--physcpubind=0-3", "--localalloc", "./bench", "-n"]
        );

        let cgroup = LaunchEngine::Cgroup {
            manager: CgroupCpuset::new("/cg", "/proc", PrivilegedFs::Direct),
            group: "b1".to_string(),
        }
        .command(&argv)
        .expect("cgroup");
        assert_eq!(args(&cgroup), vec!["cgexec", "-g", "cpuset:b1", "./bench", "-n"]);

        LaunchEngine::Plain.command(&[]).expect_err("should fail");
    }

    #[tokio::test]
    async fn test_launch_as_current_identity() {
        let mut child = LaunchEngine::Plain
            .launch(&["true".to_string()], &Privilege::current())
            .expect("spawn");
        assert!(child.wait().await.expect("wait").success());
    }
}
