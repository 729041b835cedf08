//! Resource groups: cgroup v1 cpusets and resctrl monitoring groups.
//!
//! Every benchmark gets its own cpuset directory under the mount point, and
//! its own resctrl group when cache monitoring is enabled. All
//! mutating operations are performed through [`PrivilegedFs`], one privileged
//! invocation per action, so a denied `sudo` fails the whole action.

mod range;
mod resctrl;

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub use range::{parse_core_range, to_core_range, CoreRangeError};
pub use resctrl::ResCtrlGroup;

use crate::config::{CgroupConfig, Privilege};

/// Scoped-execution wrapper shipped with libcgroup.
const CGEXEC: &str = "cgexec";

/// How privileged filesystem mutations are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegedFs {
    /// Run `sudo -n <tool>` for every action.
    Sudo,
    /// Operate on the filesystem directly with the agent's own identity.
    Direct,
}

impl PrivilegedFs {
    async fn mkdir(self, path: &Path) -> Result<()> {
        match self {
            Self::Sudo => sudo(["mkdir", "-p"], path, None).await,
            Self::Direct => tokio::fs::create_dir_all(path)
                .await
                .with_context(|| format!("creating {}", path.display())),
        }
    }

    /// Remove an empty directory. Returns false if it did not exist.
    async fn rmdir(self, path: &Path) -> Result<bool> {
        match self {
            Self::Sudo => {
                if !tokio::fs::try_exists(path).await.unwrap_or(true) {
                    return Ok(false);
                }
                sudo(["rmdir"], path, None).await?;
                Ok(true)
            }
            Self::Direct => match tokio::fs::remove_dir(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
            },
        }
    }

    async fn write(self, path: &Path, data: &str, append: bool) -> Result<()> {
        match self {
            Self::Sudo => {
                let args: &[&str] = if append { &["tee", "-a"] } else { &["tee"] };
                sudo(args.iter().copied(), path, Some(data.as_bytes())).await
            }
            Self::Direct => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(path)
                    .await
                    .with_context(|| format!("opening {}", path.display()))?;
                file.write_all(data.as_bytes())
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                file.flush().await?;
                Ok(())
            }
        }
    }

    async fn chown(self, path: &Path, owner: &Privilege) -> Result<()> {
        match self {
            Self::Sudo => {
                let spec = if owner.group.is_empty() {
                    owner.user.clone()
                } else {
                    format!("{}:{}", owner.user, owner.group)
                };
                sudo(["chown", "-R", spec.as_str()], path, None).await
            }
            Self::Direct => {
                let (uid, gid) = owner.resolve()?;
                let root = path.to_path_buf();
                tokio::task::spawn_blocking(move || chown_tree(&root, uid, gid))
                    .await
                    .context("chown task panicked")?
            }
        }
    }
}

/// Run `sudo -n <args...> <path>`, optionally feeding `stdin`.
async fn sudo<'a, I>(args: I, path: &Path, stdin: Option<&[u8]>) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let args: Vec<&str> = args.into_iter().collect();
    let mut cmd = Command::new("sudo");
    cmd.arg("-n")
        .args(&args)
        .arg(path)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning sudo {}", args.join(" ")))?;

    if let Some(data) = stdin {
        let mut pipe = child.stdin.take().context("sudo stdin not captured")?;
        pipe.write_all(data).await.context("writing to sudo stdin")?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "sudo {} {} failed ({}): {}",
            args.join(" "),
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

fn chown_tree(path: &Path, uid: nix::unistd::Uid, gid: nix::unistd::Gid) -> Result<()> {
    nix::unistd::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("chown {}", path.display()))?;

    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }

    Ok(())
}

/// Manager for cpuset groups below a cgroup v1 mount point.
#[derive(Debug, Clone)]
pub struct CgroupCpuset {
    mount_point: PathBuf,
    proc_root: PathBuf,
    fs: PrivilegedFs,
    cgexec: PathBuf,
}

impl CgroupCpuset {
    pub fn new(mount_point: impl Into<PathBuf>, proc_root: impl Into<PathBuf>, fs: PrivilegedFs) -> Self {
        Self {
            mount_point: mount_point.into(),
            proc_root: proc_root.into(),
            fs,
            cgexec: PathBuf::from(CGEXEC),
        }
    }

    pub fn from_config(cfg: &CgroupConfig) -> Self {
        let fs = if cfg.use_sudo {
            PrivilegedFs::Sudo
        } else {
            PrivilegedFs::Direct
        };
        Self::new(&cfg.mount_point, &cfg.proc_root, fs)
    }

    /// Override the scoped-execution wrapper binary.
    pub fn with_cgexec(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgexec = path.into();
        self
    }

    /// Directory of the named group.
    pub fn group_path(&self, name: &str) -> PathBuf {
        self.mount_point.join(name)
    }

    pub async fn create_group(&self, name: &str) -> Result<()> {
        self.fs
            .mkdir(&self.group_path(name))
            .await
            .with_context(|| format!("creating cpuset group {name}"))?;
        debug!(group = name, "created cpuset group");
        Ok(())
    }

    /// Remove the named group. A group that is already gone is not an error.
    pub async fn remove_group(&self, name: &str) -> Result<()> {
        let removed = self
            .fs
            .rmdir(&self.group_path(name))
            .await
            .with_context(|| format!("removing cpuset group {name}"))?;

        if removed {
            debug!(group = name, "removed cpuset group");
        } else {
            debug!(group = name, "cpuset group already gone");
        }

        Ok(())
    }

    pub async fn assign_cpus(&self, name: &str, cpus: &BTreeSet<u32>) -> Result<()> {
        self.write_setting(name, "cpuset.cpus", &to_core_range(cpus))
            .await
    }

    pub async fn assign_mems(&self, name: &str, mems: &BTreeSet<u32>) -> Result<()> {
        self.write_setting(name, "cpuset.mems", &to_core_range(mems))
            .await
    }

    /// Copy `file` from the root cpuset into the group. A cpuset accepts
    /// tasks only once both `cpuset.cpus` and `cpuset.mems` are set.
    pub async fn inherit_setting(&self, name: &str, file: &str) -> Result<()> {
        let source = self.mount_point.join(file);
        let value = tokio::fs::read_to_string(&source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        self.write_setting(name, file, value.trim()).await
    }

    async fn write_setting(&self, name: &str, file: &str, value: &str) -> Result<()> {
        let path = self.group_path(name).join(file);
        self.fs
            .write(&path, &format!("{value}\n"), false)
            .await
            .with_context(|| format!("setting {file}={value} on group {name}"))?;
        debug!(group = name, file, value, "cpuset setting written");
        Ok(())
    }

    /// Hand the group directory to `owner`, so workloads running as that
    /// identity may be started inside it.
    pub async fn chown_group(&self, name: &str, owner: &Privilege) -> Result<()> {
        if owner.user.is_empty() {
            return Ok(());
        }
        self.fs
            .chown(&self.group_path(name), owner)
            .await
            .with_context(|| format!("changing owner of group {name}"))
    }

    /// Move every thread of `pid` and of all its descendants into the group.
    /// See [`attach_tree`].
    pub async fn add_all_threads(&self, name: &str, pid: u32) -> Result<usize> {
        let tasks = self.group_path(name).join("tasks");
        attach_tree(self.fs, &self.proc_root, &tasks, name, pid).await
    }

    /// Build the command that runs `argv` inside the group.
    pub fn scoped_command(&self, name: &str, argv: &[String]) -> Result<Command> {
        if argv.is_empty() {
            bail!("empty command for group {name}");
        }

        let mut cmd = Command::new(&self.cgexec);
        cmd.arg("-g")
            .arg(format!("cpuset:{name}"))
            .args(argv.iter().map(OsString::from));
        Ok(cmd)
    }

    /// Launch `argv` pre-scoped to the group.
    pub fn exec_scoped_to(&self, name: &str, argv: &[String]) -> Result<Child> {
        let mut cmd = self.scoped_command(name, argv)?;
        cmd.kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} for group {name}", self.cgexec.display()))
    }
}

/// Write every thread of `pid` and of all its descendants to the `tasks`
/// file of a group, one TID per write.
///
/// Threads that fail to move are retried once against a fresh snapshot,
/// which also picks up threads spawned in the meantime. Threads that no
/// longer exist are skipped. Failing to move `pid` itself is fatal.
/// Returns the number of threads added.
async fn attach_tree(
    fs: PrivilegedFs,
    proc_root: &Path,
    tasks: &Path,
    name: &str,
    pid: u32,
) -> Result<usize> {
    let first = snapshot_tids(proc_root, pid).await?;
    let mut added: HashSet<u32> = HashSet::with_capacity(first.len());
    let mut failed = Vec::new();

    for &tid in &first {
        match add_task(fs, tasks, tid).await {
            Ok(()) => {
                added.insert(tid);
            }
            Err(e) => failed.push((tid, e)),
        }
    }

    // Pick up threads that appeared during the first pass.
    let fresh = snapshot_tids(proc_root, pid).await?;
    let fresh_set: HashSet<u32> = fresh.iter().copied().collect();

    for (tid, first_err) in failed {
        if !fresh_set.contains(&tid) {
            debug!(group = name, tid, error = %first_err, "thread vanished, skipping");
            continue;
        }
        if let Err(e) = add_task(fs, tasks, tid).await {
            if tid == pid {
                return Err(e).with_context(|| format!("adding main thread {pid} to group {name}"));
            }
            warn!(group = name, tid, error = %e, "failed to add thread");
            continue;
        }
        added.insert(tid);
    }

    for tid in fresh {
        if added.contains(&tid) || first.contains(&tid) {
            continue;
        }
        match add_task(fs, tasks, tid).await {
            Ok(()) => {
                added.insert(tid);
            }
            Err(e) => debug!(group = name, tid, error = %e, "late thread not added"),
        }
    }

    info!(group = name, pid, threads = added.len(), "threads added to group");

    Ok(added.len())
}

async fn add_task(fs: PrivilegedFs, tasks: &Path, tid: u32) -> Result<()> {
    fs.write(tasks, &format!("{tid}\n"), true).await
}

async fn snapshot_tids(proc_root: &Path, pid: u32) -> Result<Vec<u32>> {
    let proc_root = proc_root.to_path_buf();
    tokio::task::spawn_blocking(move || discover_tree_tids(&proc_root, pid))
        .await
        .context("thread discovery task panicked")?
}

/// Collect the TIDs of `pid` and, following `task/<tid>/children`, of every
/// descendant process.
///
/// The root's task directory must be readable; descendants that disappear
/// mid-walk are skipped.
pub fn discover_tree_tids(proc_root: &Path, pid: u32) -> Result<Vec<u32>> {
    let mut tids = Vec::with_capacity(16);
    let mut seen = HashSet::new();
    let mut stack = vec![pid];

    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }

        let task_dir = proc_root.join(current.to_string()).join("task");
        let entries = match std::fs::read_dir(&task_dir) {
            Ok(e) => e,
            Err(e) if current == pid => {
                return Err(e).with_context(|| format!("reading {}", task_dir.display()));
            }
            Err(e) => {
                debug!(pid = current, error = %e, "child process vanished");
                continue;
            }
        };

        let mut process_tids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();
        process_tids.sort_unstable();

        for tid in process_tids {
            tids.push(tid);

            let children = task_dir.join(tid.to_string()).join("children");
            let Ok(content) = std::fs::read_to_string(&children) else {
                continue;
            };
            stack.extend(content.split_whitespace().filter_map(|c| c.parse::<u32>().ok()));
        }
    }

    Ok(tids)
}
