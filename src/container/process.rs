//! # Host Process Backend
//!
//! Runs container payloads as plain host child processes rooted at the
//! composed rootfs. No namespace, capability, or mount isolation is
//! applied; the backend exists for unprivileged hosts and for exercising
//! the engine without root. Containers running under it always carry the
//! capability-degraded marker via their policy handle.
//!
//! Cgroup identities are synthetic (a process-local counter), which keeps
//! the policy bookkeeping invariants intact without touching the kernel.

use crate::container::{ContainerBackend, ContainerConfig, SpawnOutcome, Supervisor};
use crate::error::{Error, Result};
use crate::layer::{LayerComposer, LayerContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

static NEXT_CGROUP: AtomicU64 = AtomicU64::new(1);

/// Backend launching payloads as host processes.
pub struct ProcessBackend {
    _private: (),
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn launch(
        &self,
        config: &ContainerConfig,
        ctx: &LayerContext,
        _composer: &LayerComposer,
    ) -> Result<Arc<dyn Supervisor>> {
        if !ctx.deferred_binds().is_empty() {
            warn!(
                "process backend for '{}' skips {} in-namespace bind(s)",
                config.id,
                ctx.deferred_binds().len()
            );
        }
        Ok(Arc::new(ProcessSupervisor {
            cgroup_id: NEXT_CGROUP.fetch_add(1, Ordering::Relaxed),
            rootfs: ctx.rootfs.clone(),
            children: Mutex::new(HashMap::new()),
        }))
    }
}

struct ProcessSupervisor {
    cgroup_id: u64,
    rootfs: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessSupervisor {
    async fn reap(&self) {
        let mut children = self.children.lock().await;
        let mut done = Vec::new();
        for (pid, child) in children.iter_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                done.push(*pid);
            }
        }
        for pid in done {
            children.remove(&pid);
        }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    async fn spawn(
        &self,
        argv: &[String],
        envp: &[(String, String)],
        wait: bool,
    ) -> Result<SpawnOutcome> {
        self.reap().await;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(envp.iter().cloned())
            .current_dir(&self.rootfs);

        let mut child = command.spawn().map_err(|e| Error::SpawnFailed {
            id: self.rootfs.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);
        debug!("process backend spawned pid {}", pid);

        if wait {
            let status = child.wait().await.map_err(|e| Error::SpawnFailed {
                id: self.rootfs.display().to_string(),
                reason: format!("wait: {}", e),
            })?;
            Ok(SpawnOutcome {
                pid,
                exit_code: Some(exit_code(status)),
            })
        } else {
            self.children.lock().await.insert(pid, child);
            Ok(SpawnOutcome {
                pid,
                exit_code: None,
            })
        }
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&pid) {
            // start_kill is SIGKILL; reaping happens on the next sweep.
            let _ = child.start_kill();
        }
        Ok(())
    }

    async fn children(&self) -> Vec<u32> {
        self.reap().await;
        self.children.lock().await.keys().copied().collect()
    }

    async fn shutdown(&self, grace: Duration) -> Result<()> {
        let mut children = self.children.lock().await;
        for (_, child) in children.iter_mut() {
            let _ = child.start_kill();
        }
        let deadline = tokio::time::Instant::now() + grace;
        for (_, mut child) in children.drain() {
            let _ = tokio::time::timeout_at(deadline, child.wait()).await;
        }
        Ok(())
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(127)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(127)
    }
}
