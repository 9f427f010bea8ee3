//! # Linux Namespace Backend
//!
//! Launches containers via a two-process handshake:
//!
//! ```text
//! parent                                child (new pid/mnt/uts/ipc/net ns)
//!   clone(CLONE_NEW…) ───────────────────► make mounts private
//!   write pid into cgroup.procs            apply in-namespace binds
//!   │                                      pivot_root into composed rootfs
//!   │                                      mount fresh /proc
//!   │                                      set hostname
//!   │                                      drop capability bounding set
//!   ◄── readiness datagram + control fd ── send SCM_RIGHTS over socketpair
//!   populate policy maps (engine)          supervise: spawn/kill/reap loop
//! ```
//!
//! The child stays resident as PID 1 of the new pid namespace and runs a
//! line-JSON control loop over the stream socket whose parent end arrives
//! with the readiness datagram. Wait-style spawns are serviced on child
//! threads so control traffic (kill, shutdown) keeps flowing while a
//! build runs.
//!
//! Capabilities are dropped after pivot-root and before the policy is
//! loaded; map population itself runs parent-side, which still holds
//! privilege.

#[cfg(target_os = "linux")]
mod imp {
    use crate::constants::CGROUP_ROOT;
    use crate::container::{ContainerBackend, ContainerConfig, SpawnOutcome, Supervisor};
    use crate::error::{Error, Result};
    use crate::layer::{LayerComposer, LayerContext};
    use crate::platform::{Capability, Platform};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
    use tokio::net::UnixStream;
    use tokio::sync::{Mutex, oneshot};
    use tracing::{debug, info, warn};

    // =========================================================================
    // Control Protocol (parent ⇄ supervisor)
    // =========================================================================

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "op", rename_all = "snake_case")]
    enum SupervisorRequest {
        Spawn {
            seq: u64,
            argv: Vec<String>,
            env: Vec<(String, String)>,
            wait: bool,
        },
        Kill {
            seq: u64,
            pid: u32,
        },
        Children {
            seq: u64,
        },
        Shutdown {
            seq: u64,
            grace_ms: u64,
        },
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "result", rename_all = "snake_case")]
    enum SupervisorResponse {
        Ok { seq: u64 },
        Spawned { seq: u64, pid: u32 },
        Exited { seq: u64, pid: u32, code: i32 },
        Children { seq: u64, pids: Vec<u32> },
        Error { seq: u64, message: String },
    }

    impl SupervisorResponse {
        fn seq(&self) -> u64 {
            match self {
                Self::Ok { seq }
                | Self::Spawned { seq, .. }
                | Self::Exited { seq, .. }
                | Self::Children { seq, .. }
                | Self::Error { seq, .. } => *seq,
            }
        }
    }

    // =========================================================================
    // Backend
    // =========================================================================

    /// Namespace-isolated container backend.
    pub struct LinuxBackend {
        available: bool,
        reason: Option<String>,
        seccomp_fallback: bool,
    }

    impl LinuxBackend {
        pub fn new() -> Self {
            let platform = Platform::detect();
            let (available, reason) = Self::check_availability(&platform);
            Self {
                available,
                reason,
                seccomp_fallback: !platform.has(Capability::BpfLsm)
                    && platform.has(Capability::Seccomp),
            }
        }

        /// Why the backend is unavailable, if it is.
        pub fn unavailable_reason(&self) -> Option<&str> {
            self.reason.as_deref()
        }

        fn check_availability(platform: &Platform) -> (bool, Option<String>) {
            if !platform.has(Capability::Namespaces) {
                return (false, Some("Linux namespaces not available".to_string()));
            }
            if !nix::unistd::geteuid().is_root() {
                return (false, Some("namespace setup requires root".to_string()));
            }
            if let Err(e) = std::fs::create_dir_all(CGROUP_ROOT) {
                return (false, Some(format!("cannot create cgroup root: {}", e)));
            }
            (true, None)
        }
    }

    impl Default for LinuxBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ContainerBackend for LinuxBackend {
        fn name(&self) -> &str {
            "linux"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn launch(
            &self,
            config: &ContainerConfig,
            ctx: &LayerContext,
            composer: &LayerComposer,
        ) -> Result<Arc<dyn Supervisor>> {
            if !self.available {
                return Err(Error::PermissionDenied(
                    self.reason
                        .clone()
                        .unwrap_or_else(|| "linux backend unavailable".to_string()),
                ));
            }

            // Lossy fallback: compile the filter the payloads will run
            // under when the BPF-LSM surface is absent.
            #[cfg(target_arch = "x86_64")]
            let seccomp = if self.seccomp_fallback {
                Some(crate::policy::seccomp_filter(&config.policy)?)
            } else {
                None
            };
            #[cfg(not(target_arch = "x86_64"))]
            let seccomp: Option<seccompiler::BpfProgram> = None;

            let (cgroup_path, cgroup_id) = create_cgroup(&config.id)?;

            let launch = LaunchContext {
                rootfs: ctx.rootfs.clone(),
                hostname: config.hostname.clone(),
                capabilities: config.capabilities.0,
                seccomp,
            };

            // The handshake blocks for at most READY_TIMEOUT; it borrows
            // the context, so it runs inline rather than on a blocking
            // task.
            let launched = fork_supervisor(&launch, ctx, composer, &cgroup_path);

            let (init_pid, control_fd) = match launched {
                Ok(v) => v,
                Err(e) => {
                    let _ = remove_cgroup(&cgroup_path);
                    return Err(e);
                }
            };

            let control = unsafe { StdUnixStream::from_raw_fd(control_fd) };
            control.set_nonblocking(true).map_err(Error::Io)?;
            let control = UnixStream::from_std(control).map_err(Error::Io)?;

            let supervisor = LinuxSupervisor::start(
                control,
                init_pid,
                cgroup_id,
                cgroup_path,
                config.id.clone(),
            );
            info!(
                "launched supervisor pid {} for '{}' (cgroup {})",
                init_pid, config.id, cgroup_id
            );
            Ok(supervisor)
        }
    }

    struct LaunchContext {
        rootfs: PathBuf,
        hostname: Option<String>,
        capabilities: u64,
        seccomp: Option<seccompiler::BpfProgram>,
    }

    // =========================================================================
    // Cgroups
    // =========================================================================

    fn create_cgroup(id: &str) -> Result<(PathBuf, u64)> {
        let path = Path::new(CGROUP_ROOT).join(id);
        std::fs::create_dir_all(&path)?;
        // On cgroup2 the directory inode number is the kernel cgroup id.
        let meta = std::fs::metadata(&path)?;
        Ok((path, meta.ino()))
    }

    fn add_to_cgroup(path: &Path, pid: u32) -> Result<()> {
        std::fs::write(path.join("cgroup.procs"), pid.to_string()).map_err(Error::Io)
    }

    fn remove_cgroup(path: &Path) -> Result<()> {
        match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    // =========================================================================
    // Fork + Handshake
    // =========================================================================

    /// Forks the supervisor into its namespace set and completes the
    /// readiness handshake. Returns the supervisor pid and the parent end
    /// of the control stream.
    fn fork_supervisor(
        launch: &LaunchContext,
        ctx: &LayerContext,
        composer: &LayerComposer,
        cgroup_path: &Path,
    ) -> Result<(u32, RawFd)> {
        use nix::sched::CloneFlags;
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

        // Readiness travels over a datagram pair; the stream control fd
        // rides along in its control message.
        let (ready_parent, ready_child) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| Error::Internal(format!("socketpair: {}", e)))?;

        let flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWNET;

        let mut stack = vec![0u8; 1024 * 1024];
        let child_ready_fd = ready_child.as_raw_fd();
        let child = unsafe {
            nix::sched::clone(
                Box::new(|| supervisor_child(launch, ctx, composer, child_ready_fd)),
                &mut stack,
                flags,
                Some(nix::sys::signal::Signal::SIGCHLD as libc::c_int),
            )
        }
        .map_err(|e| match e {
            nix::errno::Errno::EPERM => {
                Error::PermissionDenied(format!("clone into namespaces: {}", e))
            }
            nix::errno::Errno::ENOMEM | nix::errno::Errno::EAGAIN => {
                Error::ResourceExhausted(format!("clone: {}", e))
            }
            e => Error::Internal(format!("clone: {}", e)),
        })?;
        drop(ready_child);

        let pid = child.as_raw() as u32;
        if let Err(e) = add_to_cgroup(cgroup_path, pid) {
            let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL);
            let _ = nix::sys::wait::waitpid(child, None);
            return Err(e);
        }

        match await_ready(ready_parent, crate::constants::READY_TIMEOUT) {
            Ok(control_fd) => Ok((pid, control_fd)),
            Err(e) => {
                let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL);
                let _ = nix::sys::wait::waitpid(child, None);
                Err(e)
            }
        }
    }

    /// Waits for the readiness datagram and extracts the control fd.
    fn await_ready(ready: OwnedFd, timeout: Duration) -> Result<RawFd> {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
        use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
        use std::io::IoSliceMut;

        let mut fds = [PollFd::new(ready.as_fd(), PollFlags::POLLIN)];
        let millis =
            PollTimeout::try_from(timeout.as_millis() as i32).unwrap_or(PollTimeout::MAX);
        let n = poll(&mut fds, millis).map_err(|e| Error::Internal(format!("poll: {}", e)))?;
        if n == 0 {
            return Err(Error::RootfsInvalid(
                "container setup timed out before readiness".into(),
            ));
        }

        let mut payload = [0u8; 256];
        let mut iov = [IoSliceMut::new(&mut payload)];
        let mut cmsg = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            ready.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(|e| Error::Internal(format!("recvmsg: {}", e)))?;

        let len = msg.bytes;
        let mut control_fd = None;
        for cmsg in msg.cmsgs().map_err(|e| Error::Internal(e.to_string()))? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                control_fd = received.first().copied();
            }
        }
        let status = payload.first().copied().unwrap_or(1);

        if status != 0 {
            if let Some(fd) = control_fd {
                let _ = nix::unistd::close(fd);
            }
            let detail = String::from_utf8_lossy(&payload[1..len]).into_owned();
            return Err(Error::RootfsInvalid(format!(
                "container setup failed: {}",
                detail
            )));
        }

        control_fd.ok_or_else(|| Error::Internal("readiness datagram carried no control fd".into()))
    }

    // =========================================================================
    // Child Side
    // =========================================================================

    /// Entry point of the cloned child; PID 1 of the new namespace.
    fn supervisor_child(
        launch: &LaunchContext,
        ctx: &LayerContext,
        composer: &LayerComposer,
        ready_fd: RawFd,
    ) -> isize {
        match supervisor_setup(launch, ctx, composer) {
            Ok((child_end, parent_fd)) => {
                send_ready(ready_fd, 0, "", Some(parent_fd));
                let _ = nix::unistd::close(parent_fd);
                supervisor_loop(child_end, launch.seccomp.clone());
                0
            }
            Err(e) => {
                send_ready(ready_fd, 1, &e.to_string(), None);
                1
            }
        }
    }

    /// Mount-namespace setup: binds, pivot_root, /proc, hostname, caps.
    /// Returns the child end of the control stream plus the parent end's
    /// fd for the readiness message.
    fn supervisor_setup(
        launch: &LaunchContext,
        ctx: &LayerContext,
        composer: &LayerComposer,
    ) -> Result<(StdUnixStream, RawFd)> {
        use nix::mount::{MntFlags, MsFlags, mount, umount2};
        use std::os::fd::IntoRawFd;

        // Mount changes must not leak back to the host namespace.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| Error::Internal(format!("making mounts private: {}", e)))?;

        // Binds that only become visible in this namespace.
        composer.mount_in_namespace(ctx)?;

        // The new root must itself be a mount point for pivot_root.
        mount(
            Some(&launch.rootfs),
            &launch.rootfs,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::RootfsInvalid(format!("self-bind of rootfs: {}", e)))?;

        let old_root = launch.rootfs.join(".oldroot");
        std::fs::create_dir_all(&old_root)?;
        nix::unistd::pivot_root(&launch.rootfs, &old_root)
            .map_err(|e| Error::RootfsInvalid(format!("pivot_root: {}", e)))?;
        nix::unistd::chdir("/").map_err(|e| Error::Internal(format!("chdir: {}", e)))?;
        umount2("/.oldroot", MntFlags::MNT_DETACH)
            .map_err(|e| Error::Internal(format!("detaching old root: {}", e)))?;
        let _ = std::fs::remove_dir("/.oldroot");

        if Path::new("/proc").is_dir() {
            let _ = mount(
                Some("proc"),
                "/proc",
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            );
        }

        if let Some(hostname) = &launch.hostname {
            nix::unistd::sethostname(hostname)
                .map_err(|e| Error::Internal(format!("sethostname: {}", e)))?;
        }

        // After pivot-root, before policy: the map population still runs
        // with the parent's privilege.
        drop_capabilities(launch.capabilities)?;

        let (parent_end, child_end) = StdUnixStream::pair().map_err(Error::Io)?;
        Ok((child_end, parent_end.into_raw_fd()))
    }

    fn send_ready(ready_fd: RawFd, status: u8, detail: &str, control: Option<RawFd>) {
        use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
        use std::io::IoSlice;

        let mut payload = vec![status];
        payload.extend_from_slice(detail.as_bytes());
        payload.truncate(256);
        let iov = [IoSlice::new(&payload)];

        let fds: Vec<RawFd> = control.into_iter().collect();
        let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&fds)]
        };

        let _ = sendmsg::<()>(ready_fd, &iov, &cmsgs, MsgFlags::empty(), None);
    }

    fn drop_capabilities(retain: u64) -> Result<()> {
        const PR_CAPBSET_DROP: libc::c_int = 24;
        const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;

        for cap in 0..64u64 {
            if retain & (1 << cap) != 0 {
                continue;
            }
            let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap, 0, 0, 0) };
            if rc != 0 {
                let errno = std::io::Error::last_os_error();
                match errno.raw_os_error() {
                    // Past the last supported capability.
                    Some(libc::EINVAL) => break,
                    Some(libc::EPERM) => {
                        return Err(Error::PermissionDenied(format!(
                            "dropping capability {}: {}",
                            cap, errno
                        )));
                    }
                    _ => {
                        return Err(Error::Internal(format!(
                            "prctl(PR_CAPBSET_DROP, {}): {}",
                            cap, errno
                        )));
                    }
                }
            }
        }

        let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(Error::Internal(format!(
                "prctl(PR_SET_NO_NEW_PRIVS): {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Blocking control loop; the supervisor is PID 1 of its namespace.
    fn supervisor_loop(control: StdUnixStream, seccomp: Option<seccompiler::BpfProgram>) {
        let writer = Arc::new(StdMutex::new(match control.try_clone() {
            Ok(w) => w,
            Err(_) => return,
        }));
        let mut reader = BufReader::new(control);
        let children: Arc<StdMutex<HashMap<u32, std::process::Child>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let mut line = String::new();
        loop {
            reap_tracked(&children);

            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    // Parent went away; terminate everything and exit.
                    shutdown_children(&children, Duration::from_secs(2));
                    std::process::exit(0);
                }
                Ok(_) => {}
                Err(_) => continue,
            }

            let request: SupervisorRequest = match serde_json::from_str(line.trim()) {
                Ok(r) => r,
                Err(_) => continue,
            };

            match request {
                SupervisorRequest::Spawn {
                    seq,
                    argv,
                    env,
                    wait,
                } => handle_spawn(seq, argv, env, wait, &seccomp, &writer, &children),
                SupervisorRequest::Kill { seq, pid } => {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                    respond(&writer, &SupervisorResponse::Ok { seq });
                }
                SupervisorRequest::Children { seq } => {
                    let pids = children
                        .lock()
                        .map(|c| c.keys().copied().collect())
                        .unwrap_or_default();
                    respond(&writer, &SupervisorResponse::Children { seq, pids });
                }
                SupervisorRequest::Shutdown { seq, grace_ms } => {
                    shutdown_children(&children, Duration::from_millis(grace_ms));
                    respond(&writer, &SupervisorResponse::Ok { seq });
                    std::process::exit(0);
                }
            }
        }
    }

    fn handle_spawn(
        seq: u64,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        wait: bool,
        seccomp: &Option<seccompiler::BpfProgram>,
        writer: &Arc<StdMutex<StdUnixStream>>,
        children: &Arc<StdMutex<HashMap<u32, std::process::Child>>>,
    ) {
        use std::process::Command;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env_clear()
            .envs(env.iter().cloned());
        if let Some(program) = seccomp.clone() {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(move || {
                    seccompiler::apply_filter(&program)
                        .map_err(|e| std::io::Error::other(e.to_string()))
                });
            }
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                respond(
                    writer,
                    &SupervisorResponse::Error {
                        seq,
                        message: format!("spawn failed: {}", e),
                    },
                );
                return;
            }
        };
        let pid = child.id();

        if wait {
            // Service the wait on a thread so kill/shutdown keep working.
            let writer = Arc::clone(writer);
            std::thread::spawn(move || {
                let mut child = child;
                let code = match child.wait() {
                    Ok(status) => exit_code(status),
                    Err(_) => 127,
                };
                respond(&writer, &SupervisorResponse::Exited { seq, pid, code });
            });
        } else {
            if let Ok(mut tracked) = children.lock() {
                tracked.insert(pid, child);
            }
            respond(writer, &SupervisorResponse::Spawned { seq, pid });
        }
    }

    fn exit_code(status: std::process::ExitStatus) -> i32 {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(127)
    }

    fn reap_tracked(children: &Arc<StdMutex<HashMap<u32, std::process::Child>>>) {
        if let Ok(mut tracked) = children.lock() {
            tracked.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        }
    }

    fn shutdown_children(
        children: &Arc<StdMutex<HashMap<u32, std::process::Child>>>,
        grace: Duration,
    ) {
        let pids: Vec<u32> = children
            .lock()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default();
        for pid in &pids {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(*pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }

        let deadline = std::time::Instant::now() + grace;
        loop {
            reap_tracked(children);
            let remaining = children.lock().map(|c| c.len()).unwrap_or(0);
            if remaining == 0 || std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        if let Ok(mut tracked) = children.lock() {
            for (_, child) in tracked.iter_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
            tracked.clear();
        }
    }

    fn respond(writer: &Arc<StdMutex<StdUnixStream>>, response: &SupervisorResponse) {
        if let (Ok(mut stream), Ok(mut json)) = (writer.lock(), serde_json::to_string(response)) {
            json.push('\n');
            let _ = stream.write_all(json.as_bytes());
        }
    }

    // =========================================================================
    // Parent-Side Supervisor Handle
    // =========================================================================

    /// Parent handle routing control responses by sequence number, so a
    /// long wait-spawn does not block kill or shutdown.
    pub struct LinuxSupervisor {
        writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
        pending: StdMutex<HashMap<u64, oneshot::Sender<SupervisorResponse>>>,
        seq: AtomicU64,
        init_pid: u32,
        cgroup_id: u64,
        cgroup_path: PathBuf,
        container_id: String,
    }

    impl LinuxSupervisor {
        fn start(
            control: UnixStream,
            init_pid: u32,
            cgroup_id: u64,
            cgroup_path: PathBuf,
            container_id: String,
        ) -> Arc<dyn Supervisor> {
            let (read_half, write_half) = control.into_split();
            let supervisor = Arc::new(Self {
                writer: Mutex::new(write_half),
                pending: StdMutex::new(HashMap::new()),
                seq: AtomicU64::new(1),
                init_pid,
                cgroup_id,
                cgroup_path,
                container_id,
            });

            let router = Arc::clone(&supervisor);
            tokio::spawn(async move {
                let mut lines = TokioBufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(response) = serde_json::from_str::<SupervisorResponse>(&line) {
                        let waiter = router
                            .pending
                            .lock()
                            .ok()
                            .and_then(|mut p| p.remove(&response.seq()));
                        if let Some(tx) = waiter {
                            let _ = tx.send(response);
                        }
                    }
                }
                // EOF: the supervisor exited; fail everything in flight.
                if let Ok(mut pending) = router.pending.lock() {
                    for (seq, tx) in pending.drain() {
                        let _ = tx.send(SupervisorResponse::Error {
                            seq,
                            message: "supervisor exited".to_string(),
                        });
                    }
                }
            });

            supervisor
        }

        async fn request(
            &self,
            request: SupervisorRequest,
            seq: u64,
        ) -> Result<SupervisorResponse> {
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .map_err(|_| Error::Internal("pending map poisoned".into()))?
                .insert(seq, tx);

            let mut json =
                serde_json::to_string(&request).map_err(|e| Error::Protocol(e.to_string()))?;
            json.push('\n');
            {
                let mut writer = self.writer.lock().await;
                if let Err(e) = writer.write_all(json.as_bytes()).await {
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.remove(&seq);
                    }
                    return Err(Error::NotRunning(format!(
                        "{}: control write failed: {}",
                        self.container_id, e
                    )));
                }
            }

            rx.await
                .map_err(|_| Error::NotRunning(self.container_id.clone()))
        }

        fn next_seq(&self) -> u64 {
            self.seq.fetch_add(1, Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Supervisor for LinuxSupervisor {
        fn cgroup_id(&self) -> u64 {
            self.cgroup_id
        }

        async fn spawn(
            &self,
            argv: &[String],
            envp: &[(String, String)],
            wait: bool,
        ) -> Result<SpawnOutcome> {
            let seq = self.next_seq();
            let response = self
                .request(
                    SupervisorRequest::Spawn {
                        seq,
                        argv: argv.to_vec(),
                        env: envp.to_vec(),
                        wait,
                    },
                    seq,
                )
                .await?;
            match response {
                SupervisorResponse::Spawned { pid, .. } => Ok(SpawnOutcome {
                    pid,
                    exit_code: None,
                }),
                SupervisorResponse::Exited { pid, code, .. } => Ok(SpawnOutcome {
                    pid,
                    exit_code: Some(code),
                }),
                SupervisorResponse::Error { message, .. } => Err(Error::SpawnFailed {
                    id: self.container_id.clone(),
                    reason: message,
                }),
                other => Err(Error::Protocol(format!(
                    "unexpected spawn response: {:?}",
                    other
                ))),
            }
        }

        async fn kill(&self, pid: u32) -> Result<()> {
            let seq = self.next_seq();
            match self
                .request(SupervisorRequest::Kill { seq, pid }, seq)
                .await?
            {
                SupervisorResponse::Ok { .. } => Ok(()),
                SupervisorResponse::Error { message, .. } => Err(Error::Internal(message)),
                other => Err(Error::Protocol(format!(
                    "unexpected kill response: {:?}",
                    other
                ))),
            }
        }

        async fn children(&self) -> Vec<u32> {
            let seq = self.next_seq();
            match self
                .request(SupervisorRequest::Children { seq }, seq)
                .await
            {
                Ok(SupervisorResponse::Children { pids, .. }) => pids,
                _ => Vec::new(),
            }
        }

        async fn shutdown(&self, grace: Duration) -> Result<()> {
            let seq = self.next_seq();
            let request = SupervisorRequest::Shutdown {
                seq,
                grace_ms: grace.as_millis() as u64,
            };
            let acknowledged =
                tokio::time::timeout(grace + Duration::from_secs(5), self.request(request, seq))
                    .await;

            match acknowledged {
                Ok(Ok(_)) => {
                    debug!(
                        "supervisor for '{}' acknowledged shutdown",
                        self.container_id
                    );
                }
                _ => {
                    warn!(
                        "supervisor for '{}' unresponsive, sending SIGKILL",
                        self.container_id
                    );
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(self.init_pid as i32),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
            }

            // Reap the supervisor so no zombie outlives the container.
            let init = nix::unistd::Pid::from_raw(self.init_pid as i32);
            let _ = tokio::task::spawn_blocking(move || {
                let _ = nix::sys::wait::waitpid(init, None);
            })
            .await;

            remove_cgroup(&self.cgroup_path)
        }
    }
}

// =============================================================================
// Non-Linux Stub
// =============================================================================

#[cfg(not(target_os = "linux"))]
mod imp {
    use crate::container::{ContainerBackend, ContainerConfig, Supervisor};
    use crate::error::{Error, Result};
    use crate::layer::{LayerComposer, LayerContext};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Stub backend for platforms without Linux namespaces.
    pub struct LinuxBackend {
        _private: (),
    }

    impl LinuxBackend {
        pub fn new() -> Self {
            Self { _private: () }
        }

        pub fn unavailable_reason(&self) -> Option<&str> {
            Some("namespace isolation requires Linux")
        }
    }

    impl Default for LinuxBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ContainerBackend for LinuxBackend {
        fn name(&self) -> &str {
            "linux"
        }

        fn is_available(&self) -> bool {
            false
        }

        async fn launch(
            &self,
            _config: &ContainerConfig,
            _ctx: &LayerContext,
            _composer: &LayerComposer,
        ) -> Result<Arc<dyn Supervisor>> {
            Err(Error::PermissionDenied(
                "namespace isolation requires Linux".into(),
            ))
        }
    }
}

pub use imp::LinuxBackend;
