mod actor;
mod messages;

use crate::events::{Failure, Output};
use crate::types::{Args, Envs, Program};
use actor::Actor;
use bytes::Bytes;
use messages::ChildMessage;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::{io, process::ExitStatus, process::Stdio, time::Duration};
use tokio::{
    process,
    sync::{mpsc, oneshot},
};

/// What to launch.
#[derive(Clone, Debug, Default)]
pub struct CommandLine {
    pub program: Program,
    pub args: Args,
    pub envs: Envs,
    pub dir: Option<PathBuf>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<Bytes>,
}

/// Handle to a supervised child process.
///
/// The child runs in its own process group. Terminating it signals the whole group,
/// so nothing the child launched (an `srun` step, a container) is left behind.
/// When the last handle is dropped the group is killed.
#[derive(Clone)]
pub struct ChildHandle {
    sender: mpsc::UnboundedSender<ChildMessage>,
    pid: Option<u32>,
}

impl ChildHandle {
    pub fn spawn(cmd: CommandLine, output_tx: mpsc::UnboundedSender<Output>) -> io::Result<Self> {
        let mut command = process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.envs.iter().cloned())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &cmd.dir {
            command.current_dir(dir);
        }
        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and touches no memory shared with the parent.
        unsafe {
            command.pre_exec(|| {
                // a SIGKILLed coordinator cannot clean up, so ask the kernel to
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn()?;
        let pid = child.id();
        let (sender, inbox) = mpsc::unbounded_channel();
        Actor::spawn(inbox, output_tx, child, cmd.stdin);
        Ok(Self { sender, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn wait(&self) -> io::Result<ExitStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChildMessage::Wait { response: tx })
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub fn terminate(&self, grace: Duration) {
        let _ = self.sender.send(ChildMessage::Terminate { grace });
    }
}

/// Terminates the child, with a grace period, when dropped.
///
/// Lets a future that owns a child be dropped on timeout or cancellation without
/// leaking the process.
pub struct ChildGuard {
    handle: ChildHandle,
    grace: Duration,
}

impl ChildGuard {
    pub fn new(handle: ChildHandle, grace: Duration) -> Self {
        Self { handle, grace }
    }

    pub fn handle(&self) -> &ChildHandle {
        &self.handle
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.handle.terminate(self.grace);
    }
}

fn actor_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "child supervisor exited")
}

/// Exit code of a normally exited child, or why it has none.
pub fn exit_code(status: ExitStatus) -> Result<i32, Failure> {
    if let Some(code) = status.code() {
        Ok(code)
    } else if let Some(signal) = status.signal() {
        Err(Failure::Signal { signal })
    } else {
        Err(Failure::error(format!("child ended without status: {status}")))
    }
}

pub(crate) fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: plain syscall; a stale group id yields ESRCH, which is ignored.
        unsafe {
            libc::kill(-pid, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> CommandLine {
        CommandLine {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<Output>) -> Vec<u8> {
        let mut bytes = vec![];
        while let Some(out) = rx.recv().await {
            bytes.extend_from_slice(out.blob());
        }
        bytes
    }

    #[tokio::test]
    async fn output_and_exit_code() {
        let (tx, rx) = mpsc::unbounded_channel();
        let child = ChildHandle::spawn(sh("printf hello; exit 3"), tx).expect("spawn");
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), Ok(3));
        assert_eq!(collect(rx).await, b"hello");
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cmd = sh("cat");
        cmd.stdin = Some(Bytes::from_static(b"{\"job\":1}"));
        let child = ChildHandle::spawn(cmd, tx).expect("spawn");
        assert_eq!(exit_code(child.wait().await.unwrap()), Ok(0));
        assert_eq!(collect(rx).await, b"{\"job\":1}");
    }

    #[tokio::test]
    async fn terminate_signals_the_group() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let child = ChildHandle::spawn(sh("sleep 30"), tx).expect("spawn");
        let start = Instant::now();
        child.terminate(Duration::from_secs(5));
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), Err(Failure::Signal { signal: libc::SIGTERM }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let child =
            ChildHandle::spawn(sh("trap '' TERM; while :; do sleep 1; done"), tx).expect("spawn");
        child.terminate(Duration::from_millis(200));
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), Err(Failure::Signal { signal: libc::SIGKILL }));
    }

    #[tokio::test]
    async fn dropped_guard_reaps_the_child() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let child = ChildHandle::spawn(sh("sleep 30"), tx).expect("spawn");
        let pid = child.pid().expect("pid") as libc::pid_t;
        drop(ChildGuard::new(child, Duration::from_millis(100)));

        let deadline = Instant::now() + Duration::from_secs(3);
        // SAFETY: signal 0 only probes for existence
        while unsafe { libc::kill(pid, 0) } == 0 {
            assert!(Instant::now() < deadline, "child {pid} survived its guard");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cmd = CommandLine {
            program: "/nonexistent/tilejobs-test".into(),
            ..Default::default()
        };
        assert!(ChildHandle::spawn(cmd, tx).is_err());
    }
}
