use super::messages::ChildMessage;
use super::signal_group;
use crate::events::Output;

use bytes::{Bytes, BytesMut};
use std::os::unix::process::ExitStatusExt;
use std::{io, process::ExitStatus};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Child,
    select,
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<ChildMessage>,
    pid: Option<u32>,
    exit: Option<io::Result<ExitStatus>>,
    waiters: Vec<oneshot::Sender<io::Result<ExitStatus>>>,
    kill_at: Option<Instant>,
    terminating: bool,
    inbox_open: bool,
}

impl Actor {
    pub fn spawn(
        inbox: mpsc::UnboundedReceiver<ChildMessage>,
        output_tx: mpsc::UnboundedSender<Output>,
        mut child: Child,
        stdin: Option<Bytes>,
    ) {
        let actor = Self {
            inbox,
            pid: child.id(),
            exit: None,
            waiters: Vec::new(),
            kill_at: None,
            terminating: false,
            inbox_open: true,
        };

        if let (Some(mut pipe), Some(input)) = (child.stdin.take(), stdin) {
            tokio::spawn(async move {
                // the child may close stdin early, that is its business
                let _ = pipe.write_all(&input).await;
            });
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pipe_output(stdout, output_tx.clone(), Output::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pipe_output(stderr, output_tx, Output::Stderr));
        }

        tokio::spawn(async move { actor.run(child).await });
    }

    async fn run(mut self, mut child: Child) {
        loop {
            let kill_at = self.kill_at;
            select! {
                maybe_msg = self.inbox.recv(), if self.inbox_open => {
                    match maybe_msg {
                        Some(ChildMessage::Wait { response }) => self.wait(response),
                        Some(ChildMessage::Terminate { grace }) => {
                            if self.exit.is_none() {
                                self.terminating = true;
                                signal_group(self.pid, libc::SIGTERM);
                                let deadline = Instant::now() + grace;
                                self.kill_at = Some(self.kill_at.map_or(deadline, |at| at.min(deadline)));
                            }
                        }
                        None => {
                            // every handle dropped, make sure nothing we started outlives us
                            if self.exit.is_some() {
                                return;
                            }
                            if self.kill_at.is_none() {
                                signal_group(self.pid, libc::SIGKILL);
                                if child.kill().await.is_ok() {
                                    self.exit = Some(Ok(ExitStatus::from_raw(libc::SIGKILL)));
                                }
                                return;
                            }
                            // a termination is in flight, let its grace period run out
                            self.inbox_open = false;
                        }
                    }
                }
                status = child.wait(), if self.exit.is_none() => {
                    self.exited(status);
                    if !self.inbox_open {
                        return;
                    }
                }
                _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() && self.exit.is_none() => {
                    self.kill_at = None;
                    signal_group(self.pid, libc::SIGKILL);
                    let _ = child.start_kill();
                }
            }
        }
    }

    fn wait(&mut self, response: oneshot::Sender<io::Result<ExitStatus>>) {
        match &self.exit {
            Some(exit) => {
                let _ = response.send(clone_exit(exit));
            }
            None => self.waiters.push(response),
        }
    }

    fn exited(&mut self, status: io::Result<ExitStatus>) {
        if self.terminating {
            // the leader is gone but the group may not be, and it was told to go
            signal_group(self.pid, libc::SIGKILL);
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(clone_exit(&status));
        }
        self.exit = Some(status);
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        // the runtime is shutting down under a live child; kill_on_drop only reaches the leader
        if self.exit.is_none() {
            signal_group(self.pid, libc::SIGKILL);
        }
    }
}

fn clone_exit(exit: &io::Result<ExitStatus>) -> io::Result<ExitStatus> {
    match exit {
        Ok(status) => Ok(*status),
        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
    }
}

async fn pipe_output<R>(mut reader: R, tx: mpsc::UnboundedSender<Output>, wrap: fn(Bytes) -> Output)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(n) if n > 0 => {
                // move the bytes out of buf and into a message
                let _ = tx.send(wrap(buf.split().freeze()));
            }
            _ => break,
        }
    }
}
