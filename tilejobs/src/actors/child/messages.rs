use std::{io, process::ExitStatus, time::Duration};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum ChildMessage {
    /// Answered once the child has exited.
    Wait {
        response: oneshot::Sender<io::Result<ExitStatus>>,
    },
    /// SIGTERM the process group, then SIGKILL it if it is still alive after `grace`.
    Terminate { grace: Duration },
}
