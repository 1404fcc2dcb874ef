use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub(crate) enum Command {
    Stop(oneshot::Sender<()>),
}

/// Owner's side of a session task
pub(crate) struct ActorHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ActorHandle {
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedReceiver<Command>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        Self {
            commands,
            task: tokio::spawn(run(rx)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the task to release its resources and wait until it has
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Session task ended abnormally");
        }
    }
}
