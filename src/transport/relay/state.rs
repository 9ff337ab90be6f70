use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::debug;

// Time allowed for queued frames and the websocket close to drain on a graceful shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything spawned for one relay session.
///
/// Reader-side tasks are aborted outright on shutdown; writer-side tasks get a short window
/// to flush and close the socket. Dropping the session aborts everything.
#[derive(Default)]
pub(crate) struct RelaySession {
    pub(crate) outbound: Option<mpsc::Sender<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
}

impl RelaySession {
    pub(crate) fn push_reader(&mut self, task: JoinHandle<()>) {
        self.readers.push(task);
    }

    pub(crate) fn push_writer(&mut self, task: JoinHandle<()>) {
        self.writers.push(task);
    }

    pub(crate) async fn shutdown(mut self) {
        for task in self.readers.drain(..) {
            task.abort();
            let _ = task.await;
        }
        // Writers exit once every sender is gone.
        self.outbound = None;
        for task in self.writers.drain(..) {
            let abort = task.abort_handle();
            if timeout(DRAIN_TIMEOUT, task).await.is_err() {
                debug!(target: "cln_rs::relay", "writer did not drain in time");
                abort.abort();
            }
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        for task in self.readers.iter().chain(self.writers.iter()) {
            task.abort();
        }
    }
}
