//! Marshaling onto the host-owned authoritative thread.
//!
//! The host owns one thread on which live state may be read and the mod
//! surface may be called. [`Authority::run`] queues a closure for that
//! thread and awaits its result; the host drains the queue with
//! [`AuthorityQueue::drain`] (once per frame) or hands a dedicated thread
//! to [`AuthorityQueue::serve`].

use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::error::{io_err, DaemonError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle for queueing work onto the authoritative thread.
#[derive(Clone)]
pub struct Authority {
    tx: mpsc::UnboundedSender<Job>,
}

/// Host side of the queue. Must only be driven from the authoritative thread.
pub struct AuthorityQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

/// New handle/queue pair.
pub fn channel() -> (Authority, AuthorityQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Authority { tx }, AuthorityQueue { rx })
}

impl Authority {
    /// Run `f` on the authoritative thread and wait for its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, DaemonError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| DaemonError::ChannelClosed("authority queue"))?;
        rx.await
            .map_err(|_| DaemonError::ChannelClosed("authority response"))
    }

    /// Start a dedicated named thread serving the queue, for hosts without
    /// a frame loop of their own.
    pub fn spawn_thread(name: &str) -> Result<(Authority, JoinHandle<()>), DaemonError> {
        let (authority, queue) = channel();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || queue.serve())
            .map_err(|e| io_err(name, e))?;
        Ok((authority, handle))
    }
}

impl AuthorityQueue {
    /// Run every job queued so far without blocking. Returns the job count.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Block the calling thread serving jobs until every [`Authority`]
    /// handle has been dropped.
    pub fn serve(mut self) {
        while let Some(job) = self.rx.blocking_recv() {
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_executes_on_the_serving_thread() {
        let (authority, handle) = Authority::spawn_thread("authority-test").expect("spawn");
        let name = authority
            .run(|| std::thread::current().name().map(str::to_string))
            .await
            .expect("run");
        assert_eq!(name.as_deref(), Some("authority-test"));
        drop(authority);
        handle.join().expect("join");
    }

    #[tokio::test]
    async fn drain_runs_queued_jobs() {
        let (authority, mut queue) = channel();
        let first = tokio::spawn({
            let authority = authority.clone();
            async move { authority.run(|| 1).await }
        });
        let second = tokio::spawn({
            let authority = authority.clone();
            async move { authority.run(|| 2).await }
        });
        let mut ran = 0;
        while ran < 2 {
            ran += queue.drain();
            tokio::task::yield_now().await;
        }
        assert_eq!(ran, 2);
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (authority, queue) = channel();
        drop(queue);
        let err = authority.run(|| ()).await.unwrap_err();
        assert!(matches!(err, DaemonError::ChannelClosed("authority queue")));
    }
}
