//! Reliable Point-to-Point Messenger
//!
//! Queued, retrying delivery of coordination frames to named local datagram
//! destinations. Every `send` enqueues one job on a FIFO; a single
//! dispatcher task pulls the head only when no job is in flight, so at most
//! one send is active system-wide and same-destination sends from one
//! process arrive in order. A job retries transient write errors up to a
//! fixed budget with a fixed pause, reopening the destination socket each
//! time, under an overall wall-clock deadline.
//!
//! Exhausting the budget or the deadline ends the job without delivering and
//! without telling the caller; callers that need delivery confirmation build
//! request/response correlation on top (see `wire::RequestId`), never on the
//! messenger's own return path.

use crate::fdpass;
use crate::{IpcError, Result};
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};
use wire::Message;

/// Messenger retry and deadline knobs
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Attempts per job before giving up
    pub retries: u32,
    /// Pause between attempts; the destination socket is reopened after it
    pub retry_delay: Duration,
    /// Wall-clock bound for one job, regardless of remaining retries
    pub send_deadline: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_delay: Duration::from_millis(100),
            send_deadline: Duration::from_secs(10),
        }
    }
}

/// Delivery counters, updated by the dispatcher task
#[derive(Debug, Default)]
pub struct MessengerStats {
    pub queued: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

/// Counter snapshot for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerStatsSnapshot {
    pub queued: u64,
    pub delivered: u64,
    pub dropped: u64,
}

impl MessengerStats {
    pub fn snapshot(&self) -> MessengerStatsSnapshot {
        MessengerStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Job {
    dest: PathBuf,
    frame: Vec<u8>,
    fd: Option<OwnedFd>,
}

/// Handle for enqueueing outbound frames; cheap to clone.
///
/// Dropping every handle closes the queue; the dispatcher drains what is
/// already enqueued and exits.
#[derive(Clone)]
pub struct Messenger {
    tx: mpsc::UnboundedSender<Job>,
    stats: Arc<MessengerStats>,
}

impl Messenger {
    /// Start the dispatcher task and return the sending handle
    pub fn spawn(config: MessengerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(MessengerStats::default());
        tokio::spawn(dispatch(rx, config, Arc::clone(&stats)));
        Self { tx, stats }
    }

    /// Queue one message for delivery to `dest`
    pub fn send(&self, dest: PathBuf, message: &Message) -> Result<()> {
        self.enqueue(dest, message, None)
    }

    /// Queue one message that carries an open descriptor
    pub fn send_with_fd(&self, dest: PathBuf, message: &Message, fd: OwnedFd) -> Result<()> {
        self.enqueue(dest, message, Some(fd))
    }

    fn enqueue(&self, dest: PathBuf, message: &Message, fd: Option<OwnedFd>) -> Result<()> {
        let frame = wire::encode(message)?;
        trace!(dest = %dest.display(), opcode = %message.opcode(), "queueing frame");
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Job { dest, frame, fd })
            .map_err(|_| IpcError::transport("messenger dispatcher is gone"))
    }

    pub fn stats(&self) -> MessengerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Single consumer of the job queue: one job in flight at any moment
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Job>,
    config: MessengerConfig,
    stats: Arc<MessengerStats>,
) {
    while let Some(job) = rx.recv().await {
        if deliver(&job, &config).await {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                dest = %job.dest.display(),
                "dropping frame after retries exhausted or deadline passed"
            );
        }
    }
    debug!("messenger dispatcher finished");
}

async fn deliver(job: &Job, config: &MessengerConfig) -> bool {
    let attempts = async {
        for attempt in 1..=config.retries {
            match attempt_once(job).await {
                Ok(()) => {
                    trace!(dest = %job.dest.display(), attempt, "frame delivered");
                    return true;
                }
                Err(e) => {
                    debug!(
                        dest = %job.dest.display(),
                        attempt,
                        error = %e,
                        "send attempt failed"
                    );
                    if attempt < config.retries {
                        sleep(config.retry_delay).await;
                    }
                }
            }
        }
        false
    };

    // The deadline wins over any retries still in the budget.
    timeout(config.send_deadline, attempts)
        .await
        .unwrap_or(false)
}

async fn attempt_once(job: &Job) -> std::io::Result<()> {
    // A fresh unbound socket per attempt: reopening is the recovery step
    // for a destination that rebound its socket file.
    let socket = UnixDatagram::unbound()?;
    match &job.fd {
        Some(fd) => {
            fdpass::send_to(&socket, &job.frame, Some(fd.as_fd()), &job.dest).await?;
        }
        None => {
            socket.send_to(&job.frame, &job.dest).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wire::Message;

    fn quick_config() -> MessengerConfig {
        MessengerConfig {
            retries: 3,
            retry_delay: Duration::from_millis(10),
            send_deadline: Duration::from_millis(500),
        }
    }

    // Stats are updated by the dispatcher after the send syscall, so poll
    // briefly instead of racing the increment.
    async fn await_stats(
        messenger: &Messenger,
        check: impl Fn(MessengerStatsSnapshot) -> bool,
    ) {
        let started = Instant::now();
        while !check(messenger.stats()) {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "stats never converged: {:?}",
                messenger.stats()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn recv_one(socket: &UnixDatagram) -> Message {
        let mut buf = vec![0u8; wire::MAX_FRAME];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        wire::decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn same_destination_sends_stay_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("orderly.ipc");
        let receiver = UnixDatagram::bind(&dest).unwrap();

        let messenger = Messenger::spawn(quick_config());
        for kid in 1..=5 {
            messenger
                .send(dest.clone(), &Message::KidCompletedStartup { kid })
                .unwrap();
        }

        for expected in 1..=5 {
            match recv_one(&receiver).await {
                Message::KidCompletedStartup { kid } => assert_eq!(kid, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        await_stats(&messenger, |stats| stats.delivered == 5).await;
    }

    #[tokio::test]
    async fn dead_destination_does_not_block_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dir.path().join("nobody-home.ipc");
        let live = dir.path().join("alive.ipc");
        let receiver = UnixDatagram::bind(&live).unwrap();

        let messenger = Messenger::spawn(quick_config());
        messenger
            .send(dead, &Message::KidCompletedStartup { kid: 1 })
            .unwrap();
        messenger
            .send(live.clone(), &Message::KidCompletedStartup { kid: 2 })
            .unwrap();

        // The dead job burns its retries, then the live one goes through.
        let started = Instant::now();
        let msg = tokio::time::timeout(Duration::from_secs(5), recv_one(&receiver))
            .await
            .expect("queue must keep making progress");
        assert_eq!(msg, Message::KidCompletedStartup { kid: 2 });
        assert!(started.elapsed() < Duration::from_secs(5));

        await_stats(&messenger, |stats| stats.dropped == 1 && stats.delivered == 1).await;
    }

    #[tokio::test]
    async fn deadline_caps_a_job_regardless_of_budget() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dir.path().join("void.ipc");

        let messenger = Messenger::spawn(MessengerConfig {
            retries: 1_000,
            retry_delay: Duration::from_millis(20),
            send_deadline: Duration::from_millis(100),
        });
        messenger
            .send(dead, &Message::KidCompletedStartup { kid: 9 })
            .unwrap();

        let started = Instant::now();
        while messenger.stats().dropped == 0 {
            assert!(
                started.elapsed() < Duration::from_secs(2),
                "job should have been abandoned at the deadline"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
