//! Flood-controlled outbound queue.
//!
//! Every line costs one token from a per-server bucket (capacity 5, refill
//! 1/s by default); the writer blocks on an empty bucket. `PONG` and `QUIT`
//! bypass the bucket through a priority lane: PONG to preserve liveness,
//! QUIT to guarantee clean teardown. Multi-target commands are split per
//! the server's TARGMAX, and MODE batches stay within its MODES limit.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use governor::{Quota, RateLimiter};
use munin_proto::{Isupport, Message, ModeChange};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use super::stream::IrcStream;
use super::transport::LineCodec;
use crate::error::{AgentError, AgentResult};

/// Default token bucket capacity.
pub const DEFAULT_BURST: u32 = 5;
/// Default token refill per second.
pub const DEFAULT_REFILL: u32 = 1;
/// Normal lane depth before enqueues see backpressure.
const QUEUE_DEPTH: usize = 512;
/// One outgoing write may take at most this long.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

type DirectRateLimiter = governor::DefaultDirectRateLimiter;

/// Producer half of the send queue. Cheap to clone.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::Sender<Message>,
    priority_tx: mpsc::UnboundedSender<Message>,
    isupport: Arc<RwLock<Isupport>>,
}

/// Consumer half, owned by the writer task.
pub struct SendQueueWorker {
    rx: mpsc::Receiver<Message>,
    priority_rx: mpsc::UnboundedReceiver<Message>,
    limiter: DirectRateLimiter,
}

/// Create a send queue and its worker.
///
/// `isupport` is the writer-visible snapshot maintained by the reader task.
pub fn channel(isupport: Arc<RwLock<Isupport>>) -> (SendQueue, SendQueueWorker) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();

    let limiter = RateLimiter::direct(token_bucket_quota(DEFAULT_BURST, DEFAULT_REFILL));

    (
        SendQueue {
            tx,
            priority_tx,
            isupport,
        },
        SendQueueWorker {
            rx,
            priority_rx,
            limiter,
        },
    )
}

/// Bucket quota: refill `refill`/sec, capacity `burst`.
pub fn token_bucket_quota(burst: u32, refill: u32) -> Quota {
    let refill = NonZeroU32::new(refill).unwrap_or(nonzero!(1u32));
    let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1u32));
    Quota::per_second(refill).allow_burst(burst)
}

impl SendQueue {
    /// Enqueue a message, splitting multi-target commands first.
    ///
    /// Returns `RateLimited` when the normal lane is full; `PONG` and
    /// `QUIT` always go through.
    pub fn send(&self, msg: Message) -> AgentResult<()> {
        if is_priority(&msg) {
            return self
                .priority_tx
                .send(msg)
                .map_err(|_| AgentError::Io(std::io::Error::other("writer gone")));
        }

        for part in split_targets(msg, &self.isupport.read()) {
            self.tx.try_send(part).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => AgentError::RateLimited,
                mpsc::error::TrySendError::Closed(_) => {
                    AgentError::Io(std::io::Error::other("writer gone"))
                }
            })?;
        }
        Ok(())
    }

    /// Enqueue MODE changes for a target, batched within the MODES limit.
    pub fn send_modes(&self, target: &str, changes: &[ModeChange]) -> AgentResult<()> {
        let batches = {
            let isupport = self.isupport.read();
            batch_mode_changes(target, changes, isupport.max_modes())
        };
        for msg in batches {
            self.send(msg)?;
        }
        Ok(())
    }
}

impl SendQueueWorker {
    /// Drive the writer until `stop` flips, both lanes close, or a write
    /// fails. The worker survives reconnects: each connection hands in a
    /// fresh sink and a fresh stop signal.
    pub async fn run(
        &mut self,
        sink: FramedWrite<WriteHalf<IrcStream>, LineCodec>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> AgentResult<()> {
        let mut sink = sink;
        loop {
            tokio::select! {
                biased;

                _ = stop.changed() => {
                    // Drain the priority lane (QUIT lives there) on the way out.
                    while let Ok(msg) = self.priority_rx.try_recv() {
                        write_one(&mut sink, msg).await?;
                    }
                    return Ok(());
                }
                prio = self.priority_rx.recv() => match prio {
                    // Priority lane bypasses the bucket.
                    Some(msg) => write_one(&mut sink, msg).await?,
                    None => return Ok(()),
                },
                normal = self.rx.recv() => match normal {
                    Some(msg) => {
                        self.limiter.until_ready().await;
                        write_one(&mut sink, msg).await?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// The token bucket, for tests and introspection.
    #[cfg(test)]
    fn limiter(&self) -> &DirectRateLimiter {
        &self.limiter
    }
}

async fn write_one(
    sink: &mut FramedWrite<WriteHalf<IrcStream>, LineCodec>,
    msg: Message,
) -> AgentResult<()> {
    debug!(command = %msg.command, "tx");
    tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg))
        .await
        .map_err(|_| {
            warn!("Outgoing write timed out");
            AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timeout",
            ))
        })?
}

/// `PONG` and `QUIT` skip the token bucket.
fn is_priority(msg: &Message) -> bool {
    matches!(msg.command.as_str(), "PONG" | "QUIT")
}

/// Split a multi-target PRIVMSG/NOTICE per the server's TARGMAX.
fn split_targets(msg: Message, isupport: &Isupport) -> Vec<Message> {
    if !matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE") {
        return vec![msg];
    }
    let Some(targets) = msg.params.first() else {
        return vec![msg];
    };
    if !targets.contains(',') {
        return vec![msg];
    }
    let Some(limit) = isupport.targmax(&msg.command) else {
        return vec![msg];
    };

    let targets: Vec<&str> = targets.split(',').filter(|t| !t.is_empty()).collect();
    if targets.len() <= limit {
        return vec![msg];
    }

    targets
        .chunks(limit.max(1))
        .map(|chunk| {
            let mut params = msg.params.clone();
            params[0] = chunk.join(",");
            Message::new(msg.command.clone(), params)
        })
        .collect()
}

/// Group parameterised mode changes into MODE commands within `max_modes`.
pub fn batch_mode_changes(
    target: &str,
    changes: &[ModeChange],
    max_modes: usize,
) -> Vec<Message> {
    let mut out = Vec::new();

    for chunk in changes.chunks(max_modes.max(1)) {
        let mut modestring = String::new();
        let mut args: Vec<String> = Vec::new();
        let mut direction: Option<bool> = None;

        for change in chunk {
            if direction != Some(change.add) {
                modestring.push(if change.add { '+' } else { '-' });
                direction = Some(change.add);
            }
            modestring.push(change.mode);
            if let Some(arg) = &change.arg {
                args.push(arg.clone());
            }
        }

        let mut params = vec![target.to_string(), modestring];
        params.extend(args);
        out.push(Message::new("MODE", params));
    }

    out
}
