//! Watch stream demultiplexer.
//!
//! One producing task per watch session: consumes the typed event stream of
//! the NatsCluster collection, delivers Added/Modified/Deleted events to
//! the supervisor over a single-consumer channel in stream order, and
//! advances the resume cursor as objects are observed. The server closes
//! watch responses periodically; a clean close reopens at the current
//! cursor, and transport hiccups or server error statuses reopen the same
//! way after a backoff. An expired-history status ends the session so the
//! supervisor can relist; only an undecodable frame is unrecoverable.
//! Every exit path drops the stream handle, which releases the underlying
//! response.

use std::sync::Arc;

use crds::NatsCluster;
use futures::{pin_mut, Stream, StreamExt};
use k8s_gateway::ClusterGateway;
use kube::api::WatchEvent;
use kube::ResourceExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backoff::FibonacciBackoff;

const RETRY_MIN_SECS: u64 = 1;
const RETRY_MAX_SECS: u64 = 30;

/// A data event observed on the NatsCluster collection.
#[derive(Debug)]
pub enum ClusterEvent {
    Added(NatsCluster),
    Modified(NatsCluster),
    Deleted(NatsCluster),
}

/// Why a watch session ended.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The resume cursor fell out of the server's history window.
    #[error("watch history expired; relist required")]
    HistoryExpired,

    /// The server ended the stream with an error status other than history
    /// expiry. Transient (5xx and friends); the pump reopens after backoff.
    #[error("unexpected watch status {code}: {message}")]
    Status { code: u16, message: String },

    /// A frame failed to decode.
    #[error("malformed watch event: {0}")]
    Malformed(String),

    /// Transport-level failure on the stream. Transient; the pump reopens
    /// after backoff.
    #[error("watch transport error: {0}")]
    Transport(String),
}

enum SessionEnd {
    /// Server closed the response; reopen at the current cursor.
    Closed,
    /// The supervisor dropped the receiving end; stop producing.
    ConsumerGone,
}

/// Runs watch sessions against the cluster collection until the consumer
/// goes away or the stream fails unrecoverably. Transient failures back
/// off and reopen at the current cursor, so no delivered event is lost.
pub async fn pump(
    gateway: Arc<ClusterGateway>,
    namespace: String,
    mut cursor: String,
    tx: mpsc::Sender<ClusterEvent>,
) -> Result<(), WatchError> {
    let mut backoff = FibonacciBackoff::new(RETRY_MIN_SECS, RETRY_MAX_SECS);

    loop {
        debug!("opening cluster watch at cursor {cursor}");
        let stream = match gateway.watch_clusters(&namespace, &cursor).await {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next_backoff();
                warn!("failed to open cluster watch: {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        pin_mut!(stream);

        match drain(&mut stream, &mut cursor, &tx).await {
            Ok(SessionEnd::Closed) => {
                backoff.reset();
                debug!("watch stream closed by server; resuming at cursor {cursor}");
            }
            Ok(SessionEnd::ConsumerGone) => return Ok(()),
            Err(err @ (WatchError::Transport(_) | WatchError::Status { .. })) => {
                let delay = backoff.next_backoff();
                warn!("watch interrupted: {err}; resuming at cursor {cursor} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(fatal) => return Err(fatal),
        }
    }
}

/// Demultiplexes one open watch response into typed events.
async fn drain<S>(
    stream: &mut S,
    cursor: &mut String,
    tx: &mpsc::Sender<ClusterEvent>,
) -> Result<SessionEnd, WatchError>
where
    S: Stream<Item = Result<WatchEvent<NatsCluster>, kube::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(WatchEvent::Added(cluster)) => {
                advance(cursor, &cluster);
                ClusterEvent::Added(cluster)
            }
            Ok(WatchEvent::Modified(cluster)) => {
                advance(cursor, &cluster);
                ClusterEvent::Modified(cluster)
            }
            Ok(WatchEvent::Deleted(cluster)) => {
                advance(cursor, &cluster);
                ClusterEvent::Deleted(cluster)
            }
            Ok(WatchEvent::Bookmark(bookmark)) => {
                // Bookmarks carry no payload, only a fresher cursor.
                *cursor = bookmark.metadata.resource_version.clone();
                continue;
            }
            Ok(WatchEvent::Error(status)) => {
                if status.code == http::StatusCode::GONE.as_u16() {
                    return Err(WatchError::HistoryExpired);
                }
                return Err(WatchError::Status {
                    code: status.code,
                    message: status.message,
                });
            }
            Err(kube::Error::SerdeError(e)) => return Err(WatchError::Malformed(e.to_string())),
            Err(e) => return Err(WatchError::Transport(e.to_string())),
        };

        if tx.send(event).await.is_err() {
            warn!("event consumer went away; stopping watch");
            return Ok(SessionEnd::ConsumerGone);
        }
    }
    Ok(SessionEnd::Closed)
}

fn advance(cursor: &mut String, observed: &NatsCluster) {
    if let Some(version) = observed.resource_version() {
        *cursor = version;
    }
}
