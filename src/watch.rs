//! Batching changed-path notifications into sync roots.
//!
//! A watcher reports paths one at a time. [`Batcher`] waits for the first
//! path, keeps collecting until the debounce window passes with nothing new,
//! then hands back the whole burst together with its [`resolve`]d root.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::config::SyncConfig;
use crate::resolver::resolve;

/// One burst of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Paths in arrival order, duplicates included.
    pub paths: Vec<String>,
    /// Smallest root covering the genuinely modified paths.
    pub root: String,
}

/// Debounces a stream of changed paths.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tokio::sync::mpsc;
/// use vfsync::watch::Batcher;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tx, rx) = mpsc::unbounded_channel();
/// let mut batcher = Batcher::new(rx, Duration::from_millis(10));
///
/// tx.send("/docs".to_string()).unwrap();
/// tx.send("/docs/a.txt".to_string()).unwrap();
///
/// let batch = batcher.next_batch().await.unwrap();
/// assert_eq!(batch.root, "/docs/a.txt");
/// # }
/// ```
#[derive(Debug)]
pub struct Batcher {
    events: mpsc::UnboundedReceiver<String>,
    window: Duration,
}

impl Batcher {
    /// Batch paths from `events`, flushing after `window` of quiet.
    #[must_use]
    pub const fn new(events: mpsc::UnboundedReceiver<String>, window: Duration) -> Self {
        Self { events, window }
    }

    /// Batch paths from `events` using the configured debounce window.
    #[must_use]
    pub const fn from_config(events: mpsc::UnboundedReceiver<String>, config: &SyncConfig) -> Self {
        Self::new(events, config.debounce())
    }

    /// Wait for the next burst.
    ///
    /// Returns `None` once the sender side is gone and nothing is pending.
    pub async fn next_batch(&mut self) -> Option<Batch> {
        let first = self.events.recv().await?;
        let mut paths = vec![first];

        loop {
            match timeout(self.window, self.events.recv()).await {
                Ok(Some(path)) => paths.push(path),
                // Window elapsed or the watcher went away: flush what we have.
                Ok(None) | Err(_) => break,
            }
        }

        let root = resolve(&paths);
        debug!(events = paths.len(), %root, "flushing watch burst");
        Some(Batch { paths, root })
    }
}
