//! Durable peer-set storage.
//!
//! A small sled tree holds the persisted reported-peer snapshot used for
//! cold-start bootstrap. Saves are queued and debounced on a background
//! task so a burst of gossip does not turn into a burst of disk writes;
//! load failures degrade to an empty set, never a crash.

use crate::types::ReportedPeer;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const PERSISTED_PEERS_TREE: &str = "persisted_peers";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Handle to the persisted peer set.
pub struct PeerStore {
    db: sled::Db,
    tree: sled::Tree,
    save_tx: mpsc::UnboundedSender<HashSet<ReportedPeer>>,
}

impl PeerStore {
    /// Open (or create) the store and start the debounced save task.
    pub fn open(path: &Path, debounce: Duration) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(PERSISTED_PEERS_TREE)?;

        let (save_tx, mut save_rx) = mpsc::unbounded_channel::<HashSet<ReportedPeer>>();
        let task_db = db.clone();
        let task_tree = tree.clone();
        tokio::spawn(async move {
            while let Some(mut latest) = save_rx.recv().await {
                // Coalesce: keep absorbing newer snapshots until the
                // queue stays quiet for the debounce window.
                loop {
                    tokio::select! {
                        _ = sleep(debounce) => break,
                        next = save_rx.recv() => match next {
                            Some(set) => latest = set,
                            None => break,
                        },
                    }
                }
                if let Err(e) = write_set(&task_db, &task_tree, &latest) {
                    warn!("persisting peer set failed: {}", e);
                } else {
                    debug!("persisted {} peer(s) to disk", latest.len());
                }
            }
        });

        Ok(Self { db, tree, save_tx })
    }

    /// Load the persisted set. Corrupt entries are skipped with a
    /// warning; a missing tree is simply an empty set.
    pub fn load(&self) -> HashSet<ReportedPeer> {
        let mut peers = HashSet::new();
        for entry in self.tree.iter() {
            let (key, value) = match entry {
                Ok(kv) => kv,
                Err(e) => {
                    warn!("reading persisted peers failed: {}", e);
                    break;
                }
            };
            match bincode::deserialize::<ReportedPeer>(&value) {
                Ok(peer) => {
                    peers.insert(peer);
                }
                Err(e) => {
                    warn!(
                        "skipping corrupt persisted peer '{}': {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                }
            }
        }
        if !peers.is_empty() {
            info!("loaded {} persisted peer(s)", peers.len());
        }
        peers
    }

    /// Queue a snapshot for a debounced write.
    pub fn queue_save(&self, set: HashSet<ReportedPeer>) {
        // Send failure means the save task is gone; nothing to do but
        // rely on the final save_now at shutdown.
        let _ = self.save_tx.send(set);
    }

    /// Write a snapshot immediately. Used at shutdown so the last state
    /// is not lost to the debounce window.
    pub fn save_now(&self, set: &HashSet<ReportedPeer>) -> Result<(), StoreError> {
        write_set(&self.db, &self.tree, set)
    }
}

fn write_set(
    db: &sled::Db,
    tree: &sled::Tree,
    set: &HashSet<ReportedPeer>,
) -> Result<(), StoreError> {
    tree.clear()?;
    for peer in set {
        let key = peer.address.full_address();
        let value = bincode::serialize(peer)?;
        tree.insert(key.as_bytes(), value)?;
    }
    db.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeAddress;

    fn sample(n: usize) -> HashSet<ReportedPeer> {
        (0..n)
            .map(|i| ReportedPeer::new(NodeAddress::new(format!("peer{}", i), 1000), i as i64))
            .collect()
    }

    #[tokio::test]
    async fn save_now_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::open(dir.path(), Duration::from_millis(50)).unwrap();

        let set = sample(3);
        store.save_now(&set).unwrap();
        assert_eq!(store.load(), set);
    }

    #[tokio::test]
    async fn queued_saves_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::open(dir.path(), Duration::from_millis(20)).unwrap();

        store.queue_save(sample(1));
        store.queue_save(sample(2));
        store.queue_save(sample(5));

        // Give the debounce window time to elapse and the write to land.
        sleep(Duration::from_millis(500)).await;
        assert_eq!(store.load().len(), 5);
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::open(dir.path(), Duration::from_millis(50)).unwrap();

        store.save_now(&sample(2)).unwrap();
        store
            .tree
            .insert(b"broken", b"not bincode at all".as_slice())
            .unwrap();

        assert_eq!(store.load().len(), 2);
    }

    #[tokio::test]
    async fn missing_data_degrades_to_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::open(dir.path(), Duration::from_millis(50)).unwrap();
        assert!(store.load().is_empty());
    }
}
