use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::work::DelayedWork;

/// A durable FIFO of [`DelayedWork`], kept in a sled database.
///
/// Items are keyed by sled's monotonic id generator, stored big endian so key order is insertion
/// order. Everything pushed is on disk once [`push`](DelayedWorkQueue::push) returns, so a depot
/// that crashes mid sync can replay the queue at startup.
#[derive(Debug, Clone)]
pub struct DelayedWorkQueue {
    db: sled::Db,
    path: PathBuf,
}

impl DelayedWorkQueue {
    /// opens (or creates) the queue stored at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        debug!("Opened delayed work queue at {} holding {} items", path.display(), db.len());
        Ok(DelayedWorkQueue {
            db,
            path: path.to_path_buf(),
        })
    }

    /// where the queue is stored
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// appends `work` to the queue and flushes it to disk
    pub fn push(&self, work: &DelayedWork) -> Result<()> {
        let id = self.db.generate_id()?;
        let value = serde_json::to_vec(work)?;
        self.db.insert(id.to_be_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    /// Removes and returns every queued item, oldest first.
    ///
    /// Nothing is removed until the whole queue was read. An entry that no longer decodes is
    /// logged and dropped, the rest are returned.
    pub fn drain(&self) -> Result<Vec<DelayedWork>> {
        let mut items = Vec::with_capacity(self.db.len());
        let mut taken = sled::Batch::default();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(work) => items.push(work),
                Err(e) => warn!(
                    "Dropping undecodable delayed work '{}': {}",
                    String::from_utf8_lossy(&value),
                    e
                ),
            }
            taken.remove(key);
        }
        self.db.apply_batch(taken)?;
        self.db.flush()?;
        Ok(items)
    }

    /// drops every queued item
    pub fn clear(&self) -> Result<()> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }

    /// the number of queued items
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.work");
        {
            let queue = DelayedWorkQueue::open(&path).unwrap();
            for i in 0..300 {
                queue.push(&DelayedWork::suite(&format!("<suite n='{}'/>", i))).unwrap();
            }
        }
        let queue = DelayedWorkQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 300);
        let items = queue.drain().unwrap();
        let expected: Vec<_> = (0..300)
            .map(|i| DelayedWork::suite(&format!("<suite n='{}'/>", i)))
            .collect();
        assert_eq!(items, expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn undecodable_entry_does_not_take_the_rest_with_it() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DelayedWorkQueue::open(&dir.path().join("depot.work")).unwrap();
        queue.push(&DelayedWork::suite("<a/>")).unwrap();
        let id = queue.db.generate_id().unwrap();
        queue.db.insert(id.to_be_bytes(), &b"not json"[..]).unwrap();
        queue.push(&DelayedWork::suite("<b/>")).unwrap();

        let items = queue.drain().unwrap();
        assert_eq!(items, vec![DelayedWork::suite("<a/>"), DelayedWork::suite("<b/>")]);
        assert!(queue.is_empty());
    }
}
