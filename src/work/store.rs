use std::io::{BufRead, BufReader, Read, Write};

use parking_lot::Mutex;
use serde_json::Deserializer;
use tracing::{debug, instrument};

use super::DelayedWork;
use crate::Result;

/// The depot's data store, as seen by the work pipeline and the sync commands.
///
/// Implementations must be safe to share between the worker threads and the connection threads
/// that serve `SYNC` requests.
pub trait Store: Send + Sync + 'static {
    /// applies one unit of work (a report insert or a suite update)
    fn apply(&self, work: &DelayedWork) -> Result<()>;

    /// Writes a consistent snapshot of the whole store to `out`.
    ///
    /// A depot answering `SYNC` calls this while its work queue is locked, so nothing is applied
    /// while the snapshot is taken.
    fn write_snapshot(&self, out: &mut dyn Write) -> Result<()>;

    /// Replaces the contents of the store with a snapshot written by
    /// [`write_snapshot`](Store::write_snapshot). Returns the number of items loaded.
    fn load_snapshot(&self, input: &mut dyn Read) -> Result<usize>;
}

/// An in-memory [`Store`] that keeps every applied item, in order.
///
/// Snapshots are JSON lines, one serialized [`DelayedWork`] per line.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Vec<DelayedWork>>,
}

impl MemoryStore {
    /// creates an empty store
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// a copy of everything applied so far
    pub fn items(&self) -> Vec<DelayedWork> {
        self.items.lock().clone()
    }

    /// the number of items applied so far
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// true if nothing has been applied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn apply(&self, work: &DelayedWork) -> Result<()> {
        debug!("Applying {}", work);
        self.items.lock().push(work.clone());
        Ok(())
    }

    #[instrument(skip_all)]
    fn write_snapshot(&self, out: &mut dyn Write) -> Result<()> {
        let items = self.items.lock();
        for item in items.iter() {
            serde_json::to_writer(&mut *out, item)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        debug!("Wrote snapshot of {} items", items.len());
        Ok(())
    }

    #[instrument(skip_all)]
    fn load_snapshot(&self, input: &mut dyn Read) -> Result<usize> {
        let mut loaded = Vec::new();
        let reader = BufReader::new(input);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            for item in Deserializer::from_str(&line).into_iter::<DelayedWork>() {
                loaded.push(item?);
            }
        }
        let count = loaded.len();
        *self.items.lock() = loaded;
        debug!("Loaded snapshot of {} items", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_replaces_contents() {
        let source = MemoryStore::new();
        source.apply(&DelayedWork::suite("<suite/>")).unwrap();
        source
            .apply(&DelayedWork::report("host1", "ctx", "<report/>"))
            .unwrap();
        let mut snapshot = Vec::new();
        source.write_snapshot(&mut snapshot).unwrap();

        let target = MemoryStore::new();
        target.apply(&DelayedWork::suite("<stale/>")).unwrap();
        assert_eq!(target.load_snapshot(&mut snapshot.as_slice()).unwrap(), 2);
        assert_eq!(target.items(), source.items());
    }
}
