//! File-backed snapshot store.
//!
//! Each snapshot is a directory under the store root holding `meta.json` and
//! `state.bin`. Sinks write into `<id>.tmp` and rename to `<id>` on close, so
//! a listed snapshot is always complete.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::SnapshotSink;

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Describes a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    /// Last log index covered by the snapshot.
    pub index: u64,
    pub term: u64,
    /// Voter ids of the configuration at `index`.
    pub voters: Vec<u64>,
    /// Address of every member, keyed by raft id.
    pub members: BTreeMap<u64, String>,
}

impl SnapshotMeta {
    pub fn new(index: u64, term: u64, voters: Vec<u64>, members: BTreeMap<u64, String>) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        Self {
            id: format!("{term:020}-{index:020}-{millis}"),
            index,
            term,
            voters,
            members,
        }
    }
}

pub struct FileSnapshotStore {
    root: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Opens (creating if needed) a store rooted at `root` that keeps the
    /// newest `retain` snapshots.
    pub fn open(root: impl Into<PathBuf>, retain: usize) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retain: retain.max(1),
        })
    }

    /// Starts a new snapshot. The returned sink must be closed or cancelled.
    pub fn create(&self, meta: SnapshotMeta) -> io::Result<FileSnapshotSink> {
        let final_dir = self.root.join(&meta.id);
        let tmp_dir = self.root.join(format!("{}{TMP_SUFFIX}", meta.id));
        fs::create_dir_all(&tmp_dir)?;
        let state = File::create(tmp_dir.join(STATE_FILE))?;
        debug!(id = %meta.id, index = meta.index, "creating snapshot");
        Ok(FileSnapshotSink {
            root: self.root.clone(),
            retain: self.retain,
            tmp_dir,
            final_dir,
            meta,
            state: Some(BufWriter::new(state)),
            finished: false,
        })
    }

    /// Lists complete snapshots, newest first.
    pub fn list(&self) -> io::Result<Vec<SnapshotMeta>> {
        list_snapshots(&self.root)
    }

    pub fn latest(&self) -> io::Result<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Opens the state of the snapshot with `id` for reading.
    pub fn open_state(&self, id: &str) -> io::Result<BufReader<File>> {
        File::open(self.root.join(id).join(STATE_FILE)).map(BufReader::new)
    }
}

fn list_snapshots(root: &Path) -> io::Result<Vec<SnapshotMeta>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !entry.file_type()?.is_dir() || name.ends_with(TMP_SUFFIX) {
            continue;
        }
        match read_meta(&entry.path()) {
            Ok(meta) => snapshots.push(meta),
            Err(err) => warn!(snapshot = %name, error = %err, "skipping unreadable snapshot"),
        }
    }
    snapshots.sort_by(|a, b| (b.term, b.index, &b.id).cmp(&(a.term, a.index, &a.id)));
    Ok(snapshots)
}

fn read_meta(dir: &Path) -> io::Result<SnapshotMeta> {
    let file = File::open(dir.join(META_FILE))?;
    serde_json::from_reader(BufReader::new(file)).map_err(io::Error::from)
}

fn reap_snapshots(root: &Path, retain: usize) -> io::Result<()> {
    for stale in list_snapshots(root)?.into_iter().skip(retain) {
        info!(id = %stale.id, "removing old snapshot");
        fs::remove_dir_all(root.join(&stale.id))?;
    }
    Ok(())
}

/// Sink writing one snapshot into a temporary directory.
pub struct FileSnapshotSink {
    root: PathBuf,
    retain: usize,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    meta: SnapshotMeta,
    state: Option<BufWriter<File>>,
    finished: bool,
}

impl FileSnapshotSink {
    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.state
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "snapshot sink already finished"))
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(&mut self) -> io::Result<()> {
        let state = self.state.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "snapshot sink already finished")
        })?;
        let file = state.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;

        let mut meta_file = File::create(self.tmp_dir.join(META_FILE))?;
        serde_json::to_writer_pretty(&mut meta_file, &self.meta)?;
        meta_file.sync_all()?;

        fs::rename(&self.tmp_dir, &self.final_dir)?;
        self.finished = true;
        info!(id = %self.meta.id, index = self.meta.index, "snapshot complete");

        if let Err(err) = reap_snapshots(&self.root, self.retain) {
            warn!(error = %err, "failed to reap old snapshots");
        }
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.state = None;
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match fs::remove_dir_all(&self.tmp_dir) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn meta(index: u64) -> SnapshotMeta {
        let members = BTreeMap::from([(7, "127.0.0.1:7000".to_string())]);
        SnapshotMeta::new(index, 1, vec![7], members)
    }

    #[test]
    fn closed_snapshot_is_listed_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path(), 2).unwrap();

        let mut sink = store.create(meta(5)).unwrap();
        sink.write_all(b"payload").unwrap();
        sink.close().unwrap();

        let latest = store.latest().unwrap().expect("snapshot listed");
        assert_eq!(latest.index, 5);
        assert_eq!(latest.members.get(&7).map(String::as_str), Some("127.0.0.1:7000"));

        let mut state = String::new();
        store.open_state(&latest.id).unwrap().read_to_string(&mut state).unwrap();
        assert_eq!(state, "payload");
    }

    #[test]
    fn unfinished_and_cancelled_snapshots_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path(), 2).unwrap();

        let mut pending = store.create(meta(3)).unwrap();
        pending.write_all(b"half").unwrap();
        assert!(store.list().unwrap().is_empty());

        pending.cancel().unwrap();
        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(pending.write_all(b"more").is_err());
    }

    #[test]
    fn keeps_only_newest_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path(), 2).unwrap();

        for index in [10, 20, 30] {
            let mut sink = store.create(meta(index)).unwrap();
            sink.write_all(b"{}").unwrap();
            sink.close().unwrap();
        }

        let indexes: Vec<u64> = store.list().unwrap().iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![30, 20]);
    }
}
