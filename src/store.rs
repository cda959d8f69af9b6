//! On-disk lifecycle of the index root.
//!
//! Every index owns one directory under the root. The store tracks the
//! format version and creation stamp of each index in a small `version`
//! file, remembers the set of registered index names in a `registered`
//! sidecar so directories left behind by older versions can be swept, and
//! carries two whole-root markers: `corruption.marker`, written by hosts or
//! storage when the root must be considered broken, and
//! `work_in_progress.marker`, created at open and removed on clean shutdown
//! so that a crash forces a rebuild of everything.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use time::OffsetDateTime;

use crate::Result;

pub const VERSION_FILE: &str = "version";
const REGISTERED_FILE: &str = "registered";
const CORRUPTION_MARKER: &str = "corruption.marker";
const WORK_IN_PROGRESS_MARKER: &str = "work_in_progress.marker";

/// What happened to an index directory during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No previous on-disk state existed.
    Fresh,
    /// Compatible on-disk state was kept.
    Reopened,
    /// The directory was wiped: version mismatch or a corrupted root.
    Rebuilt,
}

pub struct VersionedStore {
    root: PathBuf,
    corrupted_at_startup: bool,
    registered: Mutex<Vec<String>>,
}

impl VersionedStore {
    /// Opens the index root, observing and arming the crash markers.
    pub fn open(root: impl Into<PathBuf>) -> Result<VersionedStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let corruption = root.join(CORRUPTION_MARKER);
        let work_in_progress = root.join(WORK_IN_PROGRESS_MARKER);
        let corrupted_at_startup = corruption.exists() || work_in_progress.exists();
        if corrupted_at_startup {
            tracing::warn!(
                root = %root.display(),
                "the index root is corrupted or was not shut down cleanly, \
                 every index will be rebuilt"
            );
        }
        File::create(&work_in_progress)?;

        Ok(VersionedStore { root, corrupted_at_startup, registered: Mutex::new(Vec::new()) })
    }

    pub fn corrupted_at_startup(&self) -> bool {
        self.corrupted_at_startup
    }

    pub fn index_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Reconciles one index directory with the version its extension
    /// reports. Wipes the directory when the versions disagree or the whole
    /// root was flagged corrupted.
    pub fn register_index(&self, name: &str, version: i32) -> Result<RegisterOutcome> {
        self.registered.lock().unwrap().push(name.to_string());

        let stored = self.read_version(name)?;
        let outcome = match stored {
            _ if self.corrupted_at_startup => RegisterOutcome::Rebuilt,
            Some((stored_version, _)) if stored_version != version => RegisterOutcome::Rebuilt,
            Some(_) => RegisterOutcome::Reopened,
            None => RegisterOutcome::Fresh,
        };

        match outcome {
            RegisterOutcome::Rebuilt => {
                self.wipe_index(name)?;
                self.write_version(name, version)?;
            }
            RegisterOutcome::Fresh => {
                self.write_version(name, version)?;
            }
            RegisterOutcome::Reopened => (),
        }

        Ok(outcome)
    }

    pub fn read_version(&self, name: &str) -> Result<Option<(i32, i64)>> {
        let path = self.index_path(name).join(VERSION_FILE);
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let version = file.read_i32::<LittleEndian>()?;
        let stamp = file.read_i64::<LittleEndian>()?;
        Ok(Some((version, stamp)))
    }

    /// Writes a fresh version file and returns the new creation stamp.
    pub fn write_version(&self, name: &str, version: i32) -> Result<i64> {
        let dir = self.index_path(name);
        fs::create_dir_all(&dir)?;
        let stamp = now_millis();
        let mut file = File::create(dir.join(VERSION_FILE))?;
        file.write_i32::<LittleEndian>(version)?;
        file.write_i64::<LittleEndian>(stamp)?;
        file.sync_all()?;
        Ok(stamp)
    }

    pub fn creation_stamp(&self, name: &str) -> Result<i64> {
        match self.read_version(name)? {
            Some((_, stamp)) => Ok(stamp),
            None => Ok(crate::NO_INDEXED_DATA_STAMP),
        }
    }

    pub fn wipe_index(&self, name: &str) -> Result<()> {
        match fs::remove_dir_all(self.index_path(name)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Ends a registration cycle: persists the registered-name sidecar,
    /// sweeps directories that belong to no live index, and consumes the
    /// corruption marker.
    pub fn finish_registration(&self) -> Result<()> {
        let registered = self.registered.lock().unwrap().clone();
        self.write_registered(&registered)?;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let directory = entry.file_name();
            let directory = directory.to_string_lossy();
            if !registered.iter().any(|name| name.as_str() == directory) {
                tracing::info!(index = %directory, "sweeping the directory of an unknown index");
                fs::remove_dir_all(entry.path())?;
            }
        }

        match fs::remove_file(self.root.join(CORRUPTION_MARKER)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn write_registered(&self, names: &[String]) -> Result<()> {
        let mut file = File::create(self.root.join(REGISTERED_FILE))?;
        file.write_i32::<BigEndian>(names.len() as i32)?;
        for name in names {
            file.write_u16::<BigEndian>(name.len() as u16)?;
            file.write_all(name.as_bytes())?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// The names persisted by the previous registration cycle.
    pub fn previously_registered(&self) -> Result<Vec<String>> {
        let mut file = match File::open(self.root.join(REGISTERED_FILE)) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let count = file.read_i32::<BigEndian>()?;
        let mut names = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let len = file.read_u16::<BigEndian>()? as usize;
            let mut bytes = vec![0; len];
            file.read_exact(&mut bytes)?;
            names.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(names)
    }

    /// Flags the whole root as broken; consumed at the next startup.
    pub fn write_corruption_marker(&self) -> Result<()> {
        File::create(self.root.join(CORRUPTION_MARKER))?;
        Ok(())
    }

    /// Removes the work-in-progress marker; only call once every index has
    /// been flushed and closed.
    pub fn mark_clean_shutdown(&self) -> Result<()> {
        match fs::remove_file(self.root.join(WORK_IN_PROGRESS_MARKER)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use big_s::S;
    use tempfile::TempDir;

    use super::*;

    fn clean_store(dir: &TempDir) -> VersionedStore {
        let store = VersionedStore::open(dir.path()).unwrap();
        store.mark_clean_shutdown().unwrap();
        store
    }

    #[test]
    fn fresh_then_reopened_then_rebuilt() {
        let dir = TempDir::new().unwrap();

        let store = clean_store(&dir);
        assert_eq!(store.register_index("words", 3).unwrap(), RegisterOutcome::Fresh);
        let (version, first_stamp) = store.read_version("words").unwrap().unwrap();
        assert_eq!(version, 3);
        assert!(first_stamp > 0);

        let store = clean_store(&dir);
        assert_eq!(store.register_index("words", 3).unwrap(), RegisterOutcome::Reopened);
        assert_eq!(store.read_version("words").unwrap().unwrap().1, first_stamp);

        let store = clean_store(&dir);
        assert_eq!(store.register_index("words", 4).unwrap(), RegisterOutcome::Rebuilt);
        assert_eq!(store.read_version("words").unwrap().unwrap().0, 4);
    }

    #[test]
    fn corruption_marker_rebuilds_matching_versions() {
        let dir = TempDir::new().unwrap();

        let store = clean_store(&dir);
        store.register_index("words", 3).unwrap();
        store.finish_registration().unwrap();
        store.mark_clean_shutdown().unwrap();
        store.write_corruption_marker().unwrap();

        let store = clean_store(&dir);
        assert!(store.corrupted_at_startup());
        assert_eq!(store.register_index("words", 3).unwrap(), RegisterOutcome::Rebuilt);
        store.finish_registration().unwrap();
        assert!(!dir.path().join(CORRUPTION_MARKER).exists());
    }

    #[test]
    fn unclean_shutdown_counts_as_corruption() {
        let dir = TempDir::new().unwrap();

        let store = VersionedStore::open(dir.path()).unwrap();
        store.register_index("words", 3).unwrap();
        drop(store); // no clean shutdown

        let store = VersionedStore::open(dir.path()).unwrap();
        assert!(store.corrupted_at_startup());
        assert_eq!(store.register_index("words", 3).unwrap(), RegisterOutcome::Rebuilt);
    }

    #[test]
    fn unknown_directories_are_swept() {
        let dir = TempDir::new().unwrap();

        let store = clean_store(&dir);
        store.register_index("words", 1).unwrap();
        store.register_index("names", 1).unwrap();
        store.finish_registration().unwrap();
        assert_eq!(store.previously_registered().unwrap(), vec![S("words"), S("names")]);
        store.mark_clean_shutdown().unwrap();

        let store = clean_store(&dir);
        store.register_index("names", 1).unwrap();
        store.finish_registration().unwrap();

        assert!(!dir.path().join("words").exists());
        assert!(dir.path().join("names").exists());
    }
}
