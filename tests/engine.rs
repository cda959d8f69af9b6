use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use big_s::S;
use byteorder::{LittleEndian, ReadBytesExt};
use findex::codec::{I32Codec, KeyCodec, StrCodec, UnitCodec, ValueCodec};
use findex::host::{Host, HostState};
use findex::roaring::RoaringBitmap;
use findex::vfs::mem::MemoryFileSystem;
use findex::vfs::{FileMeta, FileProperty, FileSystem, VfsEvent};
use findex::{
    without_waiting_for_smart_mode, Error, FileId, FileIndex, FileIndexOptions, IndexExtension,
    IndexId, IndexedFile, RebuildStatus, RegisterOutcome, Scope,
};
use tempfile::TempDir;

const PAIRS: IndexId<String, i32> = IndexId::new("pairs");
const NAMES: IndexId<String, ()> = IndexId::new("names");

/// Indexes `key=value` tokens out of the file content.
struct PairsExtension {
    version: i32,
}

impl IndexExtension<String, i32> for PairsExtension {
    fn name(&self) -> &'static str {
        "pairs"
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn index(&self, input: &IndexedFile<'_>) -> HashMap<String, i32> {
        let Some(content) = input.content else { return HashMap::new() };
        String::from_utf8_lossy(content)
            .split_whitespace()
            .filter_map(|token| {
                let (key, value) = token.split_once('=')?;
                Some((key.to_string(), value.parse().ok()?))
            })
            .collect()
    }

    fn key_codec(&self) -> Arc<dyn KeyCodec<String>> {
        Arc::new(StrCodec)
    }

    fn value_codec(&self) -> Arc<dyn ValueCodec<i32>> {
        Arc::new(I32Codec)
    }

    fn accepts(&self, file: &FileMeta) -> bool {
        !file.is_directory
    }
}

/// A content-less index over file names, updated synchronously with the
/// VFS events.
struct NamesExtension;

impl IndexExtension<String, ()> for NamesExtension {
    fn name(&self) -> &'static str {
        "names"
    }

    fn version(&self) -> i32 {
        1
    }

    fn index(&self, input: &IndexedFile<'_>) -> HashMap<String, ()> {
        let mut keys = HashMap::new();
        if let Some(name) = input.meta.path.file_name() {
            keys.insert(name.to_string_lossy().into_owned(), ());
        }
        keys
    }

    fn key_codec(&self) -> Arc<dyn KeyCodec<String>> {
        Arc::new(StrCodec)
    }

    fn value_codec(&self) -> Arc<dyn ValueCodec<()>> {
        Arc::new(UnitCodec)
    }

    fn accepts(&self, file: &FileMeta) -> bool {
        !file.is_directory
    }

    fn depends_on_file_content(&self) -> bool {
        false
    }
}

fn open_engine(root: &Path, fs: &Arc<MemoryFileSystem>, version: i32) -> FileIndex {
    open_engine_with(fs, version, FileIndexOptions::new(root))
}

fn open_engine_with(
    fs: &Arc<MemoryFileSystem>,
    version: i32,
    options: FileIndexOptions,
) -> FileIndex {
    let fs: Arc<dyn FileSystem> = fs.clone();
    let mut builder = FileIndex::builder(options, fs).unwrap();
    builder.register(PairsExtension { version }).unwrap();
    builder.register(NamesExtension).unwrap();
    builder.build().unwrap()
}

fn files_with_key(engine: &FileIndex, key: &str) -> Vec<FileId> {
    engine
        .get_containing_files(PAIRS, &key.to_string(), &Scope::everything())
        .unwrap()
        .iter()
        .collect()
}

fn values_of(engine: &FileIndex, key: &str) -> Vec<i32> {
    engine.get_values(PAIRS, &key.to_string(), &Scope::everything()).unwrap()
}

#[test]
fn register_fresh_writes_the_version_file() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());

    let dyn_fs: Arc<dyn FileSystem> = fs.clone();
    let mut builder = FileIndex::builder(FileIndexOptions::new(dir.path()), dyn_fs).unwrap();
    let outcome = builder.register(PairsExtension { version: 3 }).unwrap();
    assert_eq!(outcome, RegisterOutcome::Fresh);
    let engine = builder.build().unwrap();

    let mut version_file = File::open(dir.path().join("pairs").join("version")).unwrap();
    assert_eq!(version_file.read_i32::<LittleEndian>().unwrap(), 3);
    assert!(version_file.read_i64::<LittleEndian>().unwrap() > 0);
    assert_eq!(engine.rebuild_status("pairs"), Some(RebuildStatus::Ok));

    engine.dispose().unwrap();
}

#[test]
fn version_bump_wipes_the_index() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1 b=2");

    let engine = open_engine(dir.path(), &fs, 2);
    engine.notify(VfsEvent::Created { file });
    assert_eq!(values_of(&engine, "a"), vec![1]);
    engine.dispose().unwrap();

    // Reopening with the same version keeps the data.
    let engine = open_engine(dir.path(), &fs, 2);
    assert_eq!(values_of(&engine, "a"), vec![1]);
    engine.dispose().unwrap();

    // Bumping the version starts empty until a re-scan.
    let dyn_fs: Arc<dyn FileSystem> = fs.clone();
    let mut builder = FileIndex::builder(FileIndexOptions::new(dir.path()), dyn_fs).unwrap();
    assert_eq!(
        builder.register(PairsExtension { version: 3 }).unwrap(),
        RegisterOutcome::Rebuilt
    );
    let engine = builder.build().unwrap();

    let mut version_file = File::open(dir.path().join("pairs").join("version")).unwrap();
    assert_eq!(version_file.read_i32::<LittleEndian>().unwrap(), 3);
    assert!(values_of(&engine, "a").is_empty());

    // The re-scan path finds the file again.
    let unindexed = engine.unindexed_files_finder().find(fs.file(file)).unwrap();
    assert_eq!(unindexed.len(), 1);
    engine.request_reindex(file).unwrap();
    assert_eq!(values_of(&engine, "a"), vec![1]);

    engine.dispose().unwrap();
}

#[test]
fn corruption_marker_wipes_every_index() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });
    assert_eq!(values_of(&engine, "a"), vec![1]);
    engine.dispose().unwrap();

    File::create(dir.path().join("corruption.marker")).unwrap();

    let engine = open_engine(dir.path(), &fs, 3);
    assert!(values_of(&engine, "a").is_empty());
    assert!(!dir.path().join("corruption.marker").exists());
    engine.dispose().unwrap();
}

#[test]
fn update_then_query() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1 b=2");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });

    assert_eq!(files_with_key(&engine, "a"), vec![file]);
    assert_eq!(values_of(&engine, "a"), vec![1]);
    assert_eq!(values_of(&engine, "b"), vec![2]);

    let mut keys = engine.get_all_keys(PAIRS, &Scope::everything()).unwrap();
    keys.sort();
    assert_eq!(keys, vec![S("a"), S("b")]);

    engine.dispose().unwrap();
}

#[test]
fn content_change_losing_a_key() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1 b=2");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });
    assert_eq!(values_of(&engine, "b"), vec![2]);

    engine.notify(VfsEvent::BeforeContentChange { file });
    fs.set_content(file, "a=9");
    engine.notify(VfsEvent::ContentChanged { file });

    assert!(files_with_key(&engine, "b").is_empty());
    assert_eq!(values_of(&engine, "a"), vec![9]);

    engine.dispose().unwrap();
}

#[test]
fn deletion_erases_every_trace() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1 b=2");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });
    assert_eq!(files_with_key(&engine, "a"), vec![file]);

    engine.notify(VfsEvent::BeforeDeletion { file });
    fs.remove(file);

    assert!(files_with_key(&engine, "a").is_empty());
    assert!(files_with_key(&engine, "b").is_empty());
    assert!(!engine.files_to_update().contains(&file));

    engine.dispose().unwrap();
}

#[test]
fn unsaved_document_shadows_the_persisted_state() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1 b=2");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });
    assert_eq!(values_of(&engine, "a"), vec![1]);

    // Unsaved editor text shadows the file.
    let meta = fs.file(file).unwrap();
    engine.unsaved_documents().document_edited(meta, "a=42");
    assert_eq!(values_of(&engine, "a"), vec![42]);
    assert!(values_of(&engine, "b").is_empty());

    // Dropping the edits reverts to the persisted pairs.
    engine.unsaved_documents().document_dropped(file);
    assert_eq!(values_of(&engine, "a"), vec![1]);
    assert_eq!(values_of(&engine, "b"), vec![2]);

    engine.dispose().unwrap();
}

#[test]
fn requested_rebuild_runs_on_the_next_query() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });
    assert_eq!(values_of(&engine, "a"), vec![1]);

    engine.request_rebuild(PAIRS);
    assert_eq!(engine.rebuild_status("pairs"), Some(RebuildStatus::RequiresRebuild));

    assert!(values_of(&engine, "a").is_empty());
    assert_eq!(engine.rebuild_status("pairs"), Some(RebuildStatus::Ok));

    engine.dispose().unwrap();
}

#[test]
fn intersection_equals_the_pairwise_containing_files() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let f1 = fs.add_file("f1.pairs", "x=1 y=1");
    let f2 = fs.add_file("f2.pairs", "x=1");
    let f3 = fs.add_file("f3.pairs", "y=1 x=2");

    let engine = open_engine(dir.path(), &fs, 3);
    for file in [f1, f2, f3] {
        engine.notify(VfsEvent::Created { file });
    }

    let everything = Scope::everything();
    let with_x = engine.get_containing_files(PAIRS, &S("x"), &everything).unwrap();
    let with_y = engine.get_containing_files(PAIRS, &S("y"), &everything).unwrap();

    let mut intersected = RoaringBitmap::new();
    engine
        .process_files_containing_all_keys(
            PAIRS,
            &[S("x"), S("y")],
            &everything,
            None,
            &mut |file| {
                intersected.insert(file);
                true
            },
        )
        .unwrap();

    assert_eq!(intersected, with_x & with_y);
    assert_eq!(intersected.iter().collect::<Vec<_>>(), vec![f1, f3]);

    engine.dispose().unwrap();
}

#[test]
fn content_less_index_is_current_without_any_query_pipeline() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("notes.txt", "whatever");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file });

    // No force-update ran for the names index, it was updated with the
    // event itself.
    let containing = engine
        .get_containing_files(NAMES, &S("notes.txt"), &Scope::everything())
        .unwrap();
    assert!(containing.contains(file));

    // A rename moves the file to the new key.
    engine.notify(VfsEvent::BeforePropertyChange { file, property: FileProperty::Name });
    fs.rename(file, "renamed.txt");
    engine.notify(VfsEvent::PropertyChanged { file, property: FileProperty::Name });

    let old = engine.get_containing_files(NAMES, &S("notes.txt"), &Scope::everything()).unwrap();
    let new = engine.get_containing_files(NAMES, &S("renamed.txt"), &Scope::everything()).unwrap();
    assert!(old.is_empty());
    assert!(new.contains(file));

    engine.dispose().unwrap();
}

#[test]
fn scopes_clamp_query_results() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let f1 = fs.add_file("f1.pairs", "x=1");
    let f2 = fs.add_file("f2.pairs", "x=2");

    let engine = open_engine(dir.path(), &fs, 3);
    engine.notify(VfsEvent::Created { file: f1 });
    engine.notify(VfsEvent::Created { file: f2 });

    let scope = Scope::restricted_to([f1].into_iter().collect());
    let containing = engine.get_containing_files(PAIRS, &S("x"), &scope).unwrap();
    assert_eq!(containing.iter().collect::<Vec<_>>(), vec![f1]);
    assert_eq!(engine.get_values(PAIRS, &S("x"), &scope).unwrap(), vec![1]);

    let mut visited = Vec::new();
    engine
        .process_values(PAIRS, &S("x"), None, &scope, &mut |file, value| {
            visited.push((file, *value));
            true
        })
        .unwrap();
    assert_eq!(visited, vec![(f1, 1)]);

    engine.dispose().unwrap();
}

#[test]
fn oversized_files_are_not_content_indexed() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("big.pairs", "a=1 b=2 c=3 d=4");

    let options = FileIndexOptions::new(dir.path()).with_size_limit(4);
    let engine = open_engine_with(&fs, 3, options);
    engine.notify(VfsEvent::Created { file });

    assert!(engine.files_to_update().is_empty());
    assert!(values_of(&engine, "a").is_empty());

    // The content-less names index still sees the file.
    let containing = engine
        .get_containing_files(NAMES, &S("big.pairs"), &Scope::everything())
        .unwrap();
    assert!(containing.contains(file));

    engine.dispose().unwrap();
}

#[test]
fn cancellation_keeps_files_scheduled() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1");
    let host = Arc::new(HostState::new());

    let dyn_fs: Arc<dyn FileSystem> = fs.clone();
    let mut builder = FileIndex::builder(FileIndexOptions::new(dir.path()), dyn_fs)
        .unwrap()
        .with_host(Arc::clone(&host) as Arc<dyn Host>);
    builder.register(PairsExtension { version: 3 }).unwrap();
    let engine = builder.build().unwrap();

    engine.notify(VfsEvent::Created { file });
    host.set_cancelled(true);
    match engine.get_values(PAIRS, &S("a"), &Scope::everything()) {
        Err(Error::Cancelled) => (),
        other => panic!("expected a cancellation, got {other:?}"),
    }
    assert!(engine.files_to_update().contains(&file));

    host.set_cancelled(false);
    assert_eq!(values_of(&engine, "a"), vec![1]);

    engine.dispose().unwrap();
}

#[test]
fn dumb_mode_fails_non_waiting_queries() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(MemoryFileSystem::new());
    let file = fs.add_file("f.pairs", "a=1");
    let host = Arc::new(HostState::new());

    let dyn_fs: Arc<dyn FileSystem> = fs.clone();
    let mut builder = FileIndex::builder(FileIndexOptions::new(dir.path()), dyn_fs)
        .unwrap()
        .with_host(Arc::clone(&host) as Arc<dyn Host>);
    builder.register(PairsExtension { version: 3 }).unwrap();
    let engine = builder.build().unwrap();

    engine.notify(VfsEvent::Created { file });
    host.set_dumb(true);
    let result = without_waiting_for_smart_mode(|| {
        engine.get_values(PAIRS, &S("a"), &Scope::everything())
    });
    match result {
        Err(Error::NotReady) => (),
        other => panic!("expected not-ready, got {other:?}"),
    }

    host.set_dumb(false);
    assert_eq!(values_of(&engine, "a"), vec![1]);

    engine.dispose().unwrap();
}
