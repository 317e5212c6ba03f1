//! Storage engine tests against real filesystem trees.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mtpd::{
    DeviceInfoProvider, FormatCategory, MtpData, NullThumbnailerService, ObjectFormatCode,
    ObjectInfo, PropertyRegistry, StandardEventCode, StandardResponseCode, StorageConfig,
    StorageFactory, StorageId, StorageType, ThumbnailerService, OBJ_PROP_OBJECT_FILE_NAME,
    OBJ_PROP_PERSISTENT_UNIQUE_ID, OBJ_PROP_REP_SAMPLE_DATA,
};

const ALL_HANDLES: u32 = 0xFFFF_FFFF;

fn make_file(path: &Path, content: &[u8]) {
    fs::write(path, content).unwrap();
}

/// The canonical test tree: three files and a Music folder at the root,
/// two sibling subdirectories, one nested.
fn setup_tree(root: &Path) {
    fs::create_dir_all(root.join("subdir1/subdir3")).unwrap();
    fs::create_dir_all(root.join("subdir2")).unwrap();
    fs::create_dir_all(root.join("Music")).unwrap();

    make_file(&root.join("file1"), b"a");
    make_file(&root.join("file2"), b"aaaaaa");
    make_file(&root.join("file3"), &[b'a'; 100]);

    for dir in ["subdir1", "subdir1/subdir3"] {
        make_file(&root.join(dir).join("file1"), b"a");
        make_file(&root.join(dir).join("file2"), b"aaaaaa");
        make_file(&root.join(dir).join("file3"), &[b'a'; 100]);
    }

    make_file(&root.join("subdir2/fileA"), b"a");
    make_file(&root.join("subdir2/fileB"), b"aaaaaa");
    make_file(&root.join("subdir2/fileC"), &[b'a'; 100]);

    for song in ["song1.mp3", "song2.mp3", "song3.mp3", "song4.mp3"] {
        make_file(&root.join("Music").join(song), b"\xff\xfa\x10\xc4");
    }
}

struct Fixture {
    factory: StorageFactory,
    storage_id: StorageId,
    root: PathBuf,
    _dirs: Vec<tempfile::TempDir>,
}

fn fixture() -> Fixture {
    fixture_with_service(Box::new(NullThumbnailerService))
}

fn fixture_with_service(service: Box<dyn ThumbnailerService>) -> Fixture {
    let storage_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let root = storage_dir.path().join("storage1");
    setup_tree(&root);

    let mut factory = StorageFactory::new(Some(db_dir.path().to_owned()));
    let storage_id = factory
        .add_storage(
            StorageConfig {
                path: root.clone(),
                storage_type: StorageType::FixedRam,
                volume_label: "storage1".into(),
                description: "Test storage".into(),
                exclude_paths: Vec::new(),
            },
            service,
        )
        .unwrap();
    factory.enumerate_storages();
    assert!(factory.storage_is_ready());

    Fixture {
        factory,
        storage_id,
        root: root.canonicalize().unwrap(),
        _dirs: vec![storage_dir, db_dir],
    }
}

fn registry() -> PropertyRegistry {
    PropertyRegistry::new(&DeviceInfoProvider::new())
}

fn puoid_of(fixture: &mut Fixture, handle: u32) -> u128 {
    let registry = registry();
    let desc = registry
        .object_prop_desc(FormatCategory::Common, OBJ_PROP_PERSISTENT_UNIQUE_ID)
        .unwrap();
    match fixture
        .factory
        .get_object_property_value(handle, desc)
        .unwrap()
    {
        MtpData::UINT128(puoid) => puoid,
        other => panic!("unexpected puoid value {:?}", other),
    }
}

#[test]
fn enumeration_builds_the_expected_graph() {
    let mut fixture = fixture();

    let roots = fixture
        .factory
        .object_handles(StorageId::all(), 0, ALL_HANDLES)
        .unwrap();
    assert_eq!(roots.len(), 6);

    let associations = fixture
        .factory
        .object_handles(
            StorageId::all(),
            ObjectFormatCode::Association.value(),
            0x0000_0000,
        )
        .unwrap();
    assert_eq!(associations.len(), 4);

    let all = fixture
        .factory
        .object_handles(StorageId::all(), 0, 0x0000_0000)
        .unwrap();
    // 16 files plus 4 directories; the root itself is not enumerated
    assert_eq!(all.len(), 20);

    let mp3s = fixture
        .factory
        .object_handles(StorageId::all(), ObjectFormatCode::Mp3.value(), 0x0000_0000)
        .unwrap();
    assert_eq!(mp3s.len(), 4);
}

#[test]
fn handle_and_path_indexes_agree() {
    let mut fixture = fixture();
    let all = fixture
        .factory
        .object_handles(StorageId::all(), 0, 0x0000_0000)
        .unwrap();
    for handle in all {
        let path = fixture.factory.path(handle).unwrap();
        assert_eq!(fixture.factory.handle_for_path(&path), Some(handle));
    }
}

#[test]
fn object_info_reflects_the_filesystem() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file3"))
        .unwrap();
    let info = fixture.factory.object_info(handle).unwrap();
    assert_eq!(info.filename, "file3");
    assert_eq!(info.compressed_size, 100);
    assert_eq!(info.object_format, 0x3000);

    let music = fixture
        .factory
        .handle_for_path(&fixture.root.join("Music/song1.mp3"))
        .unwrap();
    let info = fixture.factory.object_info(music).unwrap();
    assert_eq!(info.object_format, ObjectFormatCode::Mp3.value());
    assert!(!info.modification_date.is_empty());
}

#[test]
fn add_item_writes_and_reads_back() {
    let mut fixture = fixture();
    let info = ObjectInfo {
        filename: "addfile".into(),
        compressed_size: 3,
        ..Default::default()
    };
    let (_, parent, handle) = fixture
        .factory
        .add_item(fixture.storage_id, ALL_HANDLES, &info)
        .unwrap();
    assert_eq!(parent, 0); // placed in the root

    fixture
        .factory
        .write_data(handle, Some(b"xxx"), true, false)
        .unwrap();
    fixture.factory.write_data(handle, None, false, true).unwrap();

    assert_eq!(fs::read(fixture.root.join("addfile")).unwrap(), b"xxx");
    let back = fixture.factory.object_info(handle).unwrap();
    assert_eq!(back.filename, "addfile");
    assert_eq!(back.compressed_size, 3);

    let mut buf = [0u8; 3];
    fixture.factory.read_data(handle, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"xxx");
}

#[test]
fn add_item_rejects_bad_names_and_collisions() {
    let mut fixture = fixture();
    let bad = ObjectInfo {
        filename: "a/b".into(),
        ..Default::default()
    };
    assert_eq!(
        fixture
            .factory
            .add_item(fixture.storage_id, ALL_HANDLES, &bad)
            .unwrap_err(),
        StandardResponseCode::InvalidDataset
    );

    let collision = ObjectInfo {
        filename: "file1".into(),
        ..Default::default()
    };
    assert_eq!(
        fixture
            .factory
            .add_item(fixture.storage_id, ALL_HANDLES, &collision)
            .unwrap_err(),
        StandardResponseCode::InvalidDataset
    );
}

#[test]
fn root_is_never_deletable() {
    let mut fixture = fixture();
    assert_eq!(
        fixture.factory.delete_item(0, 0).unwrap_err(),
        StandardResponseCode::ObjectWriteProtected
    );
}

#[test]
fn deleting_a_directory_removes_its_subtree() {
    let mut fixture = fixture();
    let subdir1 = fixture
        .factory
        .handle_for_path(&fixture.root.join("subdir1"))
        .unwrap();
    let nested_file = fixture
        .factory
        .handle_for_path(&fixture.root.join("subdir1/subdir3/file2"))
        .unwrap();

    fixture.factory.delete_item(subdir1, 0).unwrap();

    assert!(fixture.factory.check_handle(subdir1).is_err());
    assert!(fixture.factory.check_handle(nested_file).is_err());
    assert!(!fixture.root.join("subdir1").exists());
}

#[test]
fn wildcard_delete_honors_the_format_filter() {
    let mut fixture = fixture();
    fixture
        .factory
        .delete_item(ALL_HANDLES, ObjectFormatCode::Mp3.value())
        .unwrap();

    let mp3s = fixture
        .factory
        .object_handles(StorageId::all(), ObjectFormatCode::Mp3.value(), 0x0000_0000)
        .unwrap();
    assert!(mp3s.is_empty());
    // everything else survives, including the now empty Music folder
    assert!(fixture
        .factory
        .handle_for_path(&fixture.root.join("Music"))
        .is_some());
    assert!(fixture
        .factory
        .handle_for_path(&fixture.root.join("file1"))
        .is_some());
}

#[test]
fn filename_property_renames_the_backing_file() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file1"))
        .unwrap();

    let registry = registry();
    let desc = registry
        .object_prop_desc(FormatCategory::Common, OBJ_PROP_OBJECT_FILE_NAME)
        .unwrap();

    fixture
        .factory
        .set_object_property_value(handle, &[(desc, MtpData::STR("renamed".into()))])
        .unwrap();

    assert!(!fixture.root.join("file1").exists());
    assert!(fixture.root.join("renamed").exists());
    assert_eq!(
        fixture.factory.path(handle).unwrap(),
        fixture.root.join("renamed")
    );
    match fixture.factory.get_object_property_value(handle, desc) {
        Ok(MtpData::STR(name)) => assert_eq!(name, "renamed"),
        other => panic!("unexpected filename value {:?}", other),
    }

    // a slash can not become part of a filename
    assert_eq!(
        fixture
            .factory
            .set_object_property_value(handle, &[(desc, MtpData::STR("a/b".into()))])
            .unwrap_err(),
        StandardResponseCode::InvalidObjectPropValue
    );
}

#[test]
fn move_within_a_storage_keeps_handles_and_content() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file2"))
        .unwrap();
    let target = fixture
        .factory
        .handle_for_path(&fixture.root.join("subdir2"))
        .unwrap();

    fixture
        .factory
        .move_object(handle, target, fixture.storage_id)
        .unwrap();

    let moved = fixture.root.join("subdir2/file2");
    assert!(moved.exists());
    assert!(!fixture.root.join("file2").exists());
    assert_eq!(fixture.factory.path(handle).unwrap(), moved);
    assert_eq!(fs::read(&moved).unwrap(), b"aaaaaa");
}

#[test]
fn cross_storage_move_preserves_the_handle() {
    let mut fixture = fixture();
    let second_dir = tempfile::tempdir().unwrap();
    let second_root = second_dir.path().join("storage2");
    fs::create_dir_all(second_root.join("dir1")).unwrap();

    let second_id = fixture
        .factory
        .add_storage(
            StorageConfig {
                path: second_root.clone(),
                storage_type: StorageType::RemovableRam,
                volume_label: "storage2".into(),
                description: "Second storage".into(),
                exclude_paths: Vec::new(),
            },
            Box::new(NullThumbnailerService),
        )
        .unwrap();
    fixture.factory.enumerate_storages();
    let second_root = second_root.canonicalize().unwrap();

    let source = fixture.root.join("fileToMove");
    make_file(&source, b"0123456789abcdef01234567");
    fixture.factory.process_fs_events(Instant::now());
    fixture.factory.take_events();
    let handle = fixture.factory.handle_for_path(&source).unwrap();

    let destination_dir = fixture
        .factory
        .handle_for_path(&second_root.join("dir1"))
        .unwrap();
    fixture
        .factory
        .move_object(handle, destination_dir, second_id)
        .unwrap();

    // same handle, new storage, identical bytes
    assert!(fixture.factory.handle_for_path(&source).is_none());
    let new_path = second_root.join("dir1/fileToMove");
    assert_eq!(fixture.factory.handle_for_path(&new_path), Some(handle));
    assert_eq!(fs::read(&new_path).unwrap(), b"0123456789abcdef01234567");
    assert_eq!(
        fixture.factory.object_info(handle).unwrap().storage_id,
        second_id.0
    );
}

#[test]
fn copy_within_a_storage_allocates_a_fresh_handle() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file3"))
        .unwrap();
    let target = fixture
        .factory
        .handle_for_path(&fixture.root.join("subdir2"))
        .unwrap();

    let copied = fixture
        .factory
        .copy_object(handle, target, fixture.storage_id)
        .unwrap();
    assert_ne!(copied, handle);

    let original = fixture.factory.object_info(handle).unwrap();
    let copy = fixture.factory.object_info(copied).unwrap();
    assert_eq!(copy.filename, original.filename);
    assert_eq!(copy.compressed_size, original.compressed_size);
    assert_eq!(copy.object_format, original.object_format);
    assert_eq!(
        fs::read(fixture.root.join("subdir2/file3")).unwrap(),
        fs::read(fixture.root.join("file3")).unwrap()
    );
}

#[test]
fn copying_a_directory_into_itself_is_refused() {
    let mut fixture = fixture();
    let subdir1 = fixture
        .factory
        .handle_for_path(&fixture.root.join("subdir1"))
        .unwrap();
    let nested = fixture
        .factory
        .handle_for_path(&fixture.root.join("subdir1/subdir3"))
        .unwrap();

    assert_eq!(
        fixture
            .factory
            .copy_object(subdir1, nested, fixture.storage_id)
            .unwrap_err(),
        StandardResponseCode::InvalidParentObject
    );
}

#[test]
fn partial_writes_land_at_their_offset() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file3"))
        .unwrap();

    fixture
        .factory
        .write_partial_data(handle, 10, b"HELLO", true, true)
        .unwrap();

    let mut buf = [0u8; 5];
    fixture.factory.read_data(handle, 10, &mut buf).unwrap();
    assert_eq!(&buf, b"HELLO");
    // surrounding bytes are untouched
    fixture.factory.read_data(handle, 5, &mut buf).unwrap();
    assert_eq!(&buf, b"aaaaa");
}

#[test]
fn truncate_updates_the_cached_size() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file3"))
        .unwrap();
    fixture.factory.truncate_item(handle, 7).unwrap();
    assert_eq!(fixture.factory.object_info(handle).unwrap().compressed_size, 7);
    assert_eq!(fs::metadata(fixture.root.join("file3")).unwrap().len(), 7);
}

#[test]
fn references_are_pruned_when_targets_disappear() {
    let mut fixture = fixture();
    let playlist = fixture
        .factory
        .handle_for_path(&fixture.root.join("Music/song1.mp3"))
        .unwrap();
    let kept = fixture
        .factory
        .handle_for_path(&fixture.root.join("Music/song2.mp3"))
        .unwrap();
    let doomed = fixture
        .factory
        .handle_for_path(&fixture.root.join("Music/song3.mp3"))
        .unwrap();

    fixture
        .factory
        .set_references(playlist, &[kept, doomed])
        .unwrap();
    fixture.factory.delete_item(doomed, 0).unwrap();
    assert_eq!(fixture.factory.get_references(playlist).unwrap(), vec![kept]);
}

#[test]
fn unknown_reference_targets_are_rejected() {
    let mut fixture = fixture();
    let playlist = fixture
        .factory
        .handle_for_path(&fixture.root.join("Music/song1.mp3"))
        .unwrap();
    assert_eq!(
        fixture
            .factory
            .set_references(playlist, &[0xDEAD_BEEF])
            .unwrap_err(),
        StandardResponseCode::InvalidObjectReference
    );
}

#[test]
fn puoids_survive_a_restart() {
    let storage_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let root = storage_dir.path().join("storage1");
    setup_tree(&root);

    let build = |db: &Path, root: &Path| -> StorageFactory {
        let mut factory = StorageFactory::new(Some(db.to_owned()));
        factory
            .add_storage(
                StorageConfig {
                    path: root.to_owned(),
                    storage_type: StorageType::FixedRam,
                    volume_label: "storage1".into(),
                    description: "Test storage".into(),
                    exclude_paths: Vec::new(),
                },
                Box::new(NullThumbnailerService),
            )
            .unwrap();
        factory.enumerate_storages();
        factory
    };

    let canonical = {
        let mut factory = build(db_dir.path(), &root);
        let canonical = factory
            .handle_for_path(&root.canonicalize().unwrap().join("file1"))
            .unwrap();
        let mut fixture = Fixture {
            factory,
            storage_id: StorageId::new(1, 1),
            root: root.canonicalize().unwrap(),
            _dirs: Vec::new(),
        };
        let puoid = puoid_of(&mut fixture, canonical);
        fixture.factory.shutdown();
        puoid
    };

    let factory = build(db_dir.path(), &root);
    let mut fixture = Fixture {
        factory,
        storage_id: StorageId::new(1, 1),
        root: root.canonicalize().unwrap(),
        _dirs: Vec::new(),
    };
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file1"))
        .unwrap();
    assert_eq!(puoid_of(&mut fixture, handle), canonical);

    // distinct objects have distinct ids
    let other = fixture
        .factory
        .handle_for_path(&fixture.root.join("file2"))
        .unwrap();
    assert_ne!(puoid_of(&mut fixture, other), canonical);
}

#[test]
fn symlinks_are_denied_by_default() {
    let storage_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let root = storage_dir.path().join("storage1");
    setup_tree(&root);
    std::os::unix::fs::symlink(root.join("file1"), root.join("link1")).unwrap();

    let mut factory = StorageFactory::new(Some(db_dir.path().to_owned()));
    factory
        .add_storage(
            StorageConfig {
                path: root.clone(),
                storage_type: StorageType::FixedRam,
                volume_label: "storage1".into(),
                description: "Test storage".into(),
                exclude_paths: Vec::new(),
            },
            Box::new(NullThumbnailerService),
        )
        .unwrap();
    factory.enumerate_storages();

    let canonical_root = root.canonicalize().unwrap();
    assert!(factory.handle_for_path(&canonical_root.join("link1")).is_none());
    assert!(factory.handle_for_path(&canonical_root.join("file1")).is_some());
}

#[test]
fn excluded_paths_are_not_exported() {
    let storage_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let root = storage_dir.path().join("storage1");
    setup_tree(&root);

    let mut factory = StorageFactory::new(Some(db_dir.path().to_owned()));
    factory
        .add_storage(
            StorageConfig {
                path: root.clone(),
                storage_type: StorageType::FixedRam,
                volume_label: "storage1".into(),
                description: "Test storage".into(),
                exclude_paths: vec!["subdir2".into()],
            },
            Box::new(NullThumbnailerService),
        )
        .unwrap();
    factory.enumerate_storages();

    let canonical_root = root.canonicalize().unwrap();
    assert!(factory.handle_for_path(&canonical_root.join("subdir2")).is_none());
    assert!(factory
        .handle_for_path(&canonical_root.join("subdir2/fileA"))
        .is_none());
    assert!(factory.handle_for_path(&canonical_root.join("subdir1")).is_some());
}

#[test]
fn external_creation_is_observed_and_announced() {
    let mut fixture = fixture();
    fixture.factory.take_events();

    make_file(&fixture.root.join("dropped"), b"payload");
    std::thread::sleep(Duration::from_millis(50));
    fixture.factory.process_fs_events(Instant::now());

    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("dropped"))
        .expect("externally created file should be tracked");
    let events = fixture.factory.take_events();
    assert!(events
        .iter()
        .any(|ev| ev.code == StandardEventCode::ObjectAdded && ev.params == vec![handle]));
}

#[test]
fn external_deletion_is_observed_and_announced() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file1"))
        .unwrap();
    fixture.factory.take_events();

    fs::remove_file(fixture.root.join("file1")).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    fixture.factory.process_fs_events(Instant::now());

    assert!(fixture.factory.check_handle(handle).is_err());
    let events = fixture.factory.take_events();
    assert!(events
        .iter()
        .any(|ev| ev.code == StandardEventCode::ObjectRemoved && ev.params == vec![handle]));
}

#[test]
fn external_rename_is_a_move_not_a_delete() {
    let mut fixture = fixture();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file2"))
        .unwrap();
    // arm change events the way a host query would
    fixture.factory.object_info(handle).unwrap();
    fixture.factory.take_events();

    fs::rename(fixture.root.join("file2"), fixture.root.join("file2b")).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    fixture.factory.process_fs_events(Instant::now());

    assert_eq!(
        fixture.factory.handle_for_path(&fixture.root.join("file2b")),
        Some(handle)
    );
    let events = fixture.factory.take_events();
    assert!(events
        .iter()
        .any(|ev| ev.code == StandardEventCode::ObjectInfoChanged && ev.params == vec![handle]));
    assert!(!events
        .iter()
        .any(|ev| ev.code == StandardEventCode::ObjectRemoved));
}

#[test]
fn a_lone_moved_from_becomes_a_delete_after_the_grace_period() {
    let mut fixture = fixture();
    let outside = tempfile::tempdir().unwrap();
    let handle = fixture
        .factory
        .handle_for_path(&fixture.root.join("file3"))
        .unwrap();
    fixture.factory.take_events();

    fs::rename(fixture.root.join("file3"), outside.path().join("file3")).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    // first drain caches the unpaired MOVED_FROM
    fixture.factory.process_fs_events(Instant::now());
    assert!(fixture.factory.check_handle(handle).is_ok());

    // after the pairing window it is committed as an external delete
    fixture
        .factory
        .process_fs_events(Instant::now() + Duration::from_secs(1));
    assert!(fixture.factory.check_handle(handle).is_err());
    let events = fixture.factory.take_events();
    assert!(events
        .iter()
        .any(|ev| ev.code == StandardEventCode::ObjectRemoved && ev.params == vec![handle]));
}

/* =======================================================================
 * Thumbnails
 * ======================================================================= */

/// Completes every queued request immediately with a fixed JFIF payload.
struct InstantThumbService {
    dir: PathBuf,
    ready: Vec<(String, PathBuf)>,
}

const JFIF_STUB: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

impl ThumbnailerService for InstantThumbService {
    fn cached(&self, _uri: &str) -> Option<PathBuf> {
        None
    }

    fn queue(&mut self, uris: &[String], _mime_types: &[String]) {
        for (index, uri) in uris.iter().enumerate() {
            let thumb = self.dir.join(format!("thumb{}.jpg", index));
            fs::write(&thumb, JFIF_STUB).unwrap();
            self.ready.push((uri.clone(), thumb));
        }
    }

    fn poll_ready(&mut self) -> Vec<(String, PathBuf)> {
        std::mem::take(&mut self.ready)
    }
}

#[test]
fn representative_sample_arrives_after_the_thumbnailer_is_ready() {
    let thumb_dir = tempfile::tempdir().unwrap();
    let service = InstantThumbService {
        dir: thumb_dir.path().to_owned(),
        ready: Vec::new(),
    };
    let mut fixture = fixture_with_service(Box::new(service));

    let image_path = fixture.root.join("photo.jpg");
    make_file(&image_path, b"notreallyajpeg");
    std::thread::sleep(Duration::from_millis(50));
    fixture.factory.process_fs_events(Instant::now());
    let handle = fixture.factory.handle_for_path(&image_path).unwrap();
    fixture.factory.take_events();

    let registry = registry();
    let desc = registry
        .object_prop_desc(FormatCategory::Image, OBJ_PROP_REP_SAMPLE_DATA)
        .unwrap();

    // nothing generated yet: empty byte array, request queued
    match fixture.factory.get_object_property_value(handle, desc) {
        Ok(MtpData::AUINT8(data)) => assert!(data.is_empty()),
        other => panic!("unexpected sample value {:?}", other),
    }

    // past the startup delay the batch flushes and the stub completes
    fixture
        .factory
        .process_thumbnails(Instant::now() + Duration::from_secs(5));

    let events = fixture.factory.take_events();
    assert!(events.iter().any(|ev| {
        ev.code == StandardEventCode::ObjectPropChanged
            && ev.params == vec![handle, OBJ_PROP_REP_SAMPLE_DATA as u32]
    }));

    match fixture.factory.get_object_property_value(handle, desc) {
        Ok(MtpData::AUINT8(data)) => assert_eq!(data, JFIF_STUB),
        other => panic!("unexpected sample value {:?}", other),
    }
}
