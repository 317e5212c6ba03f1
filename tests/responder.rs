//! End-to-end protocol tests: containers in, containers out, over the
//! dummy transporter.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use mtpd::{
    ContainerType, ControlEvent, DeviceInfoProvider, DeviceStatus, MtpWrite,
    NullThumbnailerService, ObjectInfo, Responder, StandardCommandCode, StandardEventCode,
    StandardResponseCode, StorageConfig, StorageFactory, StorageType, Transporter, TxContainer,
    CONTAINER_HEADER_SIZE, OBJ_PROP_NAME, OBJ_PROP_OBJECT_FILE_NAME, OBJ_PROP_OBJECT_SIZE,
};
use num_traits::ToPrimitive;

const SESSION: u32 = 1;
const ALL: u32 = 0xFFFF_FFFF;

/// Dummy transporter handle shared between the responder and the test.
#[derive(Clone, Default)]
struct SharedTransport {
    inner: Arc<Mutex<mtpd::DummyTransporter>>,
}

impl Transporter for SharedTransport {
    fn activate(&mut self) -> bool {
        self.inner.lock().unwrap().activate()
    }

    fn deactivate(&mut self) {
        self.inner.lock().unwrap().deactivate()
    }

    fn reset(&mut self) {
        self.inner.lock().unwrap().reset()
    }

    fn send_data(&mut self, data: &[u8], is_last_packet: bool) -> bool {
        self.inner.lock().unwrap().send_data(data, is_last_packet)
    }

    fn send_event(&mut self, data: &[u8]) -> bool {
        self.inner.lock().unwrap().send_event(data)
    }

    fn set_device_status(&mut self, status: DeviceStatus) {
        self.inner.lock().unwrap().set_device_status(status)
    }
}

impl SharedTransport {
    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sent_data.clear();
        inner.sent_events.clear();
    }

    /// The last response container sent, as (code, params).
    fn last_response(&self) -> (u16, Vec<u32>) {
        let inner = self.inner.lock().unwrap();
        let bytes = inner
            .sent_data
            .iter()
            .rev()
            .map(|(bytes, _)| bytes)
            .find(|bytes| container_type(bytes) == ContainerType::Response as u16)
            .expect("no response container sent");
        (
            LittleEndian::read_u16(&bytes[6..8]),
            bytes[CONTAINER_HEADER_SIZE..]
                .chunks_exact(4)
                .map(LittleEndian::read_u32)
                .collect(),
        )
    }

    /// Payload of the last data container sent, concatenated with any raw
    /// continuation chunks that followed it.
    fn last_data_payload(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let start = inner
            .sent_data
            .iter()
            .rposition(|(bytes, _)| container_type(bytes) == ContainerType::Data as u16)
            .expect("no data container sent");
        let mut payload = inner.sent_data[start].0[CONTAINER_HEADER_SIZE..].to_vec();
        for (bytes, _) in &inner.sent_data[start + 1..] {
            if container_type(bytes) == ContainerType::Response as u16 {
                break;
            }
            payload.extend_from_slice(bytes);
        }
        payload
    }

    fn events(&self) -> Vec<(u16, Vec<u32>)> {
        self.inner
            .lock()
            .unwrap()
            .sent_events
            .iter()
            .map(|bytes| {
                (
                    LittleEndian::read_u16(&bytes[6..8]),
                    bytes[CONTAINER_HEADER_SIZE..]
                        .chunks_exact(4)
                        .map(LittleEndian::read_u32)
                        .collect(),
                )
            })
            .collect()
    }
}

fn container_type(bytes: &[u8]) -> u16 {
    LittleEndian::read_u16(&bytes[4..6])
}

fn command_raw(code: u16, tid: u32, params: &[u32]) -> Vec<u8> {
    let mut container = TxContainer::new(ContainerType::Command, code, tid);
    for param in params {
        container.write_mtp_u32(*param).unwrap();
    }
    container.finish()
}

fn command(code: StandardCommandCode, tid: u32, params: &[u32]) -> Vec<u8> {
    command_raw(code.to_u16().unwrap(), tid, params)
}

fn data_bytes_raw(code: u16, tid: u32, payload: &[u8]) -> Vec<u8> {
    let mut container = TxContainer::new(ContainerType::Data, code, tid);
    std::io::Write::write_all(&mut container, payload).unwrap();
    container.finish()
}

fn data_bytes(code: StandardCommandCode, tid: u32, payload: &[u8]) -> Vec<u8> {
    data_bytes_raw(code.to_u16().unwrap(), tid, payload)
}

struct Rig {
    responder: Responder,
    transport: SharedTransport,
    root: PathBuf,
    _dirs: Vec<tempfile::TempDir>,
    tid: u32,
}

impl Rig {
    fn new() -> Rig {
        let storage_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let root = storage_dir.path().join("storage1");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("file1"), b"a").unwrap();
        fs::write(root.join("file2"), b"aaaaaa").unwrap();
        fs::write(root.join("hundred"), [b'a'; 100]).unwrap();
        fs::write(root.join("docs/readme.txt"), b"hello world").unwrap();

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

        let transport = SharedTransport::default();
        let mut responder = Responder::new(
            factory,
            DeviceInfoProvider::new(),
            Box::new(transport.clone()),
        );
        responder.startup();

        Rig {
            responder,
            transport,
            root: root.canonicalize().unwrap(),
            _dirs: vec![storage_dir, db_dir],
            tid: 0,
        }
    }

    fn next_tid(&mut self) -> u32 {
        self.tid += 1;
        self.tid
    }

    /// Sends a no-data-phase command and returns (code, params).
    fn request(&mut self, code: StandardCommandCode, params: &[u32]) -> (u16, Vec<u32>) {
        self.request_raw(code.to_u16().unwrap(), params)
    }

    fn request_raw(&mut self, code: u16, params: &[u32]) -> (u16, Vec<u32>) {
        self.transport.clear();
        let tid = self.next_tid();
        let bytes = command_raw(code, tid, params);
        self.responder.receive_container(&bytes, true, true);
        self.responder.service_timers();
        self.transport.last_response()
    }

    fn request_raw_with_data(
        &mut self,
        code: u16,
        params: &[u32],
        payload: &[u8],
    ) -> (u16, Vec<u32>) {
        self.transport.clear();
        let tid = self.next_tid();
        let bytes = command_raw(code, tid, params);
        self.responder.receive_container(&bytes, true, true);
        let data = data_bytes_raw(code, tid, payload);
        self.responder.receive_container(&data, true, true);
        self.responder.service_timers();
        self.transport.last_response()
    }

    /// Sends a command with a host-to-device data phase.
    fn request_with_data(
        &mut self,
        code: StandardCommandCode,
        params: &[u32],
        payload: &[u8],
    ) -> (u16, Vec<u32>) {
        self.transport.clear();
        let tid = self.next_tid();
        let bytes = command(code, tid, params);
        self.responder.receive_container(&bytes, true, true);
        let data = data_bytes(code, tid, payload);
        self.responder.receive_container(&data, true, true);
        self.responder.service_timers();
        self.transport.last_response()
    }

    fn open_session(&mut self) {
        let (code, _) = self.request(StandardCommandCode::OpenSession, &[SESSION]);
        assert_eq!(code, StandardResponseCode::Ok.value());
    }

    fn handle_of(&mut self, path: &Path) -> u32 {
        self.responder.storage().handle_for_path(path).unwrap()
    }
}

fn ok() -> u16 {
    StandardResponseCode::Ok.value()
}

#[test]
fn get_device_info_needs_no_session() {
    let mut rig = Rig::new();
    let (code, _) = rig.request(StandardCommandCode::GetDeviceInfo, &[]);
    assert_eq!(code, ok());

    let payload = rig.transport.last_data_payload();
    // standard version 100 leads the dataset
    assert_eq!(LittleEndian::read_u16(&payload[..2]), 100);
}

#[test]
fn most_operations_require_an_open_session() {
    let mut rig = Rig::new();
    let (code, _) = rig.request(StandardCommandCode::GetStorageIDs, &[]);
    assert_eq!(code, StandardResponseCode::SessionNotOpen.value());
}

#[test]
fn transaction_id_zero_is_rejected() {
    let mut rig = Rig::new();
    rig.open_session();
    rig.transport.clear();
    let bytes = command(StandardCommandCode::GetStorageIDs, 0, &[]);
    rig.responder.receive_container(&bytes, true, true);
    let (code, _) = rig.transport.last_response();
    assert_eq!(code, StandardResponseCode::InvalidTransactionId.value());
}

#[test]
fn session_lifecycle() {
    let mut rig = Rig::new();
    rig.open_session();

    // opening twice reports the already open session id
    let (code, params) = rig.request(StandardCommandCode::OpenSession, &[7]);
    assert_eq!(code, StandardResponseCode::SessionAlreadyOpen.value());
    assert_eq!(params, vec![SESSION]);

    let (code, _) = rig.request(StandardCommandCode::CloseSession, &[]);
    assert_eq!(code, ok());
    let (code, _) = rig.request(StandardCommandCode::CloseSession, &[]);
    assert_eq!(code, StandardResponseCode::SessionNotOpen.value());
}

#[test]
fn storage_discovery() {
    let mut rig = Rig::new();
    rig.open_session();

    let (code, _) = rig.request(StandardCommandCode::GetStorageIDs, &[]);
    assert_eq!(code, ok());
    let payload = rig.transport.last_data_payload();
    assert_eq!(LittleEndian::read_u32(&payload[..4]), 1);
    let storage_id = LittleEndian::read_u32(&payload[4..8]);
    assert_eq!(storage_id, 0x0001_0001);

    let (code, _) = rig.request(StandardCommandCode::GetStorageInfo, &[storage_id]);
    assert_eq!(code, ok());

    let (code, _) = rig.request(StandardCommandCode::GetStorageInfo, &[0x00BAD1D]);
    assert_eq!(code, StandardResponseCode::InvalidStorageId.value());
}

#[test]
fn object_listing_and_counting() {
    let mut rig = Rig::new();
    rig.open_session();

    let (code, params) = rig.request(StandardCommandCode::GetNumObjects, &[ALL, 0, ALL]);
    assert_eq!(code, ok());
    assert_eq!(params, vec![4]); // three files and one folder at the root

    let (code, _) = rig.request(StandardCommandCode::GetObjectHandles, &[ALL, 0, ALL]);
    assert_eq!(code, ok());
    let payload = rig.transport.last_data_payload();
    assert_eq!(LittleEndian::read_u32(&payload[..4]), 4);

    // handles are sorted ascending for host compatibility
    let handles: Vec<u32> = payload[4..]
        .chunks_exact(4)
        .map(LittleEndian::read_u32)
        .collect();
    let mut sorted = handles.clone();
    sorted.sort_unstable();
    assert_eq!(handles, sorted);
}

#[test]
fn object_info_round_trips_over_the_wire() {
    let mut rig = Rig::new();
    rig.open_session();
    let readme = rig.root.join("docs/readme.txt");
    let handle = rig.handle_of(&readme);

    let (code, _) = rig.request(StandardCommandCode::GetObjectInfo, &[handle]);
    assert_eq!(code, ok());
    let payload = rig.transport.last_data_payload();
    let info = ObjectInfo::decode(&mut std::io::Cursor::new(&payload[..])).unwrap();
    assert_eq!(info.filename, "readme.txt");
    assert_eq!(info.compressed_size, 11);
    assert_eq!(info.object_format, 0x3004); // text
}

#[test]
fn get_object_streams_the_content() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("docs/readme.txt").clone());

    let (code, _) = rig.request(StandardCommandCode::GetObject, &[handle]);
    assert_eq!(code, ok());
    assert_eq!(rig.transport.last_data_payload(), b"hello world");
}

#[test]
fn get_partial_object_clips_to_the_object_size() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("hundred").clone());

    let (code, params) = rig.request(StandardCommandCode::GetPartialObject, &[handle, 50, 1000]);
    assert_eq!(code, ok());
    assert_eq!(params, vec![50]);
    assert_eq!(rig.transport.last_data_payload().len(), 50);

    let (code, _) = rig.request(StandardCommandCode::GetPartialObject, &[handle, 200, 10]);
    assert_eq!(code, StandardResponseCode::InvalidParameter.value());
}

#[test]
fn send_object_info_then_send_object() {
    let mut rig = Rig::new();
    rig.open_session();

    let info = ObjectInfo {
        filename: "addfile".into(),
        compressed_size: 3,
        ..Default::default()
    };
    let mut payload = Vec::new();
    info.encode(&mut payload).unwrap();

    let (code, params) = rig.request_with_data(
        StandardCommandCode::SendObjectInfo,
        &[0x0001_0001, ALL],
        &payload,
    );
    assert_eq!(code, ok());
    assert_eq!(params.len(), 3);
    let handle = params[2];
    assert_ne!(handle, 0);

    let (code, _) = rig.request_with_data(StandardCommandCode::SendObject, &[], b"xxx");
    assert_eq!(code, ok());

    assert_eq!(fs::read(rig.root.join("addfile")).unwrap(), b"xxx");
    assert!(rig
        .transport
        .events()
        .iter()
        .any(|(code, params)| *code == StandardEventCode::ObjectAdded.to_u16().unwrap()
            && params == &vec![handle]));
}

#[test]
fn send_object_without_info_is_rejected() {
    let mut rig = Rig::new();
    rig.open_session();
    let (code, _) = rig.request_with_data(StandardCommandCode::SendObject, &[], b"xxx");
    assert_eq!(code, StandardResponseCode::NoValidObjectInfo.value());
}

#[test]
fn short_send_object_truncates_and_reports_incomplete() {
    let mut rig = Rig::new();
    rig.open_session();

    let info = ObjectInfo {
        filename: "short".into(),
        compressed_size: 10,
        ..Default::default()
    };
    let mut payload = Vec::new();
    info.encode(&mut payload).unwrap();
    let (code, _) = rig.request_with_data(
        StandardCommandCode::SendObjectInfo,
        &[0x0001_0001, ALL],
        &payload,
    );
    assert_eq!(code, ok());

    // only 3 of the declared 10 bytes arrive, and the container claims to
    // be complete
    let (code, _) = rig.request_with_data(StandardCommandCode::SendObject, &[], b"xxx");
    assert_eq!(code, StandardResponseCode::IncompleteTransfer.value());
    assert_eq!(fs::metadata(rig.root.join("short")).unwrap().len(), 0);
}

#[test]
fn cancel_during_send_object_deletes_the_partial_object() {
    let mut rig = Rig::new();
    rig.open_session();

    let info = ObjectInfo {
        filename: "cancelme".into(),
        compressed_size: 100,
        ..Default::default()
    };
    let mut payload = Vec::new();
    info.encode(&mut payload).unwrap();
    let (code, params) = rig.request_with_data(
        StandardCommandCode::SendObjectInfo,
        &[0x0001_0001, ALL],
        &payload,
    );
    assert_eq!(code, ok());
    let handle = params[2];

    // start the SendObject data phase but stop short of the declared size
    rig.transport.clear();
    let tid = rig.next_tid();
    let bytes = command(StandardCommandCode::SendObject, tid, &[]);
    rig.responder.receive_container(&bytes, true, true);
    let partial = data_bytes(StandardCommandCode::SendObject, tid, &[b'x'; 40]);
    rig.responder.receive_container(&partial, true, false);

    // host cancels on the control endpoint
    rig.responder.handle_control(ControlEvent::CancelTransaction);

    assert!(!rig.root.join("cancelme").exists());
    assert!(rig.responder.storage().check_handle(handle).is_err());

    // the next transaction proceeds normally
    let (code, _) = rig.request(StandardCommandCode::GetObjectHandles, &[ALL, 0, ALL]);
    assert_eq!(code, ok());
    let payload = rig.transport.last_data_payload();
    let handles: Vec<u32> = payload[4..]
        .chunks_exact(4)
        .map(LittleEndian::read_u32)
        .collect();
    assert!(!handles.contains(&handle));
}

#[test]
fn get_partial_object64_reports_the_transferred_length() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("hundred").clone());

    // offset 50, size 1000: clipped to the remaining 50 bytes
    let (code, params) = rig.request_raw(0x95C1, &[handle, 50, 0, 1000]);
    assert_eq!(code, ok());
    assert_eq!(params, vec![50]);
    assert_eq!(rig.transport.last_data_payload().len(), 50);

    // reading past the end is an error, not an empty success
    let (code, _) = rig.request_raw(0x95C1, &[handle, 200, 0, 10]);
    assert_eq!(code, StandardResponseCode::InvalidParameter.value());
}

#[test]
fn edit_object_write_and_truncate() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("hundred").clone());

    // SendPartialObject64 outside an edit session is refused
    let (code, _) = rig.request_raw_with_data(0x95C2, &[handle, 0, 0, 5], b"AAAAA");
    assert_eq!(code, StandardResponseCode::GeneralError.value());

    let (code, _) = rig.request_raw(0x95C4, &[handle]); // BeginEditObject
    assert_eq!(code, ok());

    let (code, _) = rig.request_raw_with_data(0x95C2, &[handle, 10, 0, 5], b"AAAAA");
    assert_eq!(code, ok());

    let (code, _) = rig.request_raw(0x95C3, &[handle, 20, 0]); // TruncateObject64
    assert_eq!(code, ok());

    let (code, _) = rig.request_raw(0x95C5, &[handle]); // EndEditObject
    assert_eq!(code, ok());

    let content = fs::read(rig.root.join("hundred")).unwrap();
    assert_eq!(content.len(), 20);
    assert_eq!(&content[10..15], b"AAAAA");
}

#[test]
fn delete_object_and_root_protection() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("file1").clone());

    let (code, _) = rig.request(StandardCommandCode::DeleteObject, &[handle, 0]);
    assert_eq!(code, ok());
    assert!(!rig.root.join("file1").exists());

    // handle 0 addresses the storage root
    let (code, _) = rig.request(StandardCommandCode::DeleteObject, &[0, 0]);
    assert_eq!(code, StandardResponseCode::ObjectWriteProtected.value());
}

#[test]
fn device_property_round_trip() {
    let mut rig = Rig::new();
    rig.open_session();

    const FRIENDLY_NAME: u32 = 0xD402;
    let (code, _) = rig.request(StandardCommandCode::GetDevicePropDesc, &[FRIENDLY_NAME]);
    assert_eq!(code, ok());

    let mut name = Vec::new();
    name.write_mtp_str("holiday photos").unwrap();
    let (code, _) = rig.request_with_data(
        StandardCommandCode::SetDevicePropValue,
        &[FRIENDLY_NAME],
        &name,
    );
    assert_eq!(code, ok());
    assert!(rig
        .transport
        .events()
        .iter()
        .any(|(code, params)| *code
            == StandardEventCode::DevicePropChanged.to_u16().unwrap()
            && params == &vec![FRIENDLY_NAME]));

    let (code, _) = rig.request(StandardCommandCode::GetDevicePropValue, &[FRIENDLY_NAME]);
    assert_eq!(code, ok());
    assert_eq!(rig.transport.last_data_payload(), name);

    let (code, _) = rig.request(StandardCommandCode::GetDevicePropDesc, &[0x9999]);
    assert_eq!(code, StandardResponseCode::DevicePropNotSupported.value());
}

#[test]
fn object_property_operations() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("file2").clone());

    // supported set for an arbitrary format works without a session too
    let (code, _) = rig.request(StandardCommandCode::GetObjectPropsSupported, &[0x3004]);
    assert_eq!(code, ok());

    let (code, _) = rig.request(
        StandardCommandCode::GetObjectPropValue,
        &[handle, OBJ_PROP_OBJECT_SIZE as u32],
    );
    assert_eq!(code, ok());
    let payload = rig.transport.last_data_payload();
    assert_eq!(LittleEndian::read_u64(&payload[..8]), 6);

    // rename through SetObjectPropValue
    let mut name = Vec::new();
    name.write_mtp_str("file2renamed").unwrap();
    let (code, _) = rig.request_with_data(
        StandardCommandCode::SetObjectPropValue,
        &[handle, OBJ_PROP_OBJECT_FILE_NAME as u32],
        &name,
    );
    assert_eq!(code, ok());
    assert!(rig.root.join("file2renamed").exists());

    // size is read-only
    let mut size = Vec::new();
    size.write_mtp_u64(99).unwrap();
    let (code, _) = rig.request_with_data(
        StandardCommandCode::SetObjectPropValue,
        &[handle, OBJ_PROP_OBJECT_SIZE as u32],
        &size,
    );
    assert_eq!(code, StandardResponseCode::AccessDenied.value());
}

#[test]
fn advertised_properties_without_a_value_answer_empty() {
    let mut rig = Rig::new();
    rig.open_session();
    let handle = rig.handle_of(&rig.root.join("file1").clone());

    // Name is advertised for every category but the filesystem holds no
    // value for it; the answer is an empty string, not an error
    let (code, _) = rig.request(
        StandardCommandCode::GetObjectPropValue,
        &[handle, OBJ_PROP_NAME as u32],
    );
    assert_eq!(code, ok());
    assert_eq!(rig.transport.last_data_payload(), vec![0]);
}

#[test]
fn object_prop_list_for_a_folder() {
    let mut rig = Rig::new();
    rig.open_session();
    let docs = rig.handle_of(&rig.root.join("docs").clone());
    let readme = rig.handle_of(&rig.root.join("docs/readme.txt").clone());

    // depth 1, all formats, all properties: one-round-trip enumeration
    let (code, _) = rig.request(
        StandardCommandCode::GetObjectPropList,
        &[docs, 0, 0xFFFF, 0, 1],
    );
    assert_eq!(code, ok());
    let payload = rig.transport.last_data_payload();
    let count = LittleEndian::read_u32(&payload[..4]);
    assert!(count > 0);
    // every element references the folder's single child
    assert_eq!(LittleEndian::read_u32(&payload[4..8]), readme);

    // unsupported depth values are called out specifically
    let (code, _) = rig.request(
        StandardCommandCode::GetObjectPropList,
        &[docs, 0, 0xFFFF, 0, 5],
    );
    assert_eq!(
        code,
        StandardResponseCode::SpecificationByDepthUnsupported.value()
    );

    // group addressing is not supported
    let (code, _) = rig.request(StandardCommandCode::GetObjectPropList, &[docs, 0, 0, 1, 1]);
    assert_eq!(
        code,
        StandardResponseCode::SpecificationByGroupUnsupported.value()
    );
}

#[test]
fn object_references_round_trip() {
    let mut rig = Rig::new();
    rig.open_session();
    let file1 = rig.handle_of(&rig.root.join("file1").clone());
    let file2 = rig.handle_of(&rig.root.join("file2").clone());

    let mut refs = Vec::new();
    refs.write_mtp_u32_vec(&[file2]).unwrap();
    let (code, _) =
        rig.request_with_data(StandardCommandCode::SetObjectReferences, &[file1], &refs);
    assert_eq!(code, ok());

    let (code, _) = rig.request(StandardCommandCode::GetObjectReferences, &[file1]);
    assert_eq!(code, ok());
    assert_eq!(rig.transport.last_data_payload(), refs);
}

#[test]
fn unknown_operations_are_not_supported() {
    let mut rig = Rig::new();
    rig.open_session();
    let (code, _) = rig.request_raw(0x1234, &[]);
    assert_eq!(code, StandardResponseCode::OperationNotSupported.value());
}

#[test]
fn copy_object_returns_the_new_handle() {
    let mut rig = Rig::new();
    rig.open_session();
    let source = rig.handle_of(&rig.root.join("file1").clone());
    let docs = rig.handle_of(&rig.root.join("docs").clone());

    let (code, params) = rig.request(
        StandardCommandCode::CopyObject,
        &[source, 0x0001_0001, docs],
    );
    assert_eq!(code, ok());
    assert_ne!(params[0], source);
    assert!(rig.root.join("docs/file1").exists());
}

#[test]
fn move_object_relocates_the_file() {
    let mut rig = Rig::new();
    rig.open_session();
    let source = rig.handle_of(&rig.root.join("file2").clone());
    let docs = rig.handle_of(&rig.root.join("docs").clone());

    let (code, _) = rig.request(StandardCommandCode::MoveObject, &[source, 0x0001_0001, docs]);
    assert_eq!(code, ok());
    assert!(rig.root.join("docs/file2").exists());
    assert!(!rig.root.join("file2").exists());
}
