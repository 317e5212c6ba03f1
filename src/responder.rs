use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::command::{AndroidCommandCode, CommandCode, StandardCommandCode};
use crate::container::{
    ContainerType, RxContainer, TxContainer, CONTAINER_HEADER_SIZE, CONTAINER_LENGTH_HUGE,
    MAX_CONTENT_SIZE, NO_TRANSACTION_ID,
};
use crate::data::{MtpData, MtpRead, MtpWrite};
use crate::dataset::ObjectInfo;
use crate::deviceinfo::DeviceInfoProvider;
use crate::event::StandardEventCode;
use crate::extension::{ExtensionManager, MtpRequest};
use crate::factory::StorageFactory;
use crate::format::{FormatCategory, ObjHandle, StorageId, FORMAT_UNDEFINED};
use crate::properties::{self, PropertyRegistry};
use crate::response::StandardResponseCode as Resp;
use crate::transport::{
    ContainerSplitter, ControlEvent, DeviceStatus, TransportEvent, Transporter,
};
use crate::OpResult;

/// Matches the largest request the gadget controller accepts in one go;
/// outgoing file content is streamed in chunks of this size.
const SEND_BUFFER_LEN: usize = 4 * 4096;

/// Quiet time after the last response before the command sequence is
/// considered over.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

const SESSION_NONE: u32 = 0;

/// GetObjectPropsSupported does not need an open session; the pre-check
/// runs against this synthetic id.
const SESSION_SYNTHETIC: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitData,
    WaitResp,
    WaitStorage,
    TxCancel,
    Suspend,
}

/// Per-session transaction bookkeeping: the request container is kept until
/// its response goes out; the cached response code carries request-phase
/// errors through data-phase acceptance.
struct TransactionSequence {
    session_id: u32,
    req: Option<RxContainer>,
    data: Option<RxContainer>,
    resp: Resp,
}

struct SendObjectSequence {
    handle: ObjHandle,
    info: ObjectInfo,
    bytes_written: u64,
}

struct PropListElement {
    prop_code: u16,
    value: MtpData,
}

struct ObjPropListInfo {
    storage_id: u32,
    parent: ObjHandle,
    handle: ObjHandle,
    format: u16,
    object_size: u64,
    current_size: u64,
    elements: Vec<PropListElement>,
}

struct EditObjectSequence {
    handle: ObjHandle,
    write_offset: u64,
}

struct SegmentedSender {
    handle: ObjHandle,
    offset_now: u64,
    offset_end: u64,
}

enum SendObjectOutcome {
    /// Respond with the code and leave the data phase.
    Complete(Resp),
    /// More data packets expected.
    AwaitMore,
}

/// The per-session transaction engine: parses request containers, drives
/// the command/data/response phases, dispatches operations and owns the
/// event loop that serializes everything else onto this thread.
pub struct Responder {
    state: State,
    prev_state: State,
    txn: TransactionSequence,
    send_object: Option<SendObjectSequence>,
    prop_list: Option<ObjPropListInfo>,
    edit_object: Option<EditObjectSequence>,
    storage: StorageFactory,
    devinfo: DeviceInfoProvider,
    props: PropertyRegistry,
    extensions: ExtensionManager,
    transporter: Box<dyn Transporter>,
    splitter: ContainerSplitter,
    storage_wait_data: Vec<u8>,
    storage_wait_complete: bool,
    resend_buffer: Option<(Vec<u8>, bool)>,
    idle_deadline: Option<Instant>,
}

impl Responder {
    pub fn new(
        storage: StorageFactory,
        devinfo: DeviceInfoProvider,
        transporter: Box<dyn Transporter>,
    ) -> Responder {
        let props = PropertyRegistry::new(&devinfo);
        Responder {
            state: State::Idle,
            prev_state: State::Idle,
            txn: TransactionSequence {
                session_id: SESSION_NONE,
                req: None,
                data: None,
                resp: Resp::Ok,
            },
            send_object: None,
            prop_list: None,
            edit_object: None,
            storage,
            devinfo,
            props,
            extensions: ExtensionManager::new(),
            transporter,
            splitter: ContainerSplitter::default(),
            storage_wait_data: Vec::new(),
            storage_wait_complete: false,
            resend_buffer: None,
            idle_deadline: None,
        }
    }

    pub fn set_extensions(&mut self, extensions: ExtensionManager) {
        self.extensions = extensions;
    }

    pub fn storage(&mut self) -> &mut StorageFactory {
        &mut self.storage
    }

    /// Enumerates storages, then brings the USB function up. Activation is
    /// deferred until the storages are walkable so the host never observes
    /// attach-then-stall.
    pub fn startup(&mut self) {
        self.storage.enumerate_storages();
        if !self.transporter.activate() {
            error!("transporter activate failed");
        } else {
            info!("transporter activated");
        }
        self.transporter.set_device_status(DeviceStatus::Ok);
        self.on_storage_ready();
        self.flush_events();
    }

    /// Drives the responder until the transport goes away. All handler code
    /// runs on the calling thread.
    pub fn run(&mut self, events: Receiver<TransportEvent>) {
        self.startup();
        loop {
            let timeout = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(200));

            match events.recv_timeout(timeout) {
                Ok(TransportEvent::Data(data)) => self.receive_bulk(&data),
                Ok(TransportEvent::Control(event)) => self.handle_control(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.service_timers();
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.close_session();
        self.storage.shutdown();
        self.transporter.deactivate();
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.idle_deadline;
        if let Some(thumb) = self.storage.thumbnail_deadline() {
            deadline = Some(deadline.map_or(thumb, |d| d.min(thumb)));
        }
        // filesystem notifications are polled on a short leash either way
        let fs_poll = Instant::now() + Duration::from_millis(50);
        Some(deadline.map_or(fs_poll, |d| d.min(fs_poll)))
    }

    /// Timer pass: inotify drain, thumbnail flushes, idle detection, and
    /// emission of any events the storage engine queued.
    pub fn service_timers(&mut self) {
        let now = Instant::now();
        self.storage.process_fs_events(now);
        self.storage.process_thumbnails(now);
        self.flush_events();

        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                self.idle_deadline = None;
                trace!("command sequence ended");
            }
        }
    }

    fn flush_events(&mut self) {
        for event in self.storage.take_events() {
            self.dispatch_event(event.code, &event.params);
        }
    }

    /* ===================================================================
     * Transport input
     * =================================================================== */

    /// Raw bulk-out bytes from the transport; the splitter re-frames them
    /// into containers.
    pub fn receive_bulk(&mut self, data: &[u8]) {
        // For >4 GiB SendObject data phases the length field is the escape
        // value and the true size comes from the announced object size.
        let announced = self
            .prop_list
            .as_ref()
            .map(|info| info.object_size)
            .unwrap_or(0);
        let pieces = self.splitter.split(data, |header| {
            if header.len() >= CONTAINER_HEADER_SIZE
                && header[4..6] == (ContainerType::Data as u16).to_le_bytes()
                && header[6..8]
                    == StandardCommandCode::SendObject.to_u16().unwrap().to_le_bytes()
            {
                announced
            } else {
                0
            }
        });
        for (chunk, first, last) in pieces {
            self.receive_container(chunk, first, last);
        }
    }

    pub fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::StartIo => {
                self.transporter.set_device_status(DeviceStatus::Ok);
            }
            ControlEvent::StopIo => {
                // the cable side went away mid-whatever
                self.cleanup();
            }
            ControlEvent::BindUsb => info!("usb function bound"),
            ControlEvent::UnbindUsb => info!("usb function unbound"),
            ControlEvent::Suspend => self.handle_suspend(),
            ControlEvent::Resume => self.handle_resume(),
            ControlEvent::CancelTransaction => self.handle_cancel_transaction(),
            ControlEvent::DeviceReset => self.handle_device_reset(),
        }
    }

    /// Entry point for one (possibly segmented) container.
    pub fn receive_container(&mut self, data: &[u8], is_first_packet: bool, is_last_packet: bool) {
        match self.state {
            State::Idle | State::TxCancel | State::Suspend => {
                self.set_state(State::Idle);
                self.txn.req = None;

                // request containers cannot be segmented
                if !(is_first_packet && is_last_packet) {
                    error!("expected a command container, received data");
                    self.set_state(State::Idle);
                    self.transporter.reset();
                    return;
                }
                let req = match RxContainer::new(data) {
                    Ok(req) if req.container_type() == ContainerType::Command => req,
                    _ => {
                        error!("invalid container received in idle state");
                        self.transporter.reset();
                        return;
                    }
                };
                let code = req.code();
                self.txn.req = Some(req);
                if self.has_data_phase(code) {
                    // the data phase must complete even if the request
                    // phase failed, to keep the wire aligned
                    self.set_state(State::WaitData);
                } else {
                    self.set_state(State::WaitResp);
                }
                self.transporter.set_device_status(DeviceStatus::Busy);
                self.command_handler();
            }
            State::WaitData => {
                if self.txn.req.is_none() {
                    error!("data container before a request container");
                    self.set_state(State::Idle);
                    self.transporter.reset();
                    return;
                }
                if is_first_packet {
                    self.transporter.set_device_status(DeviceStatus::Busy);
                }
                self.data_handler(data, is_first_packet, is_last_packet);
            }
            State::WaitStorage => {
                if is_first_packet && !self.storage_wait_data.is_empty() {
                    error!("more than one container while waiting for storage");
                    self.set_state(State::Idle);
                    self.transporter.reset();
                    return;
                }
                self.storage_wait_data.extend_from_slice(data);
                self.storage_wait_complete = is_last_packet;
            }
            State::WaitResp => {
                error!("container received in wrong state");
                self.set_state(State::Idle);
                self.transporter.reset();
            }
        }
    }

    /// Replays the pending command once enumeration finishes.
    pub fn on_storage_ready(&mut self) {
        if self.state != State::WaitStorage {
            return;
        }
        let code = match self.txn.req.as_ref() {
            Some(req) => req.code(),
            None => {
                self.set_state(State::Idle);
                return;
            }
        };
        if self.has_data_phase(code) {
            self.set_state(State::WaitData);
        } else {
            self.set_state(State::WaitResp);
        }
        info!("storage ready, retrying operation");
        self.command_handler();

        if !self.storage_wait_data.is_empty() {
            let data = std::mem::take(&mut self.storage_wait_data);
            let complete = self.storage_wait_complete;
            self.storage_wait_complete = false;
            self.receive_container(&data, true, complete);
        }
    }

    /* ===================================================================
     * State machine plumbing
     * =================================================================== */

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!("state {:?} -> {:?}", self.state, state);
            let was_busy = self.state != State::Idle;
            let is_busy = state != State::Idle;
            self.state = state;
            if was_busy != is_busy {
                self.idle_deadline = if is_busy {
                    None
                } else {
                    Some(Instant::now() + IDLE_TIMEOUT)
                };
            }
        }
    }

    fn delete_stored_request(&mut self) {
        self.txn.req = None;
        self.txn.data = None;
    }

    fn pre_check_session(&self, session_id: u32) -> Resp {
        let tid = self
            .txn
            .req
            .as_ref()
            .map(|req| req.transaction_id())
            .unwrap_or(0);
        if session_id == SESSION_NONE {
            Resp::SessionNotOpen
        } else if tid == 0x0000_0000 || tid == NO_TRANSACTION_ID {
            Resp::InvalidTransactionId
        } else {
            Resp::Ok
        }
    }

    fn pre_check(&self) -> Resp {
        self.pre_check_session(self.txn.session_id)
    }

    fn request_params(&self) -> Vec<u32> {
        self.txn
            .req
            .as_ref()
            .map(|req| req.params())
            .unwrap_or_default()
    }

    fn has_data_phase(&self, code: u16) -> bool {
        use StandardCommandCode::*;
        match CommandCode::from_u16(code) {
            Some(CommandCode::Standard(op)) => matches!(
                op,
                SendObjectInfo
                    | SendObject
                    | SetObjectPropList
                    | SendObjectPropList
                    | SetDevicePropValue
                    | SetObjectPropValue
                    | SetObjectReferences
            ),
            Some(CommandCode::Android(op)) => {
                matches!(op, AndroidCommandCode::SendPartialObject64)
            }
            _ => self
                .extensions
                .operation_has_data_phase(code)
                .unwrap_or(false),
        }
    }

    fn needs_storage_ready(&self, code: u16) -> bool {
        use StandardCommandCode::*;
        !matches!(
            CommandCode::from_u16(code),
            Some(CommandCode::Standard(
                GetDeviceInfo
                    | OpenSession
                    | CloseSession
                    | GetStorageIDs
                    | GetStorageInfo
                    | GetDevicePropDesc
                    | GetDevicePropValue
                    | SetDevicePropValue
                    | ResetDevicePropValue
            ))
        )
    }

    /* ===================================================================
     * Container sending
     * =================================================================== */

    fn send_container(&mut self, container: TxContainer, is_last_packet: bool) -> bool {
        let container_type = container.container_type();
        let code = container.code();

        if container_type == ContainerType::Response && code != Resp::Ok.value() {
            warn!("sending {:?} 0x{:04x}", container_type, code);
        } else {
            trace!("sending {:?} 0x{:04x}", container_type, code);
        }

        if container_type != ContainerType::Event {
            if self.state == State::TxCancel {
                return false;
            }
            if self.state == State::Suspend {
                // hold the container for resume
                warn!("suspended while sending, buffering for resume");
                self.resend_buffer = Some((container.finish(), is_last_packet));
                return false;
            }
        }

        let buffer = container.finish();
        let sent = if container_type == ContainerType::Event {
            self.transporter.send_event(&buffer)
        } else {
            if container_type == ContainerType::Response {
                // The host may fire the next request the moment the
                // response drains, before control returns here; go idle
                // ahead of the transfer.
                self.set_state(State::Idle);
            }
            self.transporter.send_data(&buffer, is_last_packet)
        };

        if container_type == ContainerType::Response {
            self.transporter.set_device_status(DeviceStatus::Ok);
            self.delete_stored_request();
        }
        sent
    }

    fn send_response(&mut self, code: Resp) -> bool {
        self.send_response_params(code, &[])
    }

    fn send_response_params(&mut self, code: Resp, params: &[u32]) -> bool {
        let tid = match self.txn.req.as_ref() {
            Some(req) => req.transaction_id(),
            None => {
                warn!("transaction gone, not sending response");
                return false;
            }
        };
        let mut container = TxContainer::new(ContainerType::Response, code.value(), tid);
        for param in params {
            container.write_mtp_u32(*param).ok();
        }
        let sent = self.send_container(container, true);
        if !sent {
            error!("could not send response");
        }
        sent
    }

    fn data_container(&self) -> OpResult<TxContainer> {
        let req = self.txn.req.as_ref().ok_or(Resp::GeneralError)?;
        Ok(TxContainer::new(
            ContainerType::Data,
            req.code(),
            req.transaction_id(),
        ))
    }

    /// Data container followed by the response; the common two-phase tail.
    fn send_data_and_response(&mut self, container: TxContainer, code: Resp) {
        if self.send_container(container, true) {
            self.send_response(code);
        } else {
            error!("could not send data");
        }
    }

    /* ===================================================================
     * Events
     * =================================================================== */

    pub fn dispatch_event(&mut self, event: StandardEventCode, params: &[u32]) {
        let mut filtering_allowed = true;
        let mut object_handle = 0;
        match event {
            StandardEventCode::ObjectAdded | StandardEventCode::ObjectRemoved => {
                filtering_allowed = false;
                object_handle = params.first().copied().unwrap_or(0);
            }
            StandardEventCode::ObjectInfoChanged | StandardEventCode::ObjectPropChanged => {
                object_handle = params.first().copied().unwrap_or(0);
            }
            _ => {}
        }

        if object_handle != 0x0000_0000 && object_handle != 0xFFFF_FFFF {
            let enabled = self.storage.events_enabled(object_handle).unwrap_or(true);
            if filtering_allowed && !enabled {
                trace!("event {:?} for {} skipped", event, object_handle);
                return;
            }
        }

        if self.txn.session_id == SESSION_NONE {
            return;
        }

        trace!("event {:?} {:?}", event, params);
        let mut container = TxContainer::new(
            ContainerType::Event,
            event.to_u16().unwrap(),
            NO_TRANSACTION_ID,
        );
        for param in params {
            container.write_mtp_u32(*param).ok();
        }
        if !self.send_container(container, true) {
            warn!("could not dispatch event {:?}", event);
        }
    }

    /* ===================================================================
     * Cancellation, reset, suspend
     * =================================================================== */

    fn handle_cancel_transaction(&mut self) {
        self.transporter.set_device_status(DeviceStatus::TxCancelled);

        let Some(code) = self.txn.req.as_ref().map(|req| req.code()) else {
            // cancel in idle state; nothing to undo
            self.splitter.reset();
            self.transporter.cancel_acknowledged();
            self.transporter.set_device_status(DeviceStatus::Ok);
            return;
        };
        warn!("cancel transaction for operation 0x{:04x}", code);

        self.set_state(State::TxCancel);
        self.splitter.reset();

        use StandardCommandCode::*;
        let host_to_device = matches!(
            CommandCode::from_u16(code),
            Some(CommandCode::Standard(SendObject | SendObjectInfo | SendObjectPropList))
        );
        if host_to_device {
            let handle = self
                .prop_list
                .as_ref()
                .map(|info| info.handle)
                .or_else(|| self.send_object.as_ref().map(|seq| seq.handle))
                .unwrap_or(0);
            if handle != 0 {
                // close and throw away the partial object
                let _ = self.storage.write_data(handle, None, false, true);
                match self.storage.delete_item(handle, FORMAT_UNDEFINED) {
                    Ok(()) => info!("partial object {} deleted after cancel", handle),
                    Err(err) => warn!("could not delete partial object: {:?}", err),
                }
            }
            self.prop_list = None;
            self.send_object = None;
        }

        self.delete_stored_request();
        self.transporter.cancel_acknowledged();
        self.transporter.set_device_status(DeviceStatus::Ok);
    }

    fn handle_device_reset(&mut self) {
        self.close_session();
        self.transporter.set_device_status(DeviceStatus::Ok);
    }

    fn handle_suspend(&mut self) {
        warn!("suspend");
        self.prev_state = self.state;
        self.set_state(State::Suspend);
        self.transporter.set_device_status(DeviceStatus::Busy);
        self.storage.suspend();
    }

    fn handle_resume(&mut self) {
        warn!("resume");
        self.set_state(self.prev_state);
        self.storage.resume();
        self.transporter.set_device_status(DeviceStatus::Ok);
        if let Some((buffer, is_last)) = self.resend_buffer.take() {
            if self.state != State::TxCancel {
                self.transporter.send_data(&buffer, is_last);
            }
        }
    }

    /// Transport-level teardown: USB disable, cable gone.
    fn cleanup(&mut self) {
        self.close_session();
        self.splitter.reset();
    }

    fn close_session(&mut self) {
        self.txn.session_id = SESSION_NONE;
        self.delete_stored_request();
        self.set_state(State::Idle);
        self.send_object = None;
        self.prop_list = None;
        self.edit_object = None;
        self.storage.session_open_changed(false);
    }

    /* ===================================================================
     * Command dispatch
     * =================================================================== */

    fn command_handler(&mut self) {
        let Some(req) = self.txn.req.as_ref() else { return };
        let code = req.code();
        let params = req.params();

        // log the object a request refers to, when there is one
        let logged_handle: Option<ObjHandle> = match CommandCode::from_u16(code) {
            Some(CommandCode::Standard(op)) => {
                use StandardCommandCode::*;
                match op {
                    GetObjectInfo | GetObject | GetThumb | DeleteObject | GetPartialObject
                    | MoveObject | CopyObject | GetObjectPropValue | SetObjectPropValue
                    | GetObjectPropList | GetObjectReferences | SetObjectReferences => {
                        params.first().copied()
                    }
                    SendObjectInfo | SendObjectPropList => params.get(1).copied(),
                    GetNumObjects | GetObjectHandles => params.get(2).copied(),
                    _ => None,
                }
            }
            Some(CommandCode::Android(_)) => params.first().copied(),
            _ => None,
        };
        if let Some(handle) = logged_handle {
            if handle != 0x0000_0000 && handle != 0xFFFF_FFFF {
                trace!(
                    "op 0x{:04x} on {:?}",
                    code,
                    self.storage.path(handle).unwrap_or_default()
                );
            }
        }

        // preset; operation handlers overwrite on request-phase errors
        self.txn.resp = Resp::Ok;

        if !self.storage.storage_is_ready() && self.needs_storage_ready(code) {
            info!("waiting for storage before 0x{:04x}", code);
            self.set_state(State::WaitStorage);
            self.storage_wait_data.clear();
            self.storage_wait_complete = false;
            return;
        }

        use StandardCommandCode::*;
        match CommandCode::from_u16(code) {
            Some(CommandCode::Standard(op)) => match op {
                GetDeviceInfo => self.get_device_info_req(),
                OpenSession => self.open_session_req(),
                CloseSession => self.close_session_req(),
                GetStorageIDs => self.get_storage_ids_req(),
                GetStorageInfo => self.get_storage_info_req(),
                GetNumObjects => self.get_num_objects_req(),
                GetObjectHandles => self.get_object_handles_req(),
                GetObjectInfo => self.get_object_info_req(),
                GetObject => self.get_object_req(),
                GetThumb => self.get_thumb_req(),
                DeleteObject => self.delete_object_req(),
                SendObjectInfo => self.send_object_info_req(),
                SendObject => self.send_object_req(),
                GetPartialObject => self.get_partial_object_req(),
                GetDevicePropDesc => self.get_device_prop_desc_req(),
                GetDevicePropValue => self.get_device_prop_value_req(),
                SetDevicePropValue => self.set_device_prop_value_req(),
                MoveObject => self.move_object_req(),
                CopyObject => self.copy_object_req(),
                GetObjectPropsSupported => self.get_object_props_supported_req(),
                GetObjectPropDesc => self.get_object_prop_desc_req(),
                GetObjectPropValue => self.get_object_prop_value_req(),
                SetObjectPropValue => self.set_object_prop_value_req(),
                GetObjectPropList => self.get_object_prop_list_req(),
                SetObjectPropList => self.set_object_prop_list_req(),
                SendObjectPropList => self.send_object_prop_list_req(),
                GetObjectReferences => self.get_object_references_req(),
                SetObjectReferences => self.set_object_references_req(),
                Skip => self.skip_req(),
                _ => {
                    self.send_response(Resp::OperationNotSupported);
                }
            },
            Some(CommandCode::Android(op)) => match op {
                AndroidCommandCode::GetPartialObject64 => self.get_partial_object64_req(),
                AndroidCommandCode::SendPartialObject64 => self.send_partial_object64_req(),
                AndroidCommandCode::TruncateObject64 => self.truncate_object64_req(),
                AndroidCommandCode::BeginEditObject => self.begin_edit_object_req(),
                AndroidCommandCode::EndEditObject => self.end_edit_object_req(),
            },
            _ => {
                if let Some(false) = self.extensions.operation_has_data_phase(code) {
                    self.handle_extended_operation();
                } else if self.extensions.operation_has_data_phase(code).is_none() {
                    self.send_response(Resp::OperationNotSupported);
                }
                // extensions with a data phase respond from the data handler
            }
        }
    }

    fn data_handler(&mut self, data: &[u8], is_first_packet: bool, is_last_packet: bool) {
        let Some(code) = self.txn.req.as_ref().map(|req| req.code()) else { return };
        let mut resp = self.txn.resp;

        use StandardCommandCode::*;
        let streamed = matches!(
            CommandCode::from_u16(code),
            Some(CommandCode::Standard(SendObject))
                | Some(CommandCode::Android(AndroidCommandCode::SendPartialObject64))
        );

        if streamed {
            // file content goes straight through to the filesystem
            self.txn.data = None;
        } else {
            if is_first_packet {
                match RxContainer::new(data) {
                    Ok(container) => self.txn.data = Some(container),
                    Err(_) => {
                        self.txn.resp = Resp::InvalidDataset;
                        if is_last_packet {
                            let code = self.txn.resp;
                            self.send_response(code);
                        }
                        return;
                    }
                }
            } else if let Some(container) = self.txn.data.as_mut() {
                container.append(data);
            }
            if !is_last_packet {
                // wait for the rest of the data phase
                return;
            }
        }

        // sanity check the assembled container against the request phase
        if resp == Resp::Ok {
            if let (Some(req), Some(container)) = (self.txn.req.as_ref(), self.txn.data.as_ref()) {
                if container.transaction_id() != req.transaction_id() {
                    resp = Resp::InvalidTransactionId;
                } else if container.code() != req.code() {
                    resp = Resp::GeneralError;
                }
            }
        }

        if resp == Resp::Ok {
            match CommandCode::from_u16(code) {
                Some(CommandCode::Standard(SendObjectInfo)) => {
                    self.send_object_info_data();
                    return;
                }
                Some(CommandCode::Standard(SendObject)) => {
                    self.send_object_data(data, is_first_packet, is_last_packet);
                    return;
                }
                Some(CommandCode::Android(AndroidCommandCode::SendPartialObject64)) => {
                    resp = self.send_partial_object64_data(data, is_first_packet, is_last_packet);
                }
                Some(CommandCode::Standard(SetObjectPropList)) => {
                    self.set_object_prop_list_data();
                    return;
                }
                Some(CommandCode::Standard(SendObjectPropList)) => {
                    self.send_object_prop_list_data();
                    return;
                }
                Some(CommandCode::Standard(SetDevicePropValue)) => {
                    self.set_device_prop_value_data();
                    return;
                }
                Some(CommandCode::Standard(SetObjectPropValue)) => {
                    self.set_object_prop_value_data();
                    return;
                }
                Some(CommandCode::Standard(SetObjectReferences)) => {
                    self.set_object_references_data();
                    return;
                }
                _ => {
                    if self.extensions.operation_has_data_phase(code).is_some() {
                        self.handle_extended_operation();
                        return;
                    }
                    resp = Resp::OperationNotSupported;
                }
            }
        }

        self.txn.resp = resp;
        if is_last_packet {
            self.send_response(resp);
        }
    }

    fn handle_extended_operation(&mut self) {
        let Some(req) = self.txn.req.as_ref() else { return };
        let request = MtpRequest {
            op_code: req.code(),
            params: req.params(),
            data: self
                .txn
                .data
                .as_ref()
                .map(|container| container.payload().to_vec())
                .unwrap_or_default(),
        };
        match self.extensions.handle_operation(&request) {
            Some(response) => {
                if !response.data.is_empty() {
                    if let Ok(mut container) = self.data_container() {
                        std::io::Write::write_all(&mut container, &response.data).ok();
                        if !self.send_container(container, true) {
                            error!("could not send extension data");
                            return;
                        }
                    }
                }
                let code =
                    Resp::from_u16(response.resp_code).unwrap_or(Resp::GeneralError);
                self.send_response_params(code, &response.params);
            }
            None => {
                self.send_response(Resp::OperationNotSupported);
            }
        }
    }

    /* ===================================================================
     * Session and device operations
     * =================================================================== */

    fn get_device_info_req(&mut self) {
        let dataset = self.devinfo.dataset();
        let Ok(mut container) = self.data_container() else { return };
        if dataset.encode(&mut container).is_err() {
            self.send_response(Resp::GeneralError);
            return;
        }
        self.send_data_and_response(container, Resp::Ok);
    }

    fn open_session_req(&mut self) {
        let params = self.request_params();
        let requested = params.first().copied().unwrap_or(0);
        if requested == SESSION_NONE {
            self.send_response(Resp::InvalidParameter);
        } else if self.txn.session_id != SESSION_NONE {
            let open = self.txn.session_id;
            self.send_response_params(Resp::SessionAlreadyOpen, &[open]);
        } else {
            self.txn.session_id = requested;
            self.send_response(Resp::Ok);
            self.storage.session_open_changed(true);
        }
    }

    fn close_session_req(&mut self) {
        if self.txn.session_id == SESSION_NONE {
            self.send_response(Resp::SessionNotOpen);
            return;
        }
        self.txn.session_id = SESSION_NONE;
        self.send_object = None;
        self.prop_list = None;
        self.storage.session_open_changed(false);
        self.send_response(Resp::Ok);
    }

    fn get_storage_ids_req(&mut self) {
        let code = self.pre_check();
        if code != Resp::Ok {
            self.send_response(code);
            return;
        }
        let ids: Vec<u32> = self.storage.storage_ids().iter().map(|id| id.0).collect();
        let Ok(mut container) = self.data_container() else { return };
        container.write_mtp_u32_vec(&ids).ok();
        self.send_data_and_response(container, Resp::Ok);
    }

    fn get_storage_info_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        let mut sent = true;
        if code == Resp::Ok {
            let storage_id = StorageId(params.first().copied().unwrap_or(0));
            code = match self.storage.check_storage(storage_id) {
                Ok(()) => match self.storage.storage_info(storage_id) {
                    Ok(info) => {
                        let Ok(mut container) = self.data_container() else { return };
                        info.encode(&mut container).ok();
                        sent = self.send_container(container, true);
                        Resp::Ok
                    }
                    Err(err) => err,
                },
                Err(err) => err,
            };
        }
        if sent {
            self.send_response(code);
        }
    }

    fn check_enumeration_params(&mut self, params: &[u32]) -> Resp {
        let storage_id = StorageId(params.first().copied().unwrap_or(0));
        if storage_id != StorageId::all() {
            if let Err(err) = self.storage.check_storage(storage_id) {
                return err;
            }
        }
        let format = params.get(1).copied().unwrap_or(0) as u16;
        if format != 0 && !self.devinfo.supported_formats().contains(&format) {
            return Resp::InvalidObjectPropFormat;
        }
        let parent = params.get(2).copied().unwrap_or(0);
        if parent != 0x0000_0000 && parent != 0xFFFF_FFFF {
            if let Err(err) = self.storage.check_handle(parent) {
                return err;
            }
        }
        Resp::Ok
    }

    fn get_num_objects_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        if code == Resp::Ok {
            code = self.check_enumeration_params(&params);
        }
        let mut count = 0;
        if code == Resp::Ok {
            match self.storage.object_handles(
                StorageId(params.first().copied().unwrap_or(0)),
                params.get(1).copied().unwrap_or(0) as u16,
                params.get(2).copied().unwrap_or(0),
            ) {
                Ok(handles) => count = handles.len() as u32,
                Err(err) => code = err,
            }
        }
        self.send_response_params(code, &[count]);
    }

    fn get_object_handles_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        if code == Resp::Ok {
            code = self.check_enumeration_params(&params);
        }
        if code == Resp::Ok {
            match self.storage.object_handles(
                StorageId(params.first().copied().unwrap_or(0)),
                params.get(1).copied().unwrap_or(0) as u16,
                params.get(2).copied().unwrap_or(0),
            ) {
                Ok(mut handles) => {
                    // some hosts only show a full listing when parents sort
                    // before their contents
                    handles.sort_unstable();
                    let Ok(mut container) = self.data_container() else { return };
                    container.write_mtp_u32_vec(&handles).ok();
                    self.send_data_and_response(container, Resp::Ok);
                    return;
                }
                Err(err) => code = err,
            }
        }
        self.send_response(code);
    }

    fn get_object_info_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            match self.storage.object_info(handle) {
                Ok(info) => {
                    let Ok(mut container) = self.data_container() else { return };
                    info.encode(&mut container).ok();
                    self.send_data_and_response(container, Resp::Ok);
                    return;
                }
                Err(err) => code = err,
            }
        }
        self.send_response(code);
    }

    /* ===================================================================
     * Object content: outgoing
     * =================================================================== */

    fn get_object_req(&mut self) {
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        self.get_object_common(handle, 0, MAX_CONTENT_SIZE);
    }

    fn get_partial_object_req(&mut self) {
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        let offset = params.get(1).copied().unwrap_or(0) as u64;
        let size = params.get(2).copied().unwrap_or(0) as u64;
        self.get_object_common(handle, offset, size);
    }

    fn get_partial_object64_req(&mut self) {
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        let offset = (params.get(2).copied().unwrap_or(0) as u64) << 32
            | params.get(1).copied().unwrap_or(0) as u64;
        let size = params.get(3).copied().unwrap_or(0) as u64;
        self.get_object_common(handle, offset, size);
    }

    /// Shared by GetObject, GetPartialObject and GetPartialObject64:
    /// validates the extent, clips it to the object size, and streams the
    /// content.
    fn get_object_common(&mut self, handle: ObjHandle, offset: u64, size: u64) {
        let mut code = self.pre_check();

        let mut object_size = 0;
        if code == Resp::Ok {
            match self.storage.object_info(handle) {
                Ok(info) => {
                    if info.object_format == crate::format::FORMAT_ASSOCIATION {
                        warn!("{} is not a regular file", handle);
                        code = Resp::InvalidObjectHandle;
                    } else {
                        object_size = info.compressed_size;
                    }
                }
                Err(err) => code = err,
            }
        }

        if code == Resp::Ok {
            let tail = offset.checked_add(size);
            if offset > object_size {
                warn!("{} read past file end", handle);
                code = Resp::InvalidParameter;
            } else if tail.is_none() {
                warn!("{} read span overflow", handle);
                code = Resp::InvalidParameter;
            } else {
                let tail = tail.unwrap().min(object_size);
                let sender = SegmentedSender {
                    handle,
                    offset_now: offset,
                    offset_end: tail,
                };
                self.send_object_segmented(sender);
                return;
            }
        }

        self.send_response(code);
    }

    /// Streams `[offset_now, offset_end)` as one data container: header and
    /// first chunk, then raw chunks, the last marked end-of-transfer so the
    /// writer applies the ZLP rule.
    fn send_object_segmented(&mut self, mut sender: SegmentedSender) {
        let Some(req) = self.txn.req.as_ref() else { return };
        let op_code = req.code();
        let tid = req.transaction_id();

        let mut code = Resp::Ok;
        let mut header_sent = false;
        let mut content_sent = false;
        let mut bytes_sent: u64 = 0;
        let mut remaining = sender.offset_end - sender.offset_now;

        // header plus the initial slice of content
        {
            let content_len = remaining.min((SEND_BUFFER_LEN - CONTAINER_HEADER_SIZE) as u64) as usize;
            let mut container = TxContainer::new(ContainerType::Data, op_code, tid);
            container.set_container_length(if remaining > MAX_CONTENT_SIZE {
                CONTAINER_LENGTH_HUGE
            } else {
                (CONTAINER_HEADER_SIZE as u64 + remaining) as u32
            });

            let mut buffer = vec![0u8; content_len];
            match self
                .storage
                .read_data(sender.handle, sender.offset_now, &mut buffer)
            {
                Ok(()) => {
                    std::io::Write::write_all(&mut container, &buffer).ok();
                    let is_last = content_len as u64 == remaining;
                    if !self.send_container(container, is_last) {
                        error!("could not send data header");
                    } else {
                        bytes_sent += content_len as u64;
                        remaining -= content_len as u64;
                        sender.offset_now += content_len as u64;
                        header_sent = true;
                        content_sent = remaining == 0;
                    }
                }
                Err(err) => code = err,
            }
        }

        let mut buffer = vec![0u8; SEND_BUFFER_LEN];
        while code == Resp::Ok && header_sent && !content_sent {
            let content_len = remaining.min(SEND_BUFFER_LEN as u64) as usize;
            match self
                .storage
                .read_data(sender.handle, sender.offset_now, &mut buffer[..content_len])
            {
                Ok(()) => {
                    let is_last = content_len as u64 == remaining;
                    if !self.transporter.send_data(&buffer[..content_len], is_last) {
                        error!("could not send data content");
                        break;
                    }
                    bytes_sent += content_len as u64;
                    remaining -= content_len as u64;
                    sender.offset_now += content_len as u64;
                    content_sent = remaining == 0;
                }
                Err(err) => code = err,
            }
        }

        if header_sent && !content_sent {
            // Part of the data container went out, so a clean error reply
            // is impossible; abandon the command and let the initiator
            // time out.
            error!("could not finish data phase");
            return;
        }

        use StandardCommandCode::*;
        let with_length_param = matches!(
            CommandCode::from_u16(op_code),
            Some(CommandCode::Standard(GetPartialObject))
                | Some(CommandCode::Android(AndroidCommandCode::GetPartialObject64))
        );
        if with_length_param {
            let reported = bytes_sent.min(CONTAINER_LENGTH_HUGE as u64) as u32;
            self.send_response_params(code, &[reported]);
        } else {
            self.send_response(code);
        }
    }

    fn get_thumb_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let desc = self
                .props
                .object_prop_desc(FormatCategory::Image, properties::OBJ_PROP_REP_SAMPLE_DATA)
                .map(Clone::clone);
            code = match desc {
                Ok(desc) => match self.storage.get_object_property_value(handle, &desc) {
                    Ok(MtpData::AUINT8(thumbnail)) => {
                        let Ok(mut container) = self.data_container() else { return };
                        std::io::Write::write_all(&mut container, &thumbnail).ok();
                        self.send_data_and_response(container, Resp::Ok);
                        return;
                    }
                    Ok(_) => Resp::GeneralError,
                    Err(err) => err,
                },
                Err(err) => err,
            };
        }
        self.send_response(code);
    }

    /* ===================================================================
     * Object lifecycle
     * =================================================================== */

    fn delete_object_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let format = params.get(1).copied().unwrap_or(0) as u16;
            code = match self.storage.delete_item(handle, format) {
                Ok(()) => Resp::Ok,
                Err(err) => err,
            };
        }
        self.send_response(code);
    }

    fn send_object_info_req(&mut self) {
        self.txn.resp = self.pre_check();
        // data phase follows -> send_object_info_data()
    }

    fn send_object_info_data(&mut self) {
        let mut code = self.txn.resp;
        let mut response_params = [0u32; 3];

        if code == Resp::Ok {
            self.prop_list = None;
            self.send_object = None;

            let params = self.request_params();
            let info = self
                .txn
                .data
                .as_ref()
                .ok_or(Resp::InvalidDataset)
                .and_then(|container| {
                    ObjectInfo::decode(&mut container.reader()).map_err(|_| Resp::InvalidDataset)
                });

            match info {
                Ok(mut info) => {
                    // a wire size of 0xFFFFFFFF means >= 4 GiB, which this
                    // path cannot express
                    if info.compressed_size == u32::MAX as u64 {
                        code = Resp::ObjectTooLarge;
                    } else {
                        let storage_id = StorageId(params.first().copied().unwrap_or(0));
                        let parent = params.get(1).copied().unwrap_or(0);
                        // some hosts send the info with a blank parent
                        info.parent_object = parent;
                        match self.storage.add_item(storage_id, parent, &info) {
                            Ok((storage_id, parent, handle)) => {
                                response_params = [storage_id.0, parent, handle];
                                self.send_object = Some(SendObjectSequence {
                                    handle,
                                    info,
                                    bytes_written: 0,
                                });
                            }
                            Err(err) => code = err,
                        }
                    }
                }
                Err(err) => code = err,
            }
        }

        if code == Resp::Ok {
            self.send_response_params(Resp::Ok, &response_params);
        } else {
            self.send_object = None;
            self.send_response(code);
        }
    }

    fn send_object_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok && self.send_object.is_none() && self.prop_list.is_none() {
            // no SendObjectInfo / SendObjectPropList preceded this
            code = Resp::NoValidObjectInfo;
        }
        self.txn.resp = code;
        // data phase follows -> send_object_data()
    }

    fn send_object_data(&mut self, data: &[u8], is_first_packet: bool, is_last_packet: bool) {
        let mut code = Resp::Ok;
        let handle = self
            .send_object
            .as_ref()
            .map(|seq| seq.handle)
            .or_else(|| self.prop_list.as_ref().map(|info| info.handle))
            .unwrap_or(0);

        if handle == 0 {
            code = Resp::NoValidObjectInfo;
        } else {
            // the first packet starts with the container header, which is
            // not file content
            let content = if is_first_packet {
                if data.len() >= CONTAINER_HEADER_SIZE {
                    &data[CONTAINER_HEADER_SIZE..]
                } else {
                    code = Resp::GeneralError;
                    &[][..]
                }
            } else {
                data
            };

            if code == Resp::Ok {
                code = match self
                    .storage
                    .write_data(handle, Some(content), is_first_packet, is_last_packet)
                {
                    Ok(()) => Resp::Ok,
                    Err(err) => err,
                };
            }

            if code == Resp::Ok {
                match self.send_object_check(content.len() as u64, is_last_packet) {
                    SendObjectOutcome::Complete(result) => code = result,
                    SendObjectOutcome::AwaitMore => return,
                }
            }
        }

        // transfer finished one way or the other
        self.send_object = None;

        if code == Resp::Ok {
            self.apply_prop_list_after_send_object(handle);
        }
        // trigger close of the file in the storage; errors are moot here
        let _ = self.storage.write_data(handle, None, false, true);
        self.send_response(code);
        if code == Resp::Ok {
            self.dispatch_event(StandardEventCode::ObjectAdded, &[handle]);
        }
        // kept alive until after the response for cancel handling
        self.prop_list = None;
    }

    /// Compares accumulated bytes against the declared size once a packet
    /// has been written.
    fn send_object_check(&mut self, data_len: u64, is_last_packet: bool) -> SendObjectOutcome {
        let (expected, written) = if let Some(info) = self.prop_list.as_mut() {
            info.current_size += data_len;
            (info.object_size, info.current_size)
        } else if let Some(seq) = self.send_object.as_mut() {
            seq.bytes_written += data_len;
            (seq.info.compressed_size, seq.bytes_written)
        } else {
            return SendObjectOutcome::Complete(Resp::GeneralError);
        };

        if expected > written {
            if is_last_packet {
                // short transfer: dispose of what was written so the
                // initiator can resend the object
                let handle = self
                    .prop_list
                    .as_ref()
                    .map(|info| info.handle)
                    .or_else(|| self.send_object.as_ref().map(|seq| seq.handle))
                    .unwrap_or(0);
                let _ = self.storage.write_data(handle, None, false, true);
                let _ = self.storage.truncate_item(handle, 0);
                SendObjectOutcome::Complete(Resp::IncompleteTransfer)
            } else {
                SendObjectOutcome::AwaitMore
            }
        } else {
            SendObjectOutcome::Complete(Resp::Ok)
        }
    }

    /// Values carried in a preceding SendObjectPropList are applied once
    /// the content lands. The filename was already consumed; a Name equal
    /// to the filename is a host habit, not metadata.
    fn apply_prop_list_after_send_object(&mut self, handle: ObjHandle) {
        let Some(info) = self.prop_list.as_ref() else { return };
        let category = self.devinfo.format_category(info.format);
        let filename = self
            .storage
            .object_info(handle)
            .map(|info| info.filename)
            .unwrap_or_default();

        let mut entries = Vec::new();
        for element in &info.elements {
            if element.prop_code == properties::OBJ_PROP_OBJECT_FILE_NAME {
                continue;
            }
            if element.prop_code == properties::OBJ_PROP_NAME
                && element.value.as_str() == Some(filename.as_str())
            {
                continue;
            }
            if let Ok(desc) = self.props.object_prop_desc(category, element.prop_code) {
                entries.push((desc, element.value.clone()));
            }
        }
        if !entries.is_empty() {
            let entries: Vec<(&properties::ObjPropDesc, MtpData)> = entries
                .iter()
                .map(|(desc, value)| (*desc, value.clone()))
                .collect();
            let _ = self.storage.set_object_property_value(handle, &entries);
        }
    }

    fn move_object_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let storage_id = StorageId(params.get(1).copied().unwrap_or(0));
            let parent = params.get(2).copied().unwrap_or(0);

            code = if let Err(err) = self.storage.check_handle(handle) {
                err
            } else if let Err(err) = self.storage.check_storage(storage_id) {
                err
            } else if parent != 0 && self.storage.check_handle(parent).is_err() {
                Resp::InvalidParentObject
            } else {
                // parent 0 addresses the destination storage's root
                match self.storage.move_object(handle, parent, storage_id) {
                    Ok(()) => Resp::Ok,
                    Err(err) => err,
                }
            };
        }
        self.send_response(code);
    }

    fn copy_object_req(&mut self) {
        let mut code = self.pre_check();
        let mut copied = 0;
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let storage_id = StorageId(params.get(1).copied().unwrap_or(0));
            let parent = params.get(2).copied().unwrap_or(0);

            code = if let Err(err) = self.storage.check_handle(handle) {
                err
            } else if let Err(err) = self.storage.check_storage(storage_id) {
                err
            } else if parent != 0 && self.storage.check_handle(parent).is_err() {
                Resp::InvalidParentObject
            } else {
                // parent 0 addresses the destination storage's root
                match self.storage.copy_object(handle, parent, storage_id) {
                    Ok(handle) => {
                        copied = handle;
                        Resp::Ok
                    }
                    Err(err) => err,
                }
            };
        }
        if self.state == State::TxCancel {
            return;
        }
        self.send_response_params(code, &[copied]);
    }

    /* ===================================================================
     * Device properties
     * =================================================================== */

    fn get_device_prop_desc_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let prop = params.first().copied().unwrap_or(0) as u16;
            match self.props.device_prop_desc(prop, &self.devinfo) {
                Ok(desc) => {
                    let Ok(mut container) = self.data_container() else { return };
                    desc.encode(&mut container).ok();
                    self.send_data_and_response(container, Resp::Ok);
                    return;
                }
                Err(err) => code = err,
            }
        }
        self.send_response(code);
    }

    fn get_device_prop_value_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let prop = params.first().copied().unwrap_or(0) as u16;
            match self.props.device_prop_desc(prop, &self.devinfo) {
                Ok(desc) => {
                    let Ok(mut container) = self.data_container() else { return };
                    desc.current.encode(&mut container).ok();
                    self.send_data_and_response(container, Resp::Ok);
                    return;
                }
                Err(err) => code = err,
            }
        }
        self.send_response(code);
    }

    fn set_device_prop_value_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let prop = params.first().copied().unwrap_or(0) as u16;
            if self.props.device_prop_desc(prop, &self.devinfo).is_err() {
                code = Resp::DevicePropNotSupported;
            }
        }
        // value arrives in the data phase; an error detected here is
        // reported after the data phase completes
        self.txn.resp = code;
    }

    fn set_device_prop_value_data(&mut self) {
        let params = self.request_params();
        let prop = params.first().copied().unwrap_or(0) as u16;
        let Some(container) = self.txn.data.as_ref() else {
            self.send_response(Resp::GeneralError);
            return;
        };
        let mut reader = container.reader();

        let mut code = Resp::Ok;
        match prop {
            properties::DEV_PROP_DEVICE_FRIENDLY_NAME => match reader.read_mtp_str() {
                Ok(name) => self.devinfo.set_friendly_name(&name),
                Err(_) => code = Resp::InvalidDevicePropValue,
            },
            properties::DEV_PROP_SYNCHRONIZATION_PARTNER => match reader.read_mtp_str() {
                Ok(partner) => self.devinfo.set_sync_partner(&partner),
                Err(_) => code = Resp::InvalidDevicePropValue,
            },
            properties::DEV_PROP_VOLUME => {
                let _ = reader.read_mtp_i32();
            }
            _ => {}
        }

        self.send_response(code);
        if code == Resp::Ok {
            self.dispatch_event(StandardEventCode::DevicePropChanged, &[prop as u32]);
        }
    }

    /* ===================================================================
     * Object properties
     * =================================================================== */

    fn get_object_props_supported_req(&mut self) {
        // this operation does not need an open session
        let mut code = self.pre_check_session(SESSION_SYNTHETIC);
        if code != Resp::Ok {
            self.send_response(Resp::InvalidTransactionId);
            return;
        }
        let params = self.request_params();
        let format = params.first().copied().unwrap_or(0) as u16;
        let category = self.devinfo.format_category(format);
        match self.props.object_props_supported(category) {
            Ok(codes) => {
                let Ok(mut container) = self.data_container() else { return };
                container.write_mtp_u16_vec(&codes).ok();
                self.send_data_and_response(container, Resp::Ok);
            }
            Err(err) => {
                code = err;
                self.send_response(code);
            }
        }
    }

    fn get_object_prop_desc_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let prop = params.first().copied().unwrap_or(0) as u16;
            let format = params.get(1).copied().unwrap_or(0) as u16;
            let category = self.devinfo.format_category(format);
            if category == FormatCategory::Unsupported {
                code = Resp::InvalidObjectPropFormat;
            } else {
                match self.props.object_prop_desc(category, prop) {
                    Ok(desc) => {
                        let desc = desc.clone();
                        let Ok(mut container) = self.data_container() else { return };
                        desc.encode(&mut container).ok();
                        self.send_data_and_response(container, Resp::Ok);
                        return;
                    }
                    Err(err) => code = err,
                }
            }
        }
        self.send_response(code);
    }

    fn get_object_prop_value_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let prop = params.get(1).copied().unwrap_or(0) as u16;

            let desc = self
                .storage
                .object_info(handle)
                .and_then(|info| {
                    let category = self.devinfo.format_category(info.object_format);
                    self.props.object_prop_desc(category, prop).map(Clone::clone)
                });

            match desc {
                Ok(desc) => {
                    let value = match self.storage.get_object_property_value(handle, &desc) {
                        Ok(value) => Ok(value),
                        Err(Resp::ObjectPropNotSupported) => {
                            // give loaded extensions a chance; a property we
                            // advertise but have no value for is still
                            // answered, with an empty value of its type
                            let extension_value = self.storage.path(handle).ok().and_then(
                                |path| {
                                    self.extensions
                                        .get_object_prop_value(&path, prop)
                                        .map(|(value, _)| value)
                                },
                            );
                            Ok(extension_value
                                .unwrap_or_else(|| MtpData::default_for(desc.data_type)))
                        }
                        Err(err) => Err(err),
                    };
                    match value {
                        Ok(value) => {
                            let Ok(mut container) = self.data_container() else { return };
                            value.encode(&mut container).ok();
                            self.send_data_and_response(container, Resp::Ok);
                            return;
                        }
                        Err(err) => code = err,
                    }
                }
                Err(err) => code = err,
            }
        }
        self.send_response(code);
    }

    fn set_object_prop_value_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let prop = params.get(1).copied().unwrap_or(0) as u16;
            code = match self.storage.object_info(handle) {
                Ok(info) => {
                    let category = self.devinfo.format_category(info.object_format);
                    match self.props.object_prop_desc(category, prop) {
                        Ok(desc) if !desc.writable => Resp::AccessDenied,
                        Ok(_) => Resp::Ok,
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };
        }
        self.txn.resp = code;
        // data phase follows -> set_object_prop_value_data()
    }

    fn set_object_prop_value_data(&mut self) {
        let mut code = self.txn.resp;
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            let prop = params.get(1).copied().unwrap_or(0) as u16;

            let desc = self
                .storage
                .object_info(handle)
                .and_then(|info| {
                    let category = self.devinfo.format_category(info.object_format);
                    self.props.object_prop_desc(category, prop).map(Clone::clone)
                });

            code = match desc {
                Ok(desc) => {
                    let value = self
                        .txn
                        .data
                        .as_ref()
                        .ok_or(Resp::InvalidDataset)
                        .and_then(|container| {
                            MtpData::read_type(desc.data_type, &mut container.reader())
                                .map_err(|_| Resp::InvalidObjectPropValue)
                        });
                    match value {
                        Ok(value) => {
                            let result = self
                                .storage
                                .set_object_property_value(handle, &[(&desc, value.clone())]);
                            match result {
                                Ok(()) => Resp::Ok,
                                Err(Resp::ObjectPropNotSupported) => {
                                    match self.storage.path(handle) {
                                        Ok(path) => self
                                            .extensions
                                            .set_object_prop_value(&path, prop, &value)
                                            .and_then(Resp::from_u16)
                                            .unwrap_or(Resp::ObjectPropNotSupported),
                                        Err(_) => Resp::ObjectPropNotSupported,
                                    }
                                }
                                Err(err) => err,
                            }
                        }
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };
        }
        self.send_response(code);
    }

    fn get_object_prop_list_req(&mut self) {
        let mut code = self.pre_check();
        if code != Resp::Ok {
            self.send_response(code);
            return;
        }

        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        let format = params.get(1).copied().unwrap_or(0) as u16;
        let prop_code = params.get(2).copied().unwrap_or(0) as u16;
        let depth = params.get(4).copied().unwrap_or(0);

        if handle == 0 && depth == 0 {
            // by definition an empty set
            let Ok(mut container) = self.data_container() else { return };
            container.write_mtp_u32(0).ok();
            self.send_data_and_response(container, Resp::Ok);
            return;
        }
        if depth > 1 && depth < 0xFFFF_FFFF {
            self.send_response(Resp::SpecificationByDepthUnsupported);
            return;
        }
        if prop_code == 0 {
            // group-code addressing is not supported
            self.send_response(Resp::SpecificationByGroupUnsupported);
            return;
        }
        if format != 0 && self.devinfo.format_category(format) == FormatCategory::Unsupported {
            self.send_response(Resp::InvalidCodeFormat);
            return;
        }

        // folder enumeration in one round trip: immediate children of a
        // real association, every supported property
        if depth == 1
            && handle != 0
            && handle != 0xFFFF_FFFF
            && format == 0
            && prop_code == 0xFFFF
            && self
                .storage
                .object_info(handle)
                .map(|info| info.object_format == crate::format::FORMAT_ASSOCIATION)
                .unwrap_or(false)
        {
            self.get_object_prop_list_children(handle);
            return;
        }

        let mut handles = Vec::new();
        if depth == 0 {
            handles.push(handle);
        } else {
            let top = match handle {
                0 => 0xFFFF_FFFF,
                0xFFFF_FFFF => 0,
                other => other,
            };
            match self.storage.object_handles(StorageId::all(), format, top) {
                Ok(found) => handles = found,
                Err(err) => {
                    self.send_response(err);
                    return;
                }
            }
        }

        let Ok(mut container) = self.data_container() else { return };
        let mut element_count: u32 = 0;
        let mut body: Vec<u8> = Vec::new();
        let mut code_out = Resp::Ok;

        'outer: for current in handles {
            let info = match self.storage.object_info(current) {
                Ok(info) => info,
                Err(err) => {
                    code_out = err;
                    break;
                }
            };
            let mut category = self.devinfo.format_category(info.object_format);
            if category == FormatCategory::Unsupported {
                category = FormatCategory::Common;
            }

            let prop_codes: Vec<u16> = if prop_code == 0xFFFF {
                match self.props.object_props_supported(category) {
                    Ok(codes) => codes
                        .into_iter()
                        .filter(|&code| code != properties::OBJ_PROP_REP_SAMPLE_DATA)
                        .collect(),
                    Err(err) => {
                        code_out = err;
                        break;
                    }
                }
            } else {
                vec![prop_code]
            };

            for prop in prop_codes {
                let desc = match self.props.object_prop_desc(category, prop) {
                    Ok(desc) => desc.clone(),
                    Err(err) => {
                        code_out = err;
                        break 'outer;
                    }
                };
                let value = match self.storage.get_object_property_value(current, &desc) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if value == MtpData::UNDEF {
                    continue;
                }
                body.write_mtp_u32(current).ok();
                body.write_mtp_u16(desc.code).ok();
                body.write_mtp_u16(desc.data_type).ok();
                value.encode(&mut body).ok();
                element_count += 1;
            }
        }

        if code_out != Resp::Ok {
            self.send_response(code_out);
            return;
        }

        container.write_mtp_u32(element_count).ok();
        std::io::Write::write_all(&mut container, &body).ok();
        trace!("prop list with {} elements", element_count);
        self.send_data_and_response(container, Resp::Ok);
    }

    /// Folder listing in one pass: every supported property of every
    /// immediate child, each child serialized against its own category.
    fn get_object_prop_list_children(&mut self, parent: ObjHandle) {
        let children = match self.storage.object_handles(StorageId::all(), 0, parent) {
            Ok(children) => children,
            Err(err) => {
                self.send_response(err);
                return;
            }
        };

        let Ok(mut container) = self.data_container() else { return };
        let mut element_count: u32 = 0;
        let mut body: Vec<u8> = Vec::new();

        for child in children {
            let Ok(info) = self.storage.object_info(child) else { continue };
            let mut category = self.devinfo.format_category(info.object_format);
            if category == FormatCategory::Unsupported {
                category = FormatCategory::Common;
            }
            let descs: Vec<properties::ObjPropDesc> = match self
                .props
                .object_props_supported(category)
            {
                Ok(codes) => codes
                    .into_iter()
                    .filter(|&code| code != properties::OBJ_PROP_REP_SAMPLE_DATA)
                    .filter_map(|code| self.props.object_prop_desc(category, code).ok().cloned())
                    .collect(),
                Err(_) => continue,
            };
            for desc in &descs {
                let value = match self.storage.get_object_property_value(child, desc) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if value == MtpData::UNDEF {
                    continue;
                }
                body.write_mtp_u32(child).ok();
                body.write_mtp_u16(desc.code).ok();
                body.write_mtp_u16(desc.data_type).ok();
                value.encode(&mut body).ok();
                element_count += 1;
            }
        }

        container.write_mtp_u32(element_count).ok();
        std::io::Write::write_all(&mut container, &body).ok();
        self.send_data_and_response(container, Resp::Ok);
    }

    fn set_object_prop_list_req(&mut self) {
        self.txn.resp = self.pre_check();
        // values arrive in the data phase
    }

    fn set_object_prop_list_data(&mut self) {
        let Some(container) = self.txn.data.take() else {
            self.send_response(Resp::GeneralError);
            return;
        };
        let mut reader = container.reader();

        let mut code = Resp::Ok;
        let mut failed_index: u32 = 0;

        let count = reader.read_mtp_u32().unwrap_or(0);
        for index in 0..count {
            let parse = (|| -> Result<(ObjHandle, u16, u16), crate::Error> {
                let handle = reader.read_mtp_u32()?;
                let prop = reader.read_mtp_u16()?;
                Ok((handle, prop, 0))
            })();
            let Ok((handle, prop, _)) = parse else {
                code = Resp::InvalidDataset;
                failed_index = index;
                break;
            };

            let desc = match self.storage.object_info(handle) {
                Ok(info) => {
                    let category = self.devinfo.format_category(info.object_format);
                    self.props.object_prop_desc(category, prop).map(Clone::clone)
                }
                Err(err) => Err(err),
            };
            let desc = match desc {
                Ok(desc) if !desc.writable => {
                    code = Resp::AccessDenied;
                    failed_index = index;
                    break;
                }
                Ok(desc) => desc,
                Err(err) => {
                    code = err;
                    failed_index = index;
                    break;
                }
            };

            let value = reader
                .read_mtp_u16()
                .ok()
                .and_then(|data_type| MtpData::read_type(data_type, &mut reader).ok());
            let Some(value) = value else {
                code = Resp::InvalidDataset;
                failed_index = index;
                break;
            };

            if let Err(err) = self
                .storage
                .set_object_property_value(handle, &[(&desc, value)])
            {
                code = err;
                failed_index = index;
                break;
            }
        }

        if code != Resp::Ok {
            // the response parameter is the 0-based index of the failing
            // element
            self.send_response_params(code, &[failed_index]);
        } else {
            self.send_response(Resp::Ok);
        }
    }

    fn send_object_prop_list_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let storage_id = params.first().copied().unwrap_or(0);
            let parent = params.get(1).copied().unwrap_or(0);
            let format = params.get(2).copied().unwrap_or(0) as u16;
            let size_high = params.get(3).copied().unwrap_or(0) as u64;
            let size_low = params.get(4).copied().unwrap_or(0) as u64;

            if storage_id != 0 {
                if let Err(err) = self.storage.check_storage(StorageId(storage_id)) {
                    code = err;
                }
            }
            if code == Resp::Ok && parent != 0 && parent != 0xFFFF_FFFF {
                if let Err(err) = self.storage.check_handle(parent) {
                    code = err;
                }
            }
            if code == Resp::Ok {
                if size_high != 0 {
                    // >= 4 GiB is out of range for this operation
                    code = Resp::ObjectTooLarge;
                } else {
                    self.prop_list = Some(ObjPropListInfo {
                        storage_id,
                        parent,
                        handle: 0,
                        format,
                        object_size: (size_high << 32) | size_low,
                        current_size: 0,
                        elements: Vec::new(),
                    });
                }
            }
        }
        self.txn.resp = code;
        // the property list itself arrives in the data phase
    }

    fn send_object_prop_list_data(&mut self) {
        if self.prop_list.is_none() || self.txn.resp != Resp::Ok {
            let code = if self.prop_list.is_none() {
                Resp::GeneralError
            } else {
                self.txn.resp
            };
            self.send_response(code);
            return;
        }

        let Some(container) = self.txn.data.take() else {
            self.send_response(Resp::GeneralError);
            return;
        };
        let mut reader = container.reader();

        let mut code = Resp::Ok;
        let mut failed_index: u32 = 0;
        let mut filename: Option<String> = None;
        let mut elements = Vec::new();

        let count = reader.read_mtp_u32().unwrap_or(0);
        let category = self
            .prop_list
            .as_ref()
            .map(|info| self.devinfo.format_category(info.format))
            .unwrap_or(FormatCategory::Common);

        for index in 0..count {
            let handle = match reader.read_mtp_u32() {
                Ok(handle) => handle,
                Err(_) => {
                    code = Resp::InvalidDataset;
                    failed_index = index;
                    break;
                }
            };
            // object creation datasets must leave the handle to us
            if handle != 0 {
                code = Resp::InvalidDataset;
                failed_index = index;
                break;
            }
            let parsed = (|| -> Result<(u16, u16), crate::Error> {
                let prop = reader.read_mtp_u16()?;
                let data_type = reader.read_mtp_u16()?;
                Ok((prop, data_type))
            })();
            let Ok((prop, data_type)) = parsed else {
                code = Resp::InvalidDataset;
                failed_index = index;
                break;
            };
            if self.props.object_prop_desc(category, prop).is_err() {
                code = Resp::InvalidDataset;
                failed_index = index;
                break;
            }
            let Ok(value) = MtpData::read_type(data_type, &mut reader) else {
                code = Resp::InvalidDataset;
                failed_index = index;
                break;
            };
            if prop == properties::OBJ_PROP_OBJECT_FILE_NAME {
                filename = value.as_str().map(|s| s.to_owned());
            }
            elements.push(PropListElement {
                prop_code: prop,
                value,
            });
        }

        let mut response_params: Vec<u32> = Vec::new();
        if code == Resp::Ok {
            match filename {
                None => code = Resp::InvalidDataset,
                Some(name) if name.is_empty() => code = Resp::InvalidDataset,
                Some(name) => {
                    let (storage_id, parent, format, object_size) = {
                        let info = self.prop_list.as_ref().unwrap();
                        (info.storage_id, info.parent, info.format, info.object_size)
                    };
                    let object_info = ObjectInfo {
                        storage_id,
                        compressed_size: object_size,
                        parent_object: parent,
                        object_format: format,
                        filename: name,
                        ..Default::default()
                    };
                    match self
                        .storage
                        .add_item(StorageId(storage_id), parent, &object_info)
                    {
                        Ok((storage_id, parent, handle)) => {
                            let info = self.prop_list.as_mut().unwrap();
                            info.storage_id = storage_id.0;
                            info.parent = parent;
                            info.handle = handle;
                            info.elements = elements;
                            response_params = vec![storage_id.0, parent, handle];
                        }
                        Err(err) => code = err,
                    }
                }
            }
        }

        if code != Resp::Ok {
            self.prop_list = None;
            response_params = vec![0, 0, 0, failed_index];
        }
        self.send_response_params(code, &response_params);
    }

    /* ===================================================================
     * Object references
     * =================================================================== */

    fn get_object_references_req(&mut self) {
        let mut code = self.pre_check();
        if code == Resp::Ok {
            let params = self.request_params();
            let handle = params.first().copied().unwrap_or(0);
            match self.storage.get_references(handle) {
                Ok(references) => {
                    let Ok(mut container) = self.data_container() else { return };
                    container.write_mtp_u32_vec(&references).ok();
                    self.send_data_and_response(container, Resp::Ok);
                    return;
                }
                Err(err) => code = err,
            }
        }
        self.send_response(code);
    }

    fn set_object_references_req(&mut self) {
        self.txn.resp = self.pre_check();
        // references arrive in the data phase
    }

    fn set_object_references_data(&mut self) {
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        let references = self
            .txn
            .data
            .as_ref()
            .ok_or(Resp::InvalidDataset)
            .and_then(|container| {
                container
                    .reader()
                    .read_mtp_u32_vec()
                    .map_err(|_| Resp::InvalidDataset)
            });
        let code = match references {
            Ok(references) => match self.storage.set_references(handle, &references) {
                Ok(()) => Resp::Ok,
                Err(err) => err,
            },
            Err(err) => err,
        };
        self.send_response(code);
    }

    fn skip_req(&mut self) {
        let code = self.pre_check();
        self.send_response(code);
    }

    /* ===================================================================
     * Android extension operations
     * =================================================================== */

    fn send_partial_object64_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        let offset = (params.get(2).copied().unwrap_or(0) as u64) << 32
            | params.get(1).copied().unwrap_or(0) as u64;

        if code == Resp::Ok {
            code = match self.edit_object.as_ref() {
                None => Resp::GeneralError,
                Some(seq) if seq.handle != handle => Resp::InvalidObjectHandle,
                Some(_) => Resp::Ok,
            };
        }
        if code == Resp::Ok {
            if let Some(seq) = self.edit_object.as_mut() {
                seq.write_offset = offset;
            }
        }
        // the data phase runs regardless, to keep the wire aligned
        self.txn.resp = code;
    }

    fn send_partial_object64_data(
        &mut self,
        data: &[u8],
        is_first_packet: bool,
        is_last_packet: bool,
    ) -> Resp {
        let Some((handle, offset)) = self
            .edit_object
            .as_ref()
            .map(|seq| (seq.handle, seq.write_offset))
        else {
            return Resp::GeneralError;
        };

        let content = if is_first_packet {
            if data.len() < CONTAINER_HEADER_SIZE {
                return Resp::GeneralError;
            }
            &data[CONTAINER_HEADER_SIZE..]
        } else {
            data
        };

        let result = self.storage.write_partial_data(
            handle,
            offset,
            content,
            is_first_packet,
            is_last_packet,
        );
        if let Some(seq) = self.edit_object.as_mut() {
            seq.write_offset += content.len() as u64;
        }
        match result {
            Ok(()) => Resp::Ok,
            Err(err) => err,
        }
    }

    fn truncate_object64_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);
        let offset = (params.get(2).copied().unwrap_or(0) as u64) << 32
            | params.get(1).copied().unwrap_or(0) as u64;

        if code == Resp::Ok {
            code = match self.edit_object.as_ref() {
                None => Resp::GeneralError,
                Some(seq) if seq.handle != handle => Resp::InvalidObjectHandle,
                Some(_) => Resp::Ok,
            };
        }
        if code == Resp::Ok {
            code = match self.storage.truncate_item(handle, offset) {
                Ok(()) => Resp::Ok,
                Err(err) => err,
            };
        }
        self.send_response(code);
    }

    fn begin_edit_object_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);

        if code == Resp::Ok {
            code = match self.storage.check_handle(handle) {
                Ok(()) => Resp::Ok,
                Err(err) => err,
            };
        }
        if code == Resp::Ok {
            // an ongoing edit session is silently abandoned
            self.edit_object = Some(EditObjectSequence {
                handle,
                write_offset: 0,
            });
            // edits should not echo back as change notifications
            let _ = self.storage.set_events_enabled(handle, false);
        }
        self.send_response(code);
    }

    fn end_edit_object_req(&mut self) {
        let mut code = self.pre_check();
        let params = self.request_params();
        let handle = params.first().copied().unwrap_or(0);

        if code == Resp::Ok {
            code = match self.edit_object.as_ref() {
                None => Resp::GeneralError,
                Some(seq) if seq.handle != handle => Resp::InvalidObjectHandle,
                Some(_) => Resp::Ok,
            };
        }
        if code == Resp::Ok {
            let _ = self.storage.set_events_enabled(handle, true);
            self.edit_object = None;
        }
        self.send_response(code);
    }
}
