use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::container::{CONTAINER_HEADER_SIZE, CONTAINER_LENGTH_HUGE};

/// Matches the kernel-side USB transfer size.
pub const MAX_DATA_IN_SIZE: usize = 16 * 1024;
const MAX_CONTROL_IN_SIZE: usize = 64;

/// Bulk packet sizes by bus speed; the ZLP rule keys off the high-speed
/// size.
pub const FS_DATA_PKT_SIZE: u16 = 64;
pub const HS_DATA_PKT_SIZE: u16 = 512;
/// Interrupt packets only ever carry one event container; three parameters
/// fit in 24 bytes.
const EVENT_PKT_SIZE: u16 = 28;

/// Cap on queued interrupt events. Small enough not to starve bulk
/// throughput, large enough to survive a few hundred file deletions.
const MAX_EVENTS_STORED: usize = 512;

/// Backpressure for the bulk reader: the in-flight chunk budget matches
/// the original's 16-transfer ring.
const READER_QUEUE_CHUNKS: usize = 16;

/* USB Still Image Capture Device Definition, section 5. */
const REQ_CANCEL: u8 = 0x64;
const REQ_DEVICE_RESET: u8 = 0x66;
const REQ_GET_DEVICE_STATUS: u8 = 0x67;

const USB_DIR_IN: u8 = 0x80;

/* FunctionFS event types, from linux/usb/functionfs.h. */
const FUNCTIONFS_BIND: u8 = 0;
const FUNCTIONFS_UNBIND: u8 = 1;
const FUNCTIONFS_ENABLE: u8 = 2;
const FUNCTIONFS_DISABLE: u8 = 3;
const FUNCTIONFS_SETUP: u8 = 4;
const FUNCTIONFS_SUSPEND: u8 = 5;
const FUNCTIONFS_RESUME: u8 = 6;

const FUNCTIONFS_DESCRIPTORS_MAGIC: u32 = 1;
const FUNCTIONFS_STRINGS_MAGIC: u32 = 2;

const USB_DT_INTERFACE: u8 = 0x04;
const USB_DT_ENDPOINT: u8 = 0x05;
const USB_CLASS_STILL_IMAGE: u8 = 0x06;
const USB_SUBCLASS_PTP: u8 = 0x01;
const USB_PROTOCOL_PTP: u8 = 0x01;
const USB_ENDPOINT_XFER_BULK: u8 = 0x02;
const USB_ENDPOINT_XFER_INT: u8 = 0x03;

const ENGLISH_US: u16 = 0x0409;
const MTP_STRING_DESCRIPTOR: &str = "MTP";

/// The three device-status replies to the class-specific GET_DEVICE_STATUS
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    Busy,
    TxCancelled,
}

impl DeviceStatus {
    fn record(self) -> [u8; 4] {
        let code: u16 = match self {
            DeviceStatus::Ok => 0x2001,
            DeviceStatus::Busy => 0x2019,
            DeviceStatus::TxCancelled => 0x201F,
        };
        let mut record = [0u8; 4];
        record[..2].copy_from_slice(&4u16.to_le_bytes());
        record[2..].copy_from_slice(&code.to_le_bytes());
        record
    }
}

/// Signals from the control endpoint, translated for the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    StartIo,
    StopIo,
    BindUsb,
    UnbindUsb,
    Suspend,
    Resume,
    CancelTransaction,
    DeviceReset,
}

/// What the transport delivers into the responder's mailbox.
#[derive(Debug)]
pub enum TransportEvent {
    /// Raw bulk-out bytes; container framing happens in the splitter.
    Data(Vec<u8>),
    Control(ControlEvent),
}

/// The transport seam the responder talks through.
pub trait Transporter: Send {
    fn activate(&mut self) -> bool;
    fn deactivate(&mut self);
    /// Abort endpoint I/O and restart the bulk pipes after a framing error.
    fn reset(&mut self);
    /// Synchronous bulk-in send; false means the transfer was aborted
    /// (cancel, shutdown).
    fn send_data(&mut self, data: &[u8], is_last_packet: bool) -> bool;
    /// Queue one event container on the interrupt pipe.
    fn send_event(&mut self, data: &[u8]) -> bool;
    fn set_device_status(&mut self, status: DeviceStatus);
    /// The responder finished tearing down a cancelled transaction; bulk
    /// transfers may flow again.
    fn cancel_acknowledged(&mut self) {}
}

/* =======================================================================
 * Container framing
 * ======================================================================= */

/// Reassembles the bulk-out byte stream into containers: consume the length
/// field, then emit exactly that many bytes as one container. The
/// 0xFFFFFFFF escape asks the responder for the expected object size.
#[derive(Default)]
pub struct ContainerSplitter {
    remaining: u64,
}

impl ContainerSplitter {
    pub fn reset(&mut self) {
        self.remaining = 0;
    }

    /// Splits `data` into (chunk, is_first, is_last) container pieces.
    pub fn split<'a, F: FnMut(&[u8]) -> u64>(
        &mut self,
        mut data: &'a [u8],
        mut fetch_object_size: F,
    ) -> Vec<(&'a [u8], bool, bool)> {
        let mut pieces = Vec::new();
        while !data.is_empty() {
            let mut is_first = false;
            if self.remaining == 0 {
                if data.len() < 4 {
                    warn!("dropping {} stray bulk bytes", data.len());
                    break;
                }
                let field = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.remaining = if field == CONTAINER_LENGTH_HUGE {
                    let object_size = fetch_object_size(data);
                    if object_size > (CONTAINER_LENGTH_HUGE as u64 - CONTAINER_HEADER_SIZE as u64)
                    {
                        object_size + CONTAINER_HEADER_SIZE as u64
                    } else {
                        CONTAINER_LENGTH_HUGE as u64
                    }
                } else {
                    field as u64
                };
                is_first = true;
            }

            let chunk = (data.len() as u64).min(self.remaining) as usize;
            self.remaining -= chunk as u64;
            pieces.push((&data[..chunk], is_first, self.remaining == 0));
            data = &data[chunk..];
        }
        pieces
    }
}

/* =======================================================================
 * Endpoint descriptors
 * ======================================================================= */

fn write_interface_descriptor(out: &mut Vec<u8>) {
    out.push(9);
    out.push(USB_DT_INTERFACE);
    out.push(0); // bInterfaceNumber
    out.push(0); // bAlternateSetting
    out.push(3); // bNumEndpoints
    out.push(USB_CLASS_STILL_IMAGE);
    out.push(USB_SUBCLASS_PTP);
    out.push(USB_PROTOCOL_PTP);
    out.push(1); // iInterface
}

fn write_endpoint_descriptor(out: &mut Vec<u8>, address: u8, attributes: u8, max_packet: u16, interval: u8) {
    out.push(7);
    out.push(USB_DT_ENDPOINT);
    out.push(address);
    out.push(attributes);
    out.write_u16::<LittleEndian>(max_packet).ok();
    out.push(interval);
}

fn write_descriptor_set(out: &mut Vec<u8>, data_pkt: u16, interrupt_interval: u8) {
    write_interface_descriptor(out);
    write_endpoint_descriptor(out, 1 | USB_DIR_IN, USB_ENDPOINT_XFER_BULK, data_pkt, 0);
    write_endpoint_descriptor(out, 2, USB_ENDPOINT_XFER_BULK, data_pkt, 0);
    write_endpoint_descriptor(
        out,
        3 | USB_DIR_IN,
        USB_ENDPOINT_XFER_INT,
        EVENT_PKT_SIZE,
        interrupt_interval,
    );
}

/// Descriptor block pushed to ep0 at activation: header plus full-speed and
/// high-speed sets.
pub fn descriptors_block() -> Vec<u8> {
    let mut body = Vec::new();
    // full speed: bInterval counts 1 ms frames
    write_descriptor_set(&mut body, FS_DATA_PKT_SIZE, 16);
    // high speed: 2^(bInterval-1) microframes, so 3 is 4 microframes
    write_descriptor_set(&mut body, HS_DATA_PKT_SIZE, 3);

    let mut block = Vec::new();
    block.write_u32::<LittleEndian>(FUNCTIONFS_DESCRIPTORS_MAGIC).ok();
    block.write_u32::<LittleEndian>((16 + body.len()) as u32).ok();
    block.write_u32::<LittleEndian>(4).ok(); // fs_count
    block.write_u32::<LittleEndian>(4).ok(); // hs_count
    block.extend_from_slice(&body);
    block
}

/// Strings block: one US-English string, "MTP".
pub fn strings_block() -> Vec<u8> {
    let text = MTP_STRING_DESCRIPTOR.as_bytes();
    let length = 16 + 2 + text.len() + 1;

    let mut block = Vec::new();
    block.write_u32::<LittleEndian>(FUNCTIONFS_STRINGS_MAGIC).ok();
    block.write_u32::<LittleEndian>(length as u32).ok();
    block.write_u32::<LittleEndian>(1).ok(); // str_count
    block.write_u32::<LittleEndian>(1).ok(); // lang_count
    block.write_u16::<LittleEndian>(ENGLISH_US).ok();
    block.extend_from_slice(text);
    block.push(0);
    block
}

/* =======================================================================
 * Interruptible blocking I/O threads
 * ======================================================================= */

extern "C" fn handle_usr1(_signum: libc::c_int) {
    // exists only so blocking I/O returns with EINTR
}

fn catch_usr1() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(handle_usr1),
            SaFlags::empty(),
            SigSet::empty(),
        );
        if unsafe { sigaction(Signal::SIGUSR1, &action) }.is_err() {
            warn!("could not establish SIGUSR1 handler");
        }
    });
}

/// One endpoint thread. Blocking syscalls are broken out of with a targeted
/// SIGUSR1; shutdown loops signal-and-wait to close the race where the
/// interrupt lands before the thread blocks.
struct IoThread {
    join: Option<thread::JoinHandle<()>>,
    should_exit: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    pthread: Arc<Mutex<Option<Pthread>>>,
}

#[derive(Clone)]
struct IoThreadCtl {
    should_exit: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    pthread: Arc<Mutex<Option<Pthread>>>,
}

impl IoThreadCtl {
    fn register(&self) {
        catch_usr1();
        *self.pthread.lock().unwrap() = Some(pthread_self());
    }

    fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        *self.pthread.lock().unwrap() = None;
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl IoThread {
    fn spawn<F>(name: &str, body: F) -> IoThread
    where
        F: FnOnce(IoThreadCtl) + Send + 'static,
    {
        let should_exit = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let pthread = Arc::new(Mutex::new(None));
        let ctl = IoThreadCtl {
            should_exit: should_exit.clone(),
            finished: finished.clone(),
            pthread: pthread.clone(),
        };
        let join = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                ctl.register();
                body(ctl.clone());
                ctl.finish();
            })
            .ok();
        IoThread {
            join,
            should_exit,
            finished,
            pthread,
        }
    }

    fn interrupt(&self) {
        if let Some(pthread) = *self.pthread.lock().unwrap() {
            let _ = pthread_kill(pthread, Signal::SIGUSR1);
        }
    }

    fn stop(mut self) {
        let Some(join) = self.join.take() else { return };
        self.should_exit.store(true, Ordering::SeqCst);
        // looping closes the race where the signal lands just before the
        // thread enters its blocking syscall
        while !self.finished.load(Ordering::SeqCst) {
            self.interrupt();
            thread::sleep(Duration::from_millis(1));
        }
        let _ = join.join();
    }
}

fn read_fd(fd: i32, buf: &mut [u8]) -> Result<usize, Errno> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    Errno::result(rc).map(|n| n as usize)
}

fn write_fd(fd: i32, buf: &[u8]) -> Result<usize, Errno> {
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    Errno::result(rc).map(|n| n as usize)
}

/// Protocol stall: request I/O in the "wrong" direction; the kernel maps
/// the zero-length transfer to a halted endpoint.
fn stall(fd: i32, dir_in: bool) {
    let result = if dir_in {
        read_fd(fd, &mut [])
    } else {
        write_fd(fd, &[])
    };
    match result {
        Err(Errno::EL2HLT) => {}
        _ => error!("unable to halt endpoint"),
    }
}

fn control_reader(
    ctl: IoThreadCtl,
    fd: i32,
    events: SyncSender<TransportEvent>,
    status: Arc<Mutex<DeviceStatus>>,
    cancel_flag: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_CONTROL_IN_SIZE];

    let send = |event: ControlEvent| {
        let _ = events.send(TransportEvent::Control(event));
    };

    while !ctl.should_exit() {
        let read_size = match read_fd(fd, &mut buf) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("control endpoint read failed: {}", err);
                break;
            }
        };

        // ep0 delivers a stream of 12-byte functionfs events
        for event in buf[..read_size].chunks_exact(12) {
            let event_type = event[8];
            trace!("control event {}", event_type);
            match event_type {
                FUNCTIONFS_ENABLE | FUNCTIONFS_RESUME => {
                    send(if event_type == FUNCTIONFS_ENABLE {
                        ControlEvent::StartIo
                    } else {
                        ControlEvent::Resume
                    });
                }
                FUNCTIONFS_DISABLE | FUNCTIONFS_SUSPEND => {
                    send(if event_type == FUNCTIONFS_DISABLE {
                        ControlEvent::StopIo
                    } else {
                        ControlEvent::Suspend
                    });
                }
                FUNCTIONFS_BIND => send(ControlEvent::BindUsb),
                FUNCTIONFS_UNBIND => send(ControlEvent::UnbindUsb),
                FUNCTIONFS_SETUP => {
                    let request_type = event[0];
                    let request = event[1];
                    match request {
                        REQ_GET_DEVICE_STATUS if request_type == 0xa1 => {
                            let record = status.lock().unwrap().record();
                            let mut remaining: &[u8] = &record;
                            while !remaining.is_empty() {
                                match write_fd(fd, remaining) {
                                    Ok(written) => remaining = &remaining[written..],
                                    Err(_) => break,
                                }
                            }
                        }
                        REQ_CANCEL => {
                            // flag first so an in-flight bulk write can be
                            // abandoned before the queued signal arrives
                            cancel_flag.store(true, Ordering::SeqCst);
                            send(ControlEvent::CancelTransaction);
                        }
                        REQ_DEVICE_RESET => send(ControlEvent::DeviceReset),
                        _ => stall(fd, request_type & USB_DIR_IN != 0),
                    }
                }
                _ => {}
            }
        }
    }
    info!("control reader exited");
}

fn bulk_reader(ctl: IoThreadCtl, fd: i32, events: SyncSender<TransportEvent>) {
    let mut buf = vec![0u8; MAX_DATA_IN_SIZE];
    while !ctl.should_exit() {
        match read_fd(fd, &mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(1)),
            Ok(n) => {
                // a full queue blocks here, which is the reader's
                // backpressure against slow filesystem writes
                if events.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) | Err(Errno::ESHUTDOWN) => {
                thread::sleep(Duration::from_millis(1))
            }
            Err(err) => {
                error!("bulk reader exiting: {}", err);
                break;
            }
        }
    }
    info!("bulk reader exited");
}

struct WriteJob {
    data: Vec<u8>,
    terminate_transfer: bool,
    done: Sender<bool>,
}

fn bulk_writer(ctl: IoThreadCtl, fd: i32, jobs: Receiver<WriteJob>, cancel_flag: Arc<AtomicBool>) {
    // per-write ceiling; halved after EIO down to one packet
    let mut write_max = MAX_DATA_IN_SIZE;

    while !ctl.should_exit() {
        let job = match jobs.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut data: &[u8] = &job.data;
        // a transfer of an exact multiple of the packet size needs a
        // zero-length packet to terminate it
        let mut zero_packet =
            job.terminate_transfer && data.len() % HS_DATA_PKT_SIZE as usize == 0;
        let mut ok = true;

        while (!data.is_empty() || zero_packet) && !ctl.should_exit() {
            if cancel_flag.load(Ordering::SeqCst) {
                ok = false;
                break;
            }
            let now = data.len().min(write_max);
            match write_fd(fd, &data[..now]) {
                Ok(written) => {
                    if data.is_empty() {
                        zero_packet = false;
                    }
                    data = &data[written..];
                }
                Err(Errno::EIO) if write_max > HS_DATA_PKT_SIZE as usize => {
                    write_max >>= 1;
                    warn!("bulk writer limiting writes to {}", write_max);
                }
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => thread::sleep(Duration::from_millis(1)),
                Err(Errno::ESHUTDOWN) => {
                    // the host is gone; it no longer wants this data
                    warn!("bulk writer dropping transfer (endpoint shutdown)");
                    ok = false;
                    break;
                }
                Err(err) => {
                    error!("bulk writer exiting: {}", err);
                    ok = false;
                    break;
                }
            }
        }

        let _ = job.done.send(ok && data.is_empty());
    }
    info!("bulk writer exited");
}

type EventQueue = Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>;

fn interrupt_writer(ctl: IoThreadCtl, fd: i32, queue: EventQueue) {
    let (lock, condvar) = &*queue;
    loop {
        let item = {
            let mut queue = lock.lock().unwrap();
            loop {
                if ctl.should_exit() {
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                let (next, _) = condvar
                    .wait_timeout(queue, Duration::from_millis(100))
                    .unwrap();
                queue = next;
            }
        };

        // interrupt endpoints take a whole packet per transfer or nothing
        let mut done = false;
        while !done && !ctl.should_exit() {
            match write_fd(fd, &item) {
                Ok(written) => {
                    if written != item.len() {
                        error!("partial interrupt write {}/{} bytes", written, item.len());
                    }
                    done = true;
                }
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) | Err(Errno::ESHUTDOWN) => {
                    thread::sleep(Duration::from_millis(1))
                }
                Err(err) => {
                    error!("interrupt writer exiting: {}", err);
                    return;
                }
            }
        }
    }
}

/* =======================================================================
 * FunctionFS transporter
 * ======================================================================= */

/// The USB FunctionFS transport: ep0 control, ep1 bulk-in, ep2 bulk-out,
/// ep3 interrupt-in, each with its own thread.
pub struct FunctionFsTransporter {
    dir: PathBuf,
    events: SyncSender<TransportEvent>,
    status: Arc<Mutex<DeviceStatus>>,
    cancel_flag: Arc<AtomicBool>,

    ep0: Option<File>,
    ep_in: Option<File>,
    ep_out: Option<File>,
    ep_intr: Option<File>,

    control_thread: Option<IoThread>,
    reader_thread: Option<IoThread>,
    writer_thread: Option<IoThread>,
    interrupt_thread: Option<IoThread>,

    write_jobs: Option<Sender<WriteJob>>,
    event_queue: EventQueue,
    event_queue_full: bool,
}

impl FunctionFsTransporter {
    /// `dir` is the mounted FunctionFS instance, e.g. /dev/mtp.
    pub fn new(dir: &Path) -> (FunctionFsTransporter, Receiver<TransportEvent>) {
        let (events, receiver) = mpsc::sync_channel(READER_QUEUE_CHUNKS * 4);
        let transporter = FunctionFsTransporter {
            dir: dir.to_owned(),
            events,
            status: Arc::new(Mutex::new(DeviceStatus::Ok)),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            ep0: None,
            ep_in: None,
            ep_out: None,
            ep_intr: None,
            control_thread: None,
            reader_thread: None,
            writer_thread: None,
            interrupt_thread: None,
            write_jobs: None,
            event_queue: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            event_queue_full: false,
        };
        (transporter, receiver)
    }

    /// Clears a pending cancel; the responder calls this once the cancelled
    /// transaction has been torn down.
    pub fn clear_cancel(&self) {
        self.cancel_flag.store(false, Ordering::SeqCst);
    }

    fn open_endpoints(&mut self) -> std::io::Result<()> {
        self.ep_in = Some(OpenOptions::new().write(true).open(self.dir.join("ep1"))?);
        self.ep_out = Some(
            OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(self.dir.join("ep2"))?,
        );
        self.ep_intr = Some(
            OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(self.dir.join("ep3"))?,
        );
        Ok(())
    }

    fn start_io_threads(&mut self) {
        if let Some(out) = &self.ep_out {
            let fd = out.as_raw_fd();
            let events = self.events.clone();
            self.reader_thread = Some(IoThread::spawn("mtp-bulk-read", move |ctl| {
                bulk_reader(ctl, fd, events)
            }));
        }
        if let Some(ep_in) = &self.ep_in {
            let fd = ep_in.as_raw_fd();
            let (jobs_tx, jobs_rx) = mpsc::channel();
            let cancel = self.cancel_flag.clone();
            self.write_jobs = Some(jobs_tx);
            self.writer_thread = Some(IoThread::spawn("mtp-bulk-write", move |ctl| {
                bulk_writer(ctl, fd, jobs_rx, cancel)
            }));
        }
        if let Some(intr) = &self.ep_intr {
            let fd = intr.as_raw_fd();
            let queue = self.event_queue.clone();
            self.interrupt_thread = Some(IoThread::spawn("mtp-intr-write", move |ctl| {
                interrupt_writer(ctl, fd, queue)
            }));
        }
    }

    fn stop_io_threads(&mut self) {
        self.write_jobs = None;
        if let Some(thread) = self.writer_thread.take() {
            thread.stop();
        }
        if let Some(thread) = self.reader_thread.take() {
            thread.stop();
        }
        if let Some(thread) = self.interrupt_thread.take() {
            thread.stop();
        }
        self.event_queue.0.lock().unwrap().clear();
    }
}

impl Transporter for FunctionFsTransporter {
    fn activate(&mut self) -> bool {
        let ep0 = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.join("ep0"))
        {
            Ok(file) => file,
            Err(err) => {
                error!("could not open control endpoint: {}", err);
                return false;
            }
        };

        let fd = ep0.as_raw_fd();
        for block in [descriptors_block(), strings_block()] {
            if write_fd(fd, &block).is_err() {
                error!("could not write descriptors to control endpoint");
                return false;
            }
        }
        info!("mtp function set up");

        if let Err(err) = self.open_endpoints() {
            error!("could not open endpoint files: {}", err);
            return false;
        }
        self.start_io_threads();

        let events = self.events.clone();
        let status = self.status.clone();
        let cancel = self.cancel_flag.clone();
        self.control_thread = Some(IoThread::spawn("mtp-control", move |ctl| {
            control_reader(ctl, fd, events, status, cancel)
        }));
        self.ep0 = Some(ep0);
        true
    }

    fn deactivate(&mut self) {
        self.stop_io_threads();
        if let Some(thread) = self.control_thread.take() {
            thread.stop();
        }
        self.ep0 = None;
        self.ep_in = None;
        self.ep_out = None;
        self.ep_intr = None;
    }

    fn reset(&mut self) {
        // restart the bulk pipes; the control thread stays up
        self.stop_io_threads();
        self.clear_cancel();
        self.start_io_threads();
        info!("transport reset");
    }

    fn send_data(&mut self, data: &[u8], is_last_packet: bool) -> bool {
        let Some(jobs) = self.write_jobs.as_ref() else {
            warn!("bulk writer not running; dropping {} bytes", data.len());
            return false;
        };
        let (done_tx, done_rx) = mpsc::channel();
        let job = WriteJob {
            data: data.to_vec(),
            terminate_transfer: is_last_packet,
            done: done_tx,
        };
        if jobs.send(job).is_err() {
            return false;
        }
        // Wait for the writer to drain the buffer. A cancel arriving on the
        // control endpoint interrupts the write we are blocked on.
        loop {
            match done_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel_flag.load(Ordering::SeqCst) {
                        if let Some(writer) = &self.writer_thread {
                            writer.interrupt();
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn send_event(&mut self, data: &[u8]) -> bool {
        let (lock, condvar) = &*self.event_queue;
        let mut queue = lock.lock().unwrap();
        if queue.len() >= MAX_EVENTS_STORED {
            if !self.event_queue_full {
                self.event_queue_full = true;
                error!("event queue full - events will be lost");
            }
            while queue.len() >= MAX_EVENTS_STORED {
                queue.pop_front();
            }
        } else if self.event_queue_full {
            self.event_queue_full = false;
            info!("event queue no longer full");
        }
        queue.push_back(data.to_vec());
        condvar.notify_all();
        true
    }

    fn set_device_status(&mut self, status: DeviceStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn cancel_acknowledged(&mut self) {
        self.clear_cancel();
    }
}

impl Drop for FunctionFsTransporter {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/* =======================================================================
 * Dummy transporter (test stub)
 * ======================================================================= */

/// Captures outgoing traffic instead of touching USB. Only test code
/// constructs one.
#[derive(Default)]
pub struct DummyTransporter {
    pub sent_data: Vec<(Vec<u8>, bool)>,
    pub sent_events: Vec<Vec<u8>>,
    pub status: Option<DeviceStatus>,
    pub resets: usize,
}

impl DummyTransporter {
    pub fn new() -> DummyTransporter {
        DummyTransporter::default()
    }
}

impl Transporter for DummyTransporter {
    fn activate(&mut self) -> bool {
        true
    }

    fn deactivate(&mut self) {}

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn send_data(&mut self, data: &[u8], is_last_packet: bool) -> bool {
        self.sent_data.push((data.to_vec(), is_last_packet));
        true
    }

    fn send_event(&mut self, data: &[u8]) -> bool {
        self.sent_events.push(data.to_vec());
        true
    }

    fn set_device_status(&mut self, status: DeviceStatus) {
        self.status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_separates_back_to_back_containers() {
        let mut splitter = ContainerSplitter::default();
        let mut stream = Vec::new();
        stream.extend_from_slice(&16u32.to_le_bytes());
        stream.extend_from_slice(&[1, 0, 0x0C, 0x10, 1, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD]);
        stream.extend_from_slice(&12u32.to_le_bytes());
        stream.extend_from_slice(&[2, 0, 0x0D, 0x10, 1, 0, 0, 0]);

        let pieces = splitter.split(&stream, |_| 0);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].0.len(), 16);
        assert!(pieces[0].1 && pieces[0].2);
        assert_eq!(pieces[1].0.len(), 12);
        assert!(pieces[1].1 && pieces[1].2);
    }

    #[test]
    fn splitter_accumulates_partial_container() {
        let mut splitter = ContainerSplitter::default();
        let mut container = Vec::new();
        container.extend_from_slice(&20u32.to_le_bytes());
        container.extend_from_slice(&[2, 0, 0x0D, 0x10, 1, 0, 0, 0]);

        let pieces = splitter.split(&container, |_| 0);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].1);
        assert!(!pieces[0].2);

        let pieces = splitter.split(&[1, 2, 3, 4, 5, 6, 7, 8], |_| 0);
        assert_eq!(pieces.len(), 1);
        assert!(!pieces[0].1);
        assert!(pieces[0].2);
    }

    #[test]
    fn splitter_uses_object_size_for_huge_containers() {
        let mut splitter = ContainerSplitter::default();
        let mut header = Vec::new();
        header.extend_from_slice(&CONTAINER_LENGTH_HUGE.to_le_bytes());
        header.extend_from_slice(&[2, 0, 0x0D, 0x10, 1, 0, 0, 0]);

        let object_size = 6u64 << 30;
        let pieces = splitter.split(&header, |_| object_size);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].1);
        assert!(!pieces[0].2);
        assert_eq!(splitter.remaining, object_size + 12 - header.len() as u64);
    }

    #[test]
    fn descriptor_block_layout() {
        let block = descriptors_block();
        assert_eq!(&block[..4], &1u32.to_le_bytes());
        assert_eq!(&block[4..8], &(block.len() as u32).to_le_bytes());
        // header + 2 * (9-byte interface + 3 * 7-byte endpoints)
        assert_eq!(block.len(), 16 + 2 * (9 + 3 * 7));
        // interface class triplet: still image / PTP / PTP
        assert_eq!(&block[16 + 5..16 + 8], &[6, 1, 1]);
    }

    #[test]
    fn strings_block_layout() {
        let block = strings_block();
        assert_eq!(&block[..4], &2u32.to_le_bytes());
        assert_eq!(&block[4..8], &(block.len() as u32).to_le_bytes());
        assert_eq!(&block[16..18], &0x0409u16.to_le_bytes());
        assert_eq!(&block[18..22], b"MTP\0");
    }

    #[test]
    fn device_status_records() {
        assert_eq!(DeviceStatus::Ok.record(), [4, 0, 0x01, 0x20]);
        assert_eq!(DeviceStatus::Busy.record(), [4, 0, 0x19, 0x20]);
        assert_eq!(DeviceStatus::TxCancelled.record(), [4, 0, 0x1F, 0x20]);
    }
}
