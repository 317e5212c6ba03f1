use std::path::Path;

use log::warn;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};

/// One kernel inotify instance with a fixed event mask, watching one
/// directory per watch descriptor.
pub struct FsNotify {
    inotify: Inotify,
    mask: AddWatchFlags,
}

impl FsNotify {
    pub fn new(mask: AddWatchFlags) -> nix::Result<FsNotify> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        Ok(FsNotify { inotify, mask })
    }

    pub fn add_watch(&self, path: &Path) -> Option<WatchDescriptor> {
        match self.inotify.add_watch(path, self.mask) {
            Ok(wd) => Some(wd),
            Err(err) => {
                warn!("could not watch {}: {}", path.display(), err);
                None
            }
        }
    }

    pub fn remove_watch(&self, wd: WatchDescriptor) {
        // The kernel removes watches on unlinked directories by itself, so a
        // failure here is routine after deletions.
        let _ = self.inotify.rm_watch(wd);
    }

    /// All events queued since the last drain; empty when none are pending.
    pub fn drain(&self) -> Vec<InotifyEvent> {
        match self.inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => Vec::new(),
            Err(err) => {
                warn!("inotify read failed: {}", err);
                Vec::new()
            }
        }
    }
}
