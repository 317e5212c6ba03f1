use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{info, trace};

/// Upper bound on sources combined into one generation request.
const BATCH_MAX: usize = 128;

/// Grace period before the first flush, so storage enumeration can finish
/// before thumbnailing starts competing for I/O.
const STARTUP_DELAY: Duration = Duration::from_secs(3);

/// Steady-state flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// The external thumbnail generator. Production wires a D-Bus client here;
/// tests install a synchronous stub.
pub trait ThumbnailerService: Send {
    /// Look up an already generated thumbnail for a source file.
    fn cached(&self, uri: &str) -> Option<PathBuf>;

    /// Ask for thumbnails of a batch of sources. Completions surface later
    /// through `poll_ready`.
    fn queue(&mut self, uris: &[String], mime_types: &[String]);

    /// Completed (source path, thumbnail path) pairs since the last poll.
    fn poll_ready(&mut self) -> Vec<(String, PathBuf)>;
}

/// Service stub used when no thumbnailer is available; every request stays
/// unanswered and Rep_Sample_Data remains empty.
#[derive(Default)]
pub struct NullThumbnailerService;

impl ThumbnailerService for NullThumbnailerService {
    fn cached(&self, _uri: &str) -> Option<PathBuf> {
        None
    }

    fn queue(&mut self, _uris: &[String], _mime_types: &[String]) {}

    fn poll_ready(&mut self) -> Vec<(String, PathBuf)> {
        Vec::new()
    }
}

/// Asynchronous request/reply wrapper over the thumbnail service:
/// outstanding requests are de-duplicated, completed ones cache the
/// thumbnail path, and queued sources are flushed in batches.
pub struct Thumbnailer {
    service: Box<dyn ThumbnailerService>,
    queue: Vec<(String, String)>,
    requested: HashSet<String>,
    thumbnail_paths: HashMap<String, PathBuf>,
    enabled: bool,
    suspended: bool,
    next_flush: Option<Instant>,
}

impl Thumbnailer {
    pub fn new(service: Box<dyn ThumbnailerService>) -> Thumbnailer {
        Thumbnailer {
            service,
            queue: Vec::new(),
            requested: HashSet::new(),
            thumbnail_paths: HashMap::new(),
            enabled: false,
            suspended: false,
            next_flush: None,
        }
    }

    /// Returns the thumbnail path if one is already available; otherwise
    /// queues a generation request and returns None. A later `tick` reports
    /// completion.
    pub fn request_thumbnail(&mut self, path: &str, mime_type: &str) -> Option<PathBuf> {
        if let Some(thumb) = self.thumbnail_paths.get(path) {
            return Some(thumb.clone());
        }
        if let Some(thumb) = self.service.cached(path) {
            self.thumbnail_paths.insert(path.to_owned(), thumb.clone());
            return Some(thumb);
        }
        if self.requested.insert(path.to_owned()) {
            trace!("queueing thumbnail request for {}", path);
            self.queue.push((path.to_owned(), mime_type.to_owned()));
            if self.next_flush.is_none() {
                self.next_flush = Some(Instant::now() + self.startup_or_steady_delay());
            }
        }
        None
    }

    /// Set-once master toggle; called when storage enumeration finishes.
    pub fn enable_thumbnailing(&mut self) {
        if !self.enabled {
            self.enabled = true;
            if !self.queue.is_empty() {
                self.next_flush = Some(Instant::now() + STARTUP_DELAY);
            }
            info!("thumbnailing enabled, {} requests queued", self.queue.len());
        }
    }

    pub fn suspend_thumbnailing(&mut self) {
        self.suspended = true;
    }

    pub fn resume_thumbnailing(&mut self) {
        self.suspended = false;
        if !self.queue.is_empty() && self.next_flush.is_none() {
            self.next_flush = Some(Instant::now() + FLUSH_INTERVAL);
        }
    }

    /// When the owning event loop should call `tick` next.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.enabled && !self.suspended {
            self.next_flush
        } else {
            None
        }
    }

    /// Flushes a due batch and collects completions. Returns the source
    /// paths whose thumbnails became available.
    pub fn tick(&mut self, now: Instant) -> Vec<(String, PathBuf)> {
        if self.enabled && !self.suspended {
            if let Some(deadline) = self.next_flush {
                if now >= deadline {
                    self.flush_batch();
                }
            }
        }

        let ready = self.service.poll_ready();
        for (path, thumb) in &ready {
            self.requested.remove(path);
            self.thumbnail_paths.insert(path.clone(), thumb.clone());
        }
        ready
    }

    fn flush_batch(&mut self) {
        let batch: Vec<(String, String)> = self
            .queue
            .drain(..self.queue.len().min(BATCH_MAX))
            .collect();
        if !batch.is_empty() {
            let uris: Vec<String> = batch.iter().map(|(uri, _)| uri.clone()).collect();
            let mimes: Vec<String> = batch.iter().map(|(_, mime)| mime.clone()).collect();
            trace!("flushing {} thumbnail requests", uris.len());
            self.service.queue(&uris, &mimes);
        }
        self.next_flush = if self.queue.is_empty() {
            None
        } else {
            Some(Instant::now() + FLUSH_INTERVAL)
        };
    }

    fn startup_or_steady_delay(&self) -> Duration {
        if self.enabled {
            FLUSH_INTERVAL
        } else {
            STARTUP_DELAY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingService {
        queued: Arc<Mutex<Vec<Vec<String>>>>,
        ready: Vec<(String, PathBuf)>,
    }

    impl ThumbnailerService for RecordingService {
        fn cached(&self, _uri: &str) -> Option<PathBuf> {
            None
        }

        fn queue(&mut self, uris: &[String], _mime_types: &[String]) {
            self.queued.lock().unwrap().push(uris.to_vec());
        }

        fn poll_ready(&mut self) -> Vec<(String, PathBuf)> {
            std::mem::take(&mut self.ready)
        }
    }

    #[test]
    fn duplicate_requests_are_coalesced() {
        let queued = Arc::new(Mutex::new(Vec::new()));
        let service = RecordingService {
            queued: queued.clone(),
            ready: Vec::new(),
        };
        let mut thumbnailer = Thumbnailer::new(Box::new(service));
        thumbnailer.enable_thumbnailing();

        assert!(thumbnailer
            .request_thumbnail("/s/a.jpg", "image/jpeg")
            .is_none());
        assert!(thumbnailer
            .request_thumbnail("/s/a.jpg", "image/jpeg")
            .is_none());

        thumbnailer.tick(Instant::now() + STARTUP_DELAY + FLUSH_INTERVAL);
        let batches = queued.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["/s/a.jpg".to_string()]);
    }

    #[test]
    fn batches_are_capped() {
        let queued = Arc::new(Mutex::new(Vec::new()));
        let service = RecordingService {
            queued: queued.clone(),
            ready: Vec::new(),
        };
        let mut thumbnailer = Thumbnailer::new(Box::new(service));
        thumbnailer.enable_thumbnailing();

        for i in 0..200 {
            thumbnailer.request_thumbnail(&format!("/s/{}.jpg", i), "image/jpeg");
        }
        thumbnailer.tick(Instant::now() + STARTUP_DELAY + FLUSH_INTERVAL);
        assert_eq!(queued.lock().unwrap()[0].len(), BATCH_MAX);
        // the remainder flushes on the next interval
        thumbnailer.tick(Instant::now() + STARTUP_DELAY + FLUSH_INTERVAL * 4);
        assert_eq!(queued.lock().unwrap()[1].len(), 200 - BATCH_MAX);
    }

    #[test]
    fn completion_is_cached() {
        let service = RecordingService {
            queued: Arc::new(Mutex::new(Vec::new())),
            ready: vec![("/s/a.jpg".into(), PathBuf::from("/cache/a.png"))],
        };
        let mut thumbnailer = Thumbnailer::new(Box::new(service));
        thumbnailer.enable_thumbnailing();

        let ready = thumbnailer.tick(Instant::now());
        assert_eq!(ready.len(), 1);
        assert_eq!(
            thumbnailer.request_thumbnail("/s/a.jpg", "image/jpeg"),
            Some(PathBuf::from("/cache/a.png"))
        );
    }
}
