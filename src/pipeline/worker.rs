// src/pipeline/worker.rs
//! Single-threaded thumbnail download worker.
//!
//! Requests are posted from the controlling (UI) thread with [`ThumbnailWorker::enqueue`].
//! The worker thread services one target at a time and sends finished images
//! back over a channel. Nothing reaches the listener until the controlling
//! thread calls [`ThumbnailWorker::poll`], which re-checks that the target
//! still wants that exact URL. Results for slots that were reassigned,
//! cancelled or cleared in the meantime are dropped there.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::cache::ImageCache;
use super::error::{DeliveryOutcome, PipelineError};
use super::fetch::Fetcher;
use super::types::{Command, Completed, SlotId, Thumbnail};

/// Receives validated thumbnails on the polling thread. Must not block.
pub trait ThumbnailListener<T> {
    fn on_thumbnail_ready(&mut self, target: T, image: Arc<Thumbnail>, url: &str);
}

impl<T, F> ThumbnailListener<T> for F
where
    F: FnMut(T, Arc<Thumbnail>, &str),
{
    fn on_thumbnail_ready(&mut self, target: T, image: Arc<Thumbnail>, url: &str) {
        self(target, image, url)
    }
}

/// Scheduling priority of the worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerPriority {
    Normal,
    /// Run with this nice value (Linux). Higher means less favourable.
    Lowered(i32),
}

/// Request bookkeeping shared by the controlling thread and the worker thread.
struct RequestState<T> {
    /// target -> url it currently wants
    pending: HashMap<T, String>,
    /// targets with a `Process` message still waiting in the channel
    queued: HashSet<T>,
    in_flight: Option<(T, String)>,
    /// results sent back but not yet taken off the channel by `poll()`
    undelivered: usize,
    /// bumped by `clear()`; messages from older generations are skipped
    generation: u64,
}

impl<T: Hash + Eq> RequestState<T> {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            queued: HashSet::new(),
            in_flight: None,
            undelivered: 0,
            generation: 0,
        }
    }
}

struct Shared<T> {
    state: Mutex<RequestState<T>>,
    stopped: AtomicBool,
}

/// Visible-slot downloads.
pub type FetchWorker = ThumbnailWorker<SlotId>;
/// Off-screen prefetch by list position.
pub type PreloadWorker = ThumbnailWorker<usize>;

pub struct ThumbnailWorker<T> {
    name: String,
    priority: WorkerPriority,
    shared: Arc<Shared<T>>,
    command_tx: Sender<Command<T>>,
    // taken by `start()`
    command_rx: Option<Receiver<Command<T>>>,
    completed_tx: Option<Sender<Completed<T>>>,
    completed_rx: Receiver<Completed<T>>,
    fetcher: Arc<dyn Fetcher>,
    cache: Option<Arc<ImageCache>>,
    listener: Option<Box<dyn ThumbnailListener<T>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T> ThumbnailWorker<T>
where
    T: Hash + Eq + Clone + Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        let (command_tx, command_rx) = mpsc::channel();
        let (completed_tx, completed_rx) = mpsc::channel();
        Self {
            name: name.into(),
            priority: WorkerPriority::Normal,
            shared: Arc::new(Shared {
                state: Mutex::new(RequestState::new()),
                stopped: AtomicBool::new(false),
            }),
            command_tx,
            command_rx: Some(command_rx),
            completed_tx: Some(completed_tx),
            completed_rx,
            fetcher,
            cache: None,
            listener: None,
            handle: None,
        }
    }

    pub fn with_priority(mut self, priority: WorkerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Delivered images are stored here before the listener runs.
    pub fn with_cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn set_listener(&mut self, listener: impl ThumbnailListener<T> + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the worker thread. Requests enqueued earlier are serviced once it runs.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let (Some(command_rx), Some(completed_tx)) =
            (self.command_rx.take(), self.completed_tx.take())
        else {
            return Err(PipelineError::AlreadyStarted(self.name.clone()));
        };

        let shared = Arc::clone(&self.shared);
        let fetcher = Arc::clone(&self.fetcher);
        let priority = self.priority;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                apply_priority(&name, priority);
                run_loop(&name, &shared, &command_rx, &completed_tx, fetcher.as_ref());
            })
            .map_err(|source| PipelineError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        self.handle = Some(handle);
        info!("{} background thread started", self.name);
        Ok(())
    }

    /// Ask for `url` on behalf of `target`; `None` cancels whatever `target` wanted.
    ///
    /// The latest URL for a target wins. A target already waiting in the queue is
    /// not posted a second time.
    pub fn enqueue(&self, target: T, url: Option<&str>) {
        let url = url.filter(|u| !u.is_empty());
        let mut st = self.shared.state.lock();

        let Some(url) = url else {
            trace!("{}: cancel {target:?}", self.name);
            st.pending.remove(&target);
            return;
        };

        trace!("{}: got url {url} for {target:?}", self.name);
        st.pending.insert(target.clone(), url.to_string());

        if st.queued.contains(&target) {
            return;
        }
        if let Some((t, u)) = &st.in_flight {
            if *t == target && u == url {
                return;
            }
        }

        st.queued.insert(target.clone());
        let generation = st.generation;
        drop(st);

        if self
            .command_tx
            .send(Command::Process { target, generation })
            .is_err()
        {
            debug!("{}: worker gone, request ignored", self.name);
        }
    }

    /// Forget every pending request and skip queued messages that haven't started.
    ///
    /// A fetch already in progress keeps running but its result is discarded on poll.
    pub fn clear(&self) {
        let mut st = self.shared.state.lock();
        st.pending.clear();
        st.queued.clear();
        st.generation += 1;
        debug!("{}: queue cleared (generation {})", self.name, st.generation);
    }

    /// No further listener calls happen after this returns.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.command_tx.send(Command::Quit);
        info!("{} background thread stopping", self.name);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stop and wait for the thread to finish its current fetch.
    pub fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} background thread panicked", self.name);
            }
        }
    }

    pub fn pending_url(&self, target: &T) -> Option<String> {
        self.shared.state.lock().pending.get(target).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Nothing queued, nothing downloading and nothing waiting for `poll()`.
    ///
    /// Targets whose fetch failed stay pending, so this is the settle condition
    /// rather than an empty pending map.
    pub fn is_idle(&self) -> bool {
        let st = self.shared.state.lock();
        st.queued.is_empty() && st.in_flight.is_none() && st.undelivered == 0
    }

    /// Drain up to `max` finished fetches and deliver the ones still wanted.
    ///
    /// Must be called from the thread that owns the UI state the listener touches.
    /// Returns the number of listener invocations.
    pub fn poll(&mut self, max: usize) -> usize {
        let mut drained = 0usize;
        let mut delivered = 0usize;
        while drained < max {
            match self.completed_rx.try_recv() {
                Ok(done) => {
                    drained += 1;
                    {
                        let mut st = self.shared.state.lock();
                        st.undelivered = st.undelivered.saturating_sub(1);
                    }
                    if self.deliver(done) == DeliveryOutcome::Delivered {
                        delivered += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        delivered
    }

    fn deliver(&mut self, done: Completed<T>) -> DeliveryOutcome {
        let Completed { target, url, image } = done;

        if self.is_stopped() {
            trace!("{}: dropping {url}, worker stopped", self.name);
            return DeliveryOutcome::Stopped;
        }

        {
            let mut st = self.shared.state.lock();
            if st.pending.get(&target) != Some(&url) {
                debug!("{}: superseded {url} for {target:?}", self.name);
                return DeliveryOutcome::Superseded;
            }
            st.pending.remove(&target);
        }

        if let Some(cache) = &self.cache {
            cache.put(&url, Arc::clone(&image));
        }
        if let Some(listener) = self.listener.as_mut() {
            listener.on_thumbnail_ready(target, image, &url);
        }
        DeliveryOutcome::Delivered
    }
}

impl<T> Drop for ThumbnailWorker<T> {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Quit);
    }
}

fn run_loop<T>(
    name: &str,
    shared: &Shared<T>,
    command_rx: &Receiver<Command<T>>,
    completed_tx: &Sender<Completed<T>>,
    fetcher: &dyn Fetcher,
) where
    T: Hash + Eq + Clone + Debug,
{
    while let Ok(cmd) = command_rx.recv() {
        let (target, generation) = match cmd {
            Command::Process { target, generation } => (target, generation),
            Command::Quit => break,
        };
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let url = {
            let mut st = shared.state.lock();
            if st.generation != generation {
                continue;
            }
            st.queued.remove(&target);
            let Some(url) = st.pending.get(&target).cloned() else {
                continue;
            };
            st.in_flight = Some((target.clone(), url.clone()));
            url
        };

        trace!("{name}: fetching {url} for {target:?}");
        let result = fetcher.fetch(&url);
        {
            let mut st = shared.state.lock();
            st.in_flight = None;
            if result.is_ok() {
                st.undelivered += 1;
            }
        }

        match result {
            Ok(thumb) => {
                let done = Completed {
                    target,
                    url,
                    image: Arc::new(thumb),
                };
                if completed_tx.send(done).is_err() {
                    break;
                }
            }
            Err(e) => warn!("{name}: error downloading image for {target:?}: {e}"),
        }
    }
    debug!("{name}: loop exited");
}

#[cfg(target_os = "linux")]
fn apply_priority(name: &str, priority: WorkerPriority) {
    let WorkerPriority::Lowered(nice) = priority else {
        return;
    };
    // PRIO_PROCESS with who=0 targets the calling thread on Linux
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        warn!(
            "{name}: setpriority({nice}) failed: {}",
            std::io::Error::last_os_error()
        );
    } else {
        debug!("{name}: running at nice {nice}");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(name: &str, priority: WorkerPriority) {
    if let WorkerPriority::Lowered(nice) = priority {
        debug!("{name}: thread priority {nice} not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::FetchError;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    /// In-memory fetcher: per-URL delay, unknown URLs fail like a 404.
    #[derive(Default)]
    struct StubFetcher {
        delays: Map<String, Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn with_delay(mut self, url: &str, delay: Duration) -> Self {
            self.delays.insert(url.to_string(), delay);
            self
        }
    }

    impl Fetcher for StubFetcher {
        fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.lock().push(url.to_string());
            if url.contains("missing") {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            if let Some(d) = self.delays.get(url) {
                thread::sleep(*d);
            }
            Ok(url.as_bytes().to_vec())
        }

        fn decode(&self, bytes: &[u8]) -> Result<Thumbnail, FetchError> {
            Ok(Thumbnail::from_rgba(1, 1, bytes.to_vec()))
        }
    }

    type Log<T> = Rc<RefCell<Vec<(T, String)>>>;

    fn worker_with_log<T>(fetcher: Arc<StubFetcher>) -> (ThumbnailWorker<T>, Log<T>)
    where
        T: Hash + Eq + Clone + Debug + Send + 'static,
    {
        let log: Log<T> = Rc::new(RefCell::new(Vec::new()));
        let mut worker = ThumbnailWorker::new("test-worker", fetcher);
        let sink = Rc::clone(&log);
        worker.set_listener(move |target: T, _img: Arc<Thumbnail>, url: &str| {
            sink.borrow_mut().push((target, url.to_string()));
        });
        (worker, log)
    }

    /// Poll until `done` holds or the deadline passes.
    fn pump<T>(worker: &mut ThumbnailWorker<T>, timeout: Duration, done: impl Fn() -> bool)
    where
        T: Hash + Eq + Clone + Debug + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        while !done() && Instant::now() < deadline {
            worker.poll(16);
            thread::sleep(Duration::from_millis(5));
        }
        worker.poll(16);
    }

    #[test]
    fn delivers_and_clears_pending() {
        let fetcher = Arc::new(StubFetcher::default());
        let (mut worker, log) = worker_with_log::<SlotId>(fetcher);
        worker.start().unwrap();

        worker.enqueue(SlotId(1), Some("http://img/1.jpg"));
        pump(&mut worker, Duration::from_secs(2), || !log.borrow().is_empty());

        assert_eq!(
            log.borrow().as_slice(),
            &[(SlotId(1), "http://img/1.jpg".to_string())]
        );
        assert_eq!(worker.pending_len(), 0);
    }

    #[test]
    fn latest_url_wins_for_same_target() {
        let fetcher = Arc::new(StubFetcher::default());
        let (mut worker, log) = worker_with_log::<SlotId>(Arc::clone(&fetcher));

        // queued before the thread runs: only one message, carrying the last url
        worker.enqueue(SlotId(7), Some("http://img/a.jpg"));
        worker.enqueue(SlotId(7), Some("http://img/b.jpg"));
        worker.enqueue(SlotId(7), Some("http://img/c.jpg"));
        worker.start().unwrap();

        pump(&mut worker, Duration::from_secs(2), || !log.borrow().is_empty());
        thread::sleep(Duration::from_millis(50));
        worker.poll(16);

        assert_eq!(
            log.borrow().as_slice(),
            &[(SlotId(7), "http://img/c.jpg".to_string())]
        );
        assert_eq!(fetcher.calls.lock().as_slice(), &["http://img/c.jpg".to_string()]);
    }

    #[test]
    fn reassigned_slot_never_gets_stale_image() {
        let fetcher = Arc::new(
            StubFetcher::default().with_delay("http://img/old.jpg", Duration::from_millis(150)),
        );
        let (mut worker, log) = worker_with_log::<SlotId>(fetcher);
        worker.start().unwrap();

        worker.enqueue(SlotId(3), Some("http://img/old.jpg"));
        // let the worker dequeue it, then reassign the slot mid-flight
        thread::sleep(Duration::from_millis(40));
        worker.enqueue(SlotId(3), Some("http://img/new.jpg"));

        pump(&mut worker, Duration::from_secs(2), || !log.borrow().is_empty());
        thread::sleep(Duration::from_millis(50));
        worker.poll(16);

        assert_eq!(
            log.borrow().as_slice(),
            &[(SlotId(3), "http://img/new.jpg".to_string())]
        );
    }

    #[test]
    fn clear_suppresses_in_flight_delivery() {
        let fetcher = Arc::new(
            StubFetcher::default().with_delay("http://img/slow.jpg", Duration::from_millis(100)),
        );
        let (mut worker, log) = worker_with_log::<SlotId>(Arc::clone(&fetcher));
        worker.start().unwrap();

        worker.enqueue(SlotId(1), Some("http://img/slow.jpg"));
        thread::sleep(Duration::from_millis(30));
        worker.clear();

        thread::sleep(Duration::from_millis(200));
        worker.poll(16);
        assert!(log.borrow().is_empty());
        assert!(fetcher.calls.lock().len() <= 1);
    }

    #[test]
    fn clear_skips_queued_messages() {
        let fetcher = Arc::new(
            StubFetcher::default().with_delay("http://img/first.jpg", Duration::from_millis(100)),
        );
        let (mut worker, log) = worker_with_log::<usize>(Arc::clone(&fetcher));
        worker.start().unwrap();

        worker.enqueue(0, Some("http://img/first.jpg"));
        thread::sleep(Duration::from_millis(20));
        for pos in 1..5 {
            worker.enqueue(pos, Some(&format!("http://img/{pos}.jpg")));
        }
        worker.clear();
        worker.enqueue(9, Some("http://img/9.jpg"));

        pump(&mut worker, Duration::from_secs(2), || !log.borrow().is_empty());
        thread::sleep(Duration::from_millis(50));
        worker.poll(16);

        assert_eq!(log.borrow().as_slice(), &[(9, "http://img/9.jpg".to_string())]);
        // positions 1..5 were queued behind `first` and never fetched
        let calls = fetcher.calls.lock();
        assert!(calls.len() <= 2);
        assert_eq!(calls.last().map(String::as_str), Some("http://img/9.jpg"));
    }

    #[test]
    fn cancel_with_none_drops_request() {
        let fetcher = Arc::new(StubFetcher::default());
        let (mut worker, log) = worker_with_log::<SlotId>(Arc::clone(&fetcher));
        worker.enqueue(SlotId(2), Some("http://img/2.jpg"));
        worker.enqueue(SlotId(2), None);
        assert_eq!(worker.pending_url(&SlotId(2)), None);

        worker.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.poll(16);
        assert!(log.borrow().is_empty());
        assert!(fetcher.calls.lock().is_empty());
    }

    #[test]
    fn out_of_order_completion_keeps_pairing() {
        let fetcher = Arc::new(
            StubFetcher::default()
                .with_delay("http://img/a.jpg", Duration::from_millis(120))
                .with_delay("http://img/b.jpg", Duration::from_millis(10)),
        );
        // separate workers so A and B are truly concurrent
        let (mut slow, log) = worker_with_log::<SlotId>(Arc::clone(&fetcher));
        let mut fast = ThumbnailWorker::<SlotId>::new("fast", Arc::clone(&fetcher) as Arc<dyn Fetcher>);
        let sink = Rc::clone(&log);
        fast.set_listener(move |t: SlotId, _img: Arc<Thumbnail>, url: &str| {
            sink.borrow_mut().push((t, url.to_string()));
        });
        slow.start().unwrap();
        fast.start().unwrap();

        slow.enqueue(SlotId(1), Some("http://img/a.jpg"));
        fast.enqueue(SlotId(2), Some("http://img/b.jpg"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while log.borrow().len() < 2 && Instant::now() < deadline {
            slow.poll(16);
            fast.poll(16);
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            log.borrow().as_slice(),
            &[
                (SlotId(2), "http://img/b.jpg".to_string()),
                (SlotId(1), "http://img/a.jpg".to_string()),
            ]
        );
    }

    #[test]
    fn failures_do_not_stop_the_loop() {
        let fetcher = Arc::new(StubFetcher::default());
        let (mut worker, log) = worker_with_log::<usize>(fetcher);
        worker.start().unwrap();

        worker.enqueue(0, Some("http://img/missing.jpg"));
        worker.enqueue(1, Some("http://img/ok.jpg"));
        pump(&mut worker, Duration::from_secs(2), || !log.borrow().is_empty());

        assert_eq!(log.borrow().as_slice(), &[(1, "http://img/ok.jpg".to_string())]);
        // the failed target stays pending; nothing retries it
        assert_eq!(worker.pending_url(&0).as_deref(), Some("http://img/missing.jpg"));
    }

    #[test]
    fn failed_fetch_still_goes_idle() {
        let fetcher = Arc::new(StubFetcher::default());
        let (mut worker, log) = worker_with_log::<SlotId>(fetcher);
        assert!(worker.is_idle());

        worker.enqueue(SlotId(0), Some("http://img/missing.jpg"));
        assert!(!worker.is_idle());
        worker.start().unwrap();

        let deadline = Instant::now() + Duration::from_millis(500);
        while !worker.is_idle() && Instant::now() < deadline {
            worker.poll(16);
            thread::sleep(Duration::from_millis(5));
        }

        assert!(worker.is_idle());
        assert!(log.borrow().is_empty());
        assert_eq!(worker.pending_len(), 1);
    }

    #[test]
    fn idle_waits_for_poll_to_drain_results() {
        let fetcher = Arc::new(StubFetcher::default());
        let (mut worker, log) = worker_with_log::<usize>(fetcher);
        worker.start().unwrap();

        worker.enqueue(1, Some("http://img/1.jpg"));
        thread::sleep(Duration::from_millis(50));
        // fetched but not yet polled
        assert!(!worker.is_idle());

        worker.poll(16);
        assert!(worker.is_idle());
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn stop_suppresses_delivery() {
        let fetcher = Arc::new(
            StubFetcher::default().with_delay("http://img/s.jpg", Duration::from_millis(60)),
        );
        let (mut worker, log) = worker_with_log::<SlotId>(fetcher);
        worker.start().unwrap();
        worker.enqueue(SlotId(1), Some("http://img/s.jpg"));
        thread::sleep(Duration::from_millis(20));
        worker.stop();
        assert!(worker.is_stopped());

        thread::sleep(Duration::from_millis(100));
        worker.poll(16);
        assert!(log.borrow().is_empty());
        worker.join();
    }

    #[test]
    fn delivered_images_land_in_cache() {
        let fetcher = Arc::new(StubFetcher::default());
        let cache = Arc::new(ImageCache::with_capacity_bytes(64 * 1024));
        let (worker, log) = worker_with_log::<usize>(fetcher);
        let mut worker = worker.with_cache(Arc::clone(&cache));
        worker.start().unwrap();

        worker.enqueue(4, Some("http://img/4.jpg"));
        pump(&mut worker, Duration::from_secs(2), || !log.borrow().is_empty());
        assert!(cache.contains("http://img/4.jpg"));
    }

    #[cfg(target_os = "linux")]
    fn current_nice() -> i32 {
        unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lowered_priority_applies_to_calling_thread_only() {
        let base = current_nice();
        let target = (base + 5).min(19);
        let seen = thread::spawn(move || {
            apply_priority("nice-test", WorkerPriority::Lowered(target));
            current_nice()
        })
        .join()
        .unwrap();
        assert_eq!(seen, target);
        assert_eq!(current_nice(), base);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn normal_priority_leaves_nice_alone() {
        let base = current_nice();
        let seen = thread::spawn(|| {
            apply_priority("nice-test", WorkerPriority::Normal);
            current_nice()
        })
        .join()
        .unwrap();
        assert_eq!(seen, base);
    }

    #[test]
    fn start_twice_is_an_error() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(StubFetcher::default());
        let mut worker = PreloadWorker::new("twice", fetcher);
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(PipelineError::AlreadyStarted(_))));
    }
}
