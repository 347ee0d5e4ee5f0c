// Priority-gated thumbnail downloader.
//
// The most important property of this scheduler is that it WILL NOT start a
// task until a priority has been assigned to it. A task enqueued this tick must
// not race ahead of one that was already prioritized for an adjacent region of
// the grid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{EngineConfig, FORCE_RESTART_DELAY_MS};
use crate::source::traits::ImageSource;

/// Plain-data description of one download: the cell index and its fetch URL.
#[derive(Debug, Clone)]
pub struct FetchItem {
    pub index: usize,
    pub url: Option<String>,
}

/// One-way completion reports. Transport and decode failures are collapsed
/// into a single `Failed` outcome; each task reports at most once.
#[derive(Debug)]
pub enum DownloadEvent {
    Started { index: usize },
    Succeeded { index: usize, thumb: Arc<DynamicImage> },
    Failed { index: usize },
    Canceled { index: usize },
}

struct DownloadTask {
    url: Option<String>,
    priority: i64,
    priority_ever_set: bool,
    is_active: bool,
    is_visited: bool,
    invalidated: Arc<AtomicBool>,
}

impl DownloadTask {
    fn new(item: &FetchItem) -> Self {
        Self {
            url: item.url.clone(),
            priority: 0,
            priority_ever_set: false,
            is_active: false,
            is_visited: false,
            invalidated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    fn invalidate(&mut self) {
        self.invalidated.store(true, Ordering::Relaxed);
        self.is_active = false;
    }
}

pub struct Downloader {
    max_concurrent: usize,
    thumb_width: u32,
    thumb_height: u32,
    failure_injection_rate: f64,
    source: Arc<dyn ImageSource>,
    tasks: Mutex<HashMap<usize, DownloadTask>>,
    blocked: AtomicBool,
    paused: AtomicBool,
    events_tx: UnboundedSender<DownloadEvent>,
    shutdown_token: CancellationToken,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn ImageSource>,
        config: &EngineConfig,
    ) -> (Arc<Self>, UnboundedReceiver<DownloadEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let downloader = Arc::new(Self {
            max_concurrent: config.max_concurrent_downloads,
            thumb_width: config.thumb_width,
            thumb_height: config.thumb_height,
            failure_injection_rate: config.failure_injection_rate,
            source,
            tasks: Mutex::new(HashMap::new()),
            blocked: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            events_tx,
            shutdown_token: CancellationToken::new(),
        });
        (downloader, events_rx)
    }

    /// While blocked, nothing may be enqueued or started. Used by refresh.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Relaxed);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    /// While paused, existing tasks stay in the table but none start.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Cancel everything and refuse new work permanently.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.cancel_all();
    }

    /// Creates a task for the item's index if none exists. Does not start it.
    pub fn enqueue(&self, item: &FetchItem) {
        if self.is_blocked() || self.shutdown_token.is_cancelled() {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks
            .entry(item.index)
            .or_insert_with(|| DownloadTask::new(item));
    }

    pub fn enqueue_batch(&self, items: &[FetchItem]) {
        if self.is_blocked() || self.shutdown_token.is_cancelled() {
            return;
        }
        let mut tasks = self.tasks.lock();
        for item in items {
            tasks
                .entry(item.index)
                .or_insert_with(|| DownloadTask::new(item));
        }
    }

    /// Records a priority and marks the task eligible to start.
    pub fn set_priority(&self, index: usize, priority: i64) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get_mut(&index) {
            task.priority = priority;
            task.priority_ever_set = true;
        }
    }

    pub fn set_priority_batch(&self, pairs: &[(usize, i64)]) {
        let mut tasks = self.tasks.lock();
        for &(index, priority) in pairs {
            if let Some(task) = tasks.get_mut(&index) {
                task.priority = priority;
                task.priority_ever_set = true;
            }
        }
    }

    /// Same as `set_priority_batch`, and additionally resets every task not in
    /// `pairs` to the lowest priority, so stale priorities never win a later
    /// selection round.
    pub fn set_priority_batch_and_zero_others(&self, pairs: &[(usize, i64)]) {
        let mut tasks = self.tasks.lock();
        let mut covered = std::collections::HashSet::with_capacity(pairs.len());
        for &(index, priority) in pairs {
            if let Some(task) = tasks.get_mut(&index) {
                task.priority = priority;
                task.priority_ever_set = true;
            }
            covered.insert(index);
        }
        for (index, task) in tasks.iter_mut() {
            if !covered.contains(index) {
                task.priority = 0;
                task.priority_ever_set = true;
            }
        }
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        for (index, task) in tasks.iter_mut() {
            task.invalidate();
            let _ = self.events_tx.send(DownloadEvent::Canceled { index: *index });
        }
        tasks.clear();
    }

    /// Cancels a random subset of tasks. Chaos-testing hook.
    pub fn cancel_all_randomly(&self) {
        let mut tasks = self.tasks.lock();
        let doomed: Vec<usize> = tasks
            .keys()
            .copied()
            .filter(|_| rand::random::<bool>())
            .collect();
        for index in doomed {
            if let Some(mut task) = tasks.remove(&index) {
                task.invalidate();
                let _ = self.events_tx.send(DownloadEvent::Canceled { index });
            }
        }
    }

    /// Cancels every task whose index falls outside `[first, last]`. Called
    /// when the visible window moves, to bound the task table.
    pub fn cancel_outside_range(&self, first: usize, last: usize) {
        let mut tasks = self.tasks.lock();
        let doomed: Vec<usize> = tasks
            .keys()
            .copied()
            .filter(|&index| index < first || index > last)
            .collect();
        for index in doomed {
            if let Some(mut task) = tasks.remove(&index) {
                task.invalidate();
                let _ = self.events_tx.send(DownloadEvent::Canceled { index });
            }
        }
    }

    fn remove(&self, index: usize) {
        let mut tasks = self.tasks.lock();
        if let Some(mut task) = tasks.remove(&index) {
            task.invalidate();
            let _ = self.events_tx.send(DownloadEvent::Canceled { index });
        }
    }

    /// Whether a live (non-invalidated) task exists for the index.
    pub fn is_downloading(&self, index: usize) -> bool {
        let tasks = self.tasks.lock();
        tasks
            .get(&index)
            .map(|task| !task.is_invalidated())
            .unwrap_or(false)
    }

    /// Whether a live task for the index has actually started transferring.
    pub fn is_downloading_actively(&self, index: usize) -> bool {
        let tasks = self.tasks.lock();
        tasks
            .get(&index)
            .map(|task| !task.is_invalidated() && task.is_active)
            .unwrap_or(false)
    }

    /// Snapshot of indices currently in the task table.
    pub fn task_indices(&self) -> Vec<usize> {
        self.tasks.lock().keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        let tasks = self.tasks.lock();
        tasks
            .values()
            .filter(|task| task.is_active && !task.is_invalidated())
            .count()
    }

    /// Purges dead tasks, then fires as many eligible tasks as headroom under
    /// the concurrency ceiling allows, highest priority first. A task whose
    /// priority was never set is not eligible, no matter how much headroom
    /// exists.
    pub fn start_if_needed(self: &Arc<Self>) {
        if self.is_blocked()
            || self.paused.load(Ordering::Relaxed)
            || self.shutdown_token.is_cancelled()
        {
            return;
        }

        let to_fire: Vec<(usize, Option<String>, Arc<AtomicBool>)> = {
            let mut tasks = self.tasks.lock();
            tasks.retain(|_, task| !task.is_invalidated());

            let active = tasks.values().filter(|task| task.is_active).count();
            if active >= self.max_concurrent {
                return;
            }
            let headroom = self.max_concurrent - active;

            for task in tasks.values_mut() {
                task.is_visited = false;
            }

            // Ties break deterministically: lowest index wins the scan order.
            let mut indices: Vec<usize> = tasks.keys().copied().collect();
            indices.sort_unstable();

            let mut chosen = Vec::new();
            for _ in 0..headroom {
                let mut best: Option<usize> = None;
                let mut best_priority = i64::MIN;
                for &index in &indices {
                    let task = &tasks[&index];
                    if task.is_active || task.is_visited || !task.priority_ever_set {
                        continue;
                    }
                    if best.is_none() || task.priority > best_priority {
                        best = Some(index);
                        best_priority = task.priority;
                    }
                }
                let Some(index) = best else {
                    break;
                };
                if let Some(task) = tasks.get_mut(&index) {
                    task.is_visited = true;
                    task.is_active = true;
                    chosen.push((index, task.url.clone(), task.invalidated.clone()));
                }
            }
            chosen
        };

        for &(index, _, _) in &to_fire {
            let _ = self.events_tx.send(DownloadEvent::Started { index });
        }
        for (index, url, invalidated) in to_fire {
            let downloader = Arc::clone(self);
            tokio::spawn(async move {
                downloader.fire(index, url, invalidated).await;
            });
        }
    }

    /// Cancels any existing task for the item and fires a fresh one, skipping
    /// the priority gate. Used for explicit user retry; the fixed delay makes
    /// the restart read as deliberate.
    pub async fn force_restart(self: &Arc<Self>, item: &FetchItem) {
        if self.is_blocked() || self.shutdown_token.is_cancelled() {
            return;
        }

        self.remove(item.index);

        let invalidated = {
            let mut tasks = self.tasks.lock();
            let task = DownloadTask::new(item);
            let invalidated = task.invalidated.clone();
            tasks.insert(item.index, task);
            invalidated
        };

        if self.paused.load(Ordering::Relaxed) {
            return;
        }

        {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.get_mut(&item.index) {
                task.is_active = true;
            }
        }
        let _ = self.events_tx.send(DownloadEvent::Started { index: item.index });

        tokio::time::sleep(Duration::from_millis(FORCE_RESTART_DELAY_MS)).await;

        Arc::clone(self)
            .fire(item.index, item.url.clone(), invalidated)
            .await;
    }

    /// Runs one download to completion. Success is terminal: the task is
    /// invalidated so it can never re-run. A task invalidated while in flight
    /// still finishes its I/O but swallows the outcome.
    async fn fire(self: Arc<Self>, index: usize, url: Option<String>, invalidated: Arc<AtomicBool>) {
        let outcome = self.fetch_and_decode(url).await;

        // Read the flag under the table lock so a cancellation cannot land
        // between the check and the terminal bookkeeping.
        let suppressed = {
            let mut tasks = self.tasks.lock();
            let suppressed = invalidated.load(Ordering::Relaxed);
            if let Some(task) = tasks.get_mut(&index) {
                // A forced restart may have replaced the task; only touch it
                // if this fire still owns it.
                if Arc::ptr_eq(&task.invalidated, &invalidated) {
                    task.is_active = false;
                    task.invalidated.store(true, Ordering::Relaxed);
                }
            }
            suppressed
        };
        if suppressed {
            debug!("download {} invalidated mid-flight, dropping result", index);
            return;
        }

        match outcome {
            Ok(thumb) => {
                let _ = self.events_tx.send(DownloadEvent::Succeeded { index, thumb });
            }
            Err(e) => {
                debug!("download {} failed: {}", index, e);
                let _ = self.events_tx.send(DownloadEvent::Failed { index });
            }
        }
    }

    async fn fetch_and_decode(&self, url: Option<String>) -> Result<Arc<DynamicImage>> {
        let url = url.ok_or_else(|| anyhow!("item has no image url"))?;
        let bytes = self.source.fetch_image(&url).await?;
        let decoded = image::load_from_memory(&bytes).map_err(|e| anyhow!("decode failed: {}", e))?;
        let thumb = decoded.resize_to_fill(self.thumb_width, self.thumb_height, FilterType::Triangle);

        if self.failure_injection_rate > 0.0 && rand::random::<f64>() < self.failure_injection_rate {
            warn!("injecting download failure for {}", url);
            return Err(anyhow!("injected failure"));
        }

        Ok(Arc::new(thumb))
    }
}
