// Heartbeat reconciliation between the result table, the disk cache, and the
// downloader.
//
// The three data sources live behind independent locks and cannot be made to
// agree atomically. Rather than chasing consistency to convergence inline,
// each tick performs one bounded sweep per source and moves on; anything that
// falls out of sync during the gaps is fixed on the next tick. In practice a
// wrong state survives at most one heartbeat.
//
// Assigning work to the downloader and prioritizing it is managed entirely by
// the tick. No other code path adds anything to the downloader.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{ImageCache, KeyIndex};
use super::downloader::{DownloadEvent, Downloader, FetchItem};
use super::state::{CellModel, CellState, CellStateKind};
use crate::config::{
    EngineConfig, BATCH_CHUNK_MAX, BATCH_CHUNK_MIN, FETCH_REPEAT_WINDOW_SECS, FETCH_THROTTLE_SECS,
    REFRESH_SETTLE_MS, REFRESH_SPIN_BUDGET,
};
use crate::layout::LayoutProvider;
use crate::source::traits::{ContentRecord, ContentSource, OfflineStore};

/// Emitted once per cell whose presentation state actually changed.
#[derive(Debug, Clone, Copy)]
pub struct CellUpdate {
    pub index: usize,
}

struct RecentFetch {
    at: Instant,
    page: usize,
}

#[derive(Default)]
struct GridState {
    /// Records by index. Holes are indices not yet fetched from upstream.
    records: Vec<Option<Arc<ContentRecord>>>,
    /// Tracked cell models covering the visible range.
    cells: Vec<CellModel>,
    /// The source of truth for "we already have this rendered".
    results: HashMap<String, Arc<DynamicImage>>,
    /// Permanent-until-retry failures, keyed by index: failure is about the
    /// fetch attempt for a slot, not the content.
    failed: HashSet<usize>,
    /// Indices already probed against the disk cache this generation.
    cache_checked: HashSet<usize>,
    page_size: usize,
    total_items: usize,
    total_pages: usize,
    highest_page_fetched: usize,
    cell_count: usize,
    recent_fetches: Vec<RecentFetch>,
}

impl GridState {
    fn record(&self, index: usize) -> Option<&Arc<ContentRecord>> {
        self.records.get(index).and_then(|slot| slot.as_ref())
    }

    fn key_for(&self, index: usize) -> Option<String> {
        self.record(index)
            .and_then(|record| record.content_key().map(str::to_string))
    }
}

/// The only writer of presentation state, the result table, and the failure
/// set. Owns the downloader and the cache; talks to both with plain data.
pub struct GridCoordinator {
    config: EngineConfig,
    downloader: Arc<Downloader>,
    cache: Arc<ImageCache>,
    content: Arc<dyn ContentSource>,
    store: Arc<dyn OfflineStore>,
    layout: Arc<dyn LayoutProvider>,
    state: Mutex<GridState>,
    events_rx: Mutex<UnboundedReceiver<DownloadEvent>>,
    updates_tx: UnboundedSender<CellUpdate>,
    is_refreshing: AtomicBool,
    is_fetching: AtomicBool,
    is_on_tick: AtomicBool,
    is_fetching_details: AtomicBool,
    is_reachable: AtomicBool,
    network_error: AtomicBool,
    any_item_present: AtomicBool,
    shutdown_token: CancellationToken,
}

impl GridCoordinator {
    pub fn new(
        config: EngineConfig,
        content: Arc<dyn ContentSource>,
        store: Arc<dyn OfflineStore>,
        layout: Arc<dyn LayoutProvider>,
        images: Arc<dyn crate::source::traits::ImageSource>,
    ) -> (Arc<Self>, UnboundedReceiver<CellUpdate>) {
        let (downloader, events_rx) = Downloader::new(images, &config);
        // Nothing downloads until boot has loaded the persisted cache index.
        downloader.set_blocked(true);

        let cache = Arc::new(ImageCache::new(
            &config.cache_name,
            Path::new(&config.cache_dir),
            config.cache_capacity,
        ));
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(Self {
            config,
            downloader,
            cache,
            content,
            store,
            layout,
            state: Mutex::new(GridState::default()),
            events_rx: Mutex::new(events_rx),
            updates_tx,
            is_refreshing: AtomicBool::new(false),
            is_fetching: AtomicBool::new(false),
            is_on_tick: AtomicBool::new(false),
            is_fetching_details: AtomicBool::new(false),
            is_reachable: AtomicBool::new(true),
            network_error: AtomicBool::new(false),
            any_item_present: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        });
        (coordinator, updates_rx)
    }

    /// Loads persisted state, unblocks the downloader, fetches the first page.
    pub async fn boot(self: &Arc<Self>) {
        self.cache.load().await;
        self.downloader.set_blocked(false);
        self.fetch_page(1).await;
    }

    /// Runs the heartbeat until shutdown. Ticks are skipped entirely while a
    /// refresh is in progress.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.shutdown_token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(coordinator.config.heartbeat_ms)) => {}
                }
                coordinator.tick().await;
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.downloader.shutdown();
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing.load(Ordering::SeqCst)
    }

    pub fn is_network_error_present(&self) -> bool {
        self.network_error.load(Ordering::Relaxed)
    }

    pub fn any_item_present(&self) -> bool {
        self.any_item_present.load(Ordering::Relaxed)
    }

    /// Reachability signal from the embedder; consumed as a boolean only.
    pub fn set_reachable(&self, reachable: bool) {
        self.is_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn cell_count(&self) -> usize {
        self.state.lock().cell_count
    }

    pub fn cell_state_kind(&self, index: usize) -> Option<CellStateKind> {
        let st = self.state.lock();
        st.cells
            .iter()
            .find(|cell| cell.index == index)
            .map(|cell| cell.state.kind())
    }

    /// Seeds the result table directly. Debug hook for fault-tolerance tests.
    pub fn inject_result(&self, key: &str, thumb: Arc<DynamicImage>) {
        self.state.lock().results.insert(key.to_string(), thumb);
    }

    /// Memory-pressure hook: drops everything rebuildable. The next ticks
    /// repair cell states from disk and network.
    pub fn clear_memory_caches(&self) {
        let mut st = self.state.lock();
        st.results.clear();
        st.failed.clear();
        st.cache_checked.clear();
    }

    /// One heartbeat pass.
    pub async fn tick(self: &Arc<Self>) {
        self.is_on_tick.store(true, Ordering::SeqCst);
        if self.is_refreshing.load(Ordering::SeqCst) {
            self.is_on_tick.store(false, Ordering::SeqCst);
            return;
        }
        self.tick_inner().await;
        self.is_on_tick.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(self: &Arc<Self>) {
        self.drain_download_events();

        let batch_size = self.batch_chunk_size();
        let batch_sleep = Duration::from_millis(self.config.batch_sleep_ms);

        // The failure set and the downloader can disagree when a failure lands
        // between sweeps. A live download wins; the failure entry is dropped.
        {
            let mut st = self.state.lock();
            let indices: Vec<usize> = st.cells.iter().map(|cell| cell.index).collect();
            for index in indices {
                if st.failed.contains(&index) && self.downloader.is_downloading(index) {
                    warn!("downloader and failure set out of sync @ {}", index);
                    st.failed.remove(&index);
                }
            }
        }

        // Sweep A: cheap recovery from the result table and failure set.
        self.sweep_results(batch_size, batch_sleep).await;
        if self.shutdown_token.is_cancelled() {
            return;
        }

        // Sweep B: probe the disk cache for keys not yet checked this
        // generation.
        self.sweep_cache(batch_size, batch_sleep).await;
        if self.shutdown_token.is_cancelled() {
            return;
        }

        // The cache probe awaited; state may have moved. One-shot re-check.
        self.recover_one_shot();

        // Assignment and hand-off. Priorities are pushed before the start
        // step: a task only ever starts with its priority already set.
        let items = self.collect_download_candidates();
        if !items.is_empty() {
            self.downloader.enqueue_batch(&items);
        }
        self.compute_priorities();
        if self.shutdown_token.is_cancelled() {
            return;
        }
        self.downloader.start_if_needed();

        self.sweep_exhaustive(batch_size, batch_sleep).await;
        if self.shutdown_token.is_cancelled() {
            return;
        }

        self.fetch_more_pages_if_necessary().await;
    }

    /// One grid row per batch, clamped so unusual layouts still pace well.
    fn batch_chunk_size(&self) -> usize {
        self.layout
            .number_of_cols()
            .clamp(BATCH_CHUNK_MIN, BATCH_CHUNK_MAX)
    }

    /// Applies completion reports. This is the single point where download
    /// outcomes enter the result table and the failure set.
    fn drain_download_events(self: &Arc<Self>) {
        let events: Vec<DownloadEvent> = {
            let mut rx = self.events_rx.lock();
            let mut list = Vec::new();
            while let Ok(event) = rx.try_recv() {
                list.push(event);
            }
            list
        };

        for event in events {
            match event {
                DownloadEvent::Started { .. } => {}
                DownloadEvent::Succeeded { index, thumb } => {
                    let key = {
                        let mut st = self.state.lock();
                        st.failed.remove(&index);
                        let key = st.key_for(index);
                        if let Some(key) = &key {
                            st.results.insert(key.clone(), thumb.clone());
                        }
                        key
                    };
                    if let Some(key) = key {
                        let cache = Arc::clone(&self.cache);
                        tokio::spawn(async move {
                            cache.put(&thumb, &key).await;
                        });
                    }
                }
                DownloadEvent::Failed { index } => {
                    debug!("thumbnail download failed @ {}", index);
                    self.state.lock().failed.insert(index);
                }
                DownloadEvent::Canceled { index } => {
                    debug!("thumbnail download canceled @ {}", index);
                }
            }
        }
    }

    async fn sweep_results(&self, batch_size: usize, batch_sleep: Duration) {
        let mut cursor = 0;
        loop {
            if self.shutdown_token.is_cancelled() {
                return;
            }
            let mut updates = 0;
            let done;
            {
                let mut st = self.state.lock();
                while cursor < st.cells.len() && updates < batch_size {
                    let pos = cursor;
                    cursor += 1;
                    if st.cells[pos].state.kind() == CellStateKind::Success {
                        continue;
                    }
                    let index = st.cells[pos].index;
                    let Some(key) = st.key_for(index) else {
                        continue;
                    };
                    if let Some(thumb) = st.results.get(&key).cloned() {
                        if self.apply_state(&mut st, pos, CellState::Success { key, thumb }, false) {
                            updates += 1;
                        }
                    } else if st.failed.contains(&index)
                        && self.apply_state(&mut st, pos, CellState::Failed { key }, false)
                    {
                        updates += 1;
                    }
                }
                done = cursor >= st.cells.len();
            }
            if updates > 0 {
                tokio::time::sleep(batch_sleep).await;
            }
            if done {
                break;
            }
        }
    }

    async fn sweep_cache(&self, batch_size: usize, batch_sleep: Duration) {
        // Each index is probed once per generation; the set clears on refresh.
        let to_check: Vec<KeyIndex> = {
            let mut st = self.state.lock();
            let mut list = Vec::new();
            for pos in 0..st.cells.len() {
                let index = st.cells[pos].index;
                if st.cache_checked.contains(&index) {
                    continue;
                }
                if let Some(key) = st.key_for(index) {
                    st.cache_checked.insert(index);
                    list.push(KeyIndex { key, index });
                }
            }
            list
        };
        if to_check.is_empty() {
            return;
        }

        let hits = self.cache.get_batch(&to_check).await;
        if hits.is_empty() {
            return;
        }
        let hits: HashMap<usize, Arc<DynamicImage>> = hits
            .into_iter()
            .map(|(index, thumb)| (index, Arc::new(thumb)))
            .collect();

        // Inject the hits in paced batches. This loop keeps going even under
        // shutdown: the attempted cache hits must finish syncing into the
        // result table or they would be lost for the generation.
        let mut cursor = 0;
        loop {
            let mut updates = 0;
            let done;
            {
                let mut st = self.state.lock();
                while cursor < st.cells.len() && updates < batch_size {
                    let pos = cursor;
                    cursor += 1;
                    let index = st.cells[pos].index;
                    let Some(thumb) = hits.get(&index).cloned() else {
                        continue;
                    };
                    let Some(key) = st.key_for(index) else {
                        continue;
                    };
                    st.results.insert(key.clone(), thumb.clone());
                    if self.apply_state(&mut st, pos, CellState::Success { key, thumb }, false) {
                        updates += 1;
                    }
                }
                done = cursor >= st.cells.len();
            }
            if updates > 0 {
                tokio::time::sleep(batch_sleep).await;
            }
            if done {
                break;
            }
        }
    }

    /// No-await pass over the tracked cells handling the result-table and
    /// failure states only. Cheap enough to run between the async sweeps.
    fn recover_one_shot(&self) {
        let mut st = self.state.lock();
        for pos in 0..st.cells.len() {
            let index = st.cells[pos].index;
            let Some(key) = st.key_for(index) else {
                continue;
            };
            if let Some(thumb) = st.results.get(&key).cloned() {
                if st.cells[pos].state.kind() != CellStateKind::Success {
                    self.apply_state(&mut st, pos, CellState::Success { key, thumb }, false);
                }
            } else if st.failed.contains(&index)
                && st.cells[pos].state.kind() != CellStateKind::Failed
            {
                self.apply_state(&mut st, pos, CellState::Failed { key }, false);
            }
        }
    }

    /// Everything in the download window that lacks a result, is not failed,
    /// and is not already with the downloader.
    fn collect_download_candidates(&self) -> Vec<FetchItem> {
        let (first, last) = {
            let st = self.state.lock();
            if st.cell_count == 0 {
                return Vec::new();
            }
            let first = self
                .layout
                .first_visible_index()
                .saturating_sub(self.config.lookahead);
            let last = (self.layout.last_visible_index() + self.config.lookahead)
                .min(st.cell_count - 1);
            if first > last {
                return Vec::new();
            }
            (first, last)
        };

        let mut raw: Vec<usize> = Vec::new();
        {
            let st = self.state.lock();
            for index in first..=last {
                if st.failed.contains(&index) {
                    continue;
                }
                let Some(key) = st.key_for(index) else {
                    continue;
                };
                if st.results.contains_key(&key) {
                    continue;
                }
                raw.push(index);
            }
        }
        // The downloader lives behind its own lock; query it outside ours.
        raw.retain(|&index| !self.downloader.is_downloading(index));

        // Rule the list out once more: a result or failure may have landed
        // while we crossed the boundary. Mismatches get their one transition
        // here instead of a pointless download.
        let mut items = Vec::new();
        {
            let mut st = self.state.lock();
            for index in raw {
                let Some(key) = st.key_for(index) else {
                    continue;
                };
                if let Some(thumb) = st.results.get(&key).cloned() {
                    if let Some(pos) = st.cells.iter().position(|cell| cell.index == index) {
                        self.apply_state(&mut st, pos, CellState::Success { key, thumb }, false);
                    }
                    continue;
                }
                if st.failed.contains(&index) {
                    if let Some(pos) = st.cells.iter().position(|cell| cell.index == index) {
                        self.apply_state(&mut st, pos, CellState::Failed { key }, false);
                    }
                    continue;
                }
                let url = st
                    .record(index)
                    .and_then(|record| record.image_url(&self.config.image_url_base));
                items.push(FetchItem { index, url });
            }
        }
        items
    }

    /// Scores every task the downloader currently knows and pushes the batch,
    /// zeroing whatever the pass did not cover.
    fn compute_priorities(&self) {
        let container_top = self.layout.container_top();
        let container_bottom = self.layout.container_bottom();
        if container_bottom <= container_top {
            return;
        }

        let task_indices = self.downloader.task_indices();
        let pairs: Vec<(usize, i64)> = {
            let st = self.state.lock();
            task_indices
                .into_iter()
                .filter(|&index| st.record(index).is_some())
                .map(|index| {
                    let cell_top = self.layout.cell_top(index);
                    let cell_bottom = self.layout.cell_bottom(index);
                    let overlaps = cell_top <= container_bottom && cell_bottom >= container_top;
                    let priority = if overlaps {
                        priority_score(
                            self.layout.cell_left(index),
                            (cell_top - container_top).max(0),
                        )
                    } else {
                        0
                    };
                    (index, priority)
                })
                .collect()
        };
        self.downloader.set_priority_batch_and_zero_others(&pairs);
    }

    /// Re-derives the correct state for every tracked cell with fixed
    /// precedence, in paced batches.
    async fn sweep_exhaustive(&self, batch_size: usize, batch_sleep: Duration) {
        let mut cursor = 0;
        loop {
            if self.shutdown_token.is_cancelled() {
                return;
            }
            let mut updates = 0;
            let done;
            {
                let mut st = self.state.lock();
                while cursor < st.cells.len() && updates < batch_size {
                    let pos = cursor;
                    cursor += 1;
                    if self.reconcile_cell(&mut st, pos) {
                        updates += 1;
                    }
                }
                done = cursor >= st.cells.len();
            }
            if updates > 0 {
                tokio::time::sleep(batch_sleep).await;
            }
            if done {
                break;
            }
        }
    }

    /// Precedence: Success (a result exists) > Active/Queued (the downloader
    /// owns a task) > Failed (in the failure set) > Idle. At most one
    /// transition and one notification per call.
    fn reconcile_cell(&self, st: &mut GridState, pos: usize) -> bool {
        let index = st.cells[pos].index;
        if st.record(index).is_none() {
            return self.apply_state(st, pos, CellState::MissingRecord, false);
        }
        let Some(key) = st.key_for(index) else {
            return self.apply_state(st, pos, CellState::MissingKey, false);
        };
        if let Some(thumb) = st.results.get(&key).cloned() {
            return self.apply_state(st, pos, CellState::Success { key, thumb }, false);
        }
        if self.downloader.is_downloading(index) {
            // The failure set cannot be trusted over a live download.
            st.failed.remove(&index);
            let next = if self.downloader.is_downloading_actively(index) {
                CellState::Active { key }
            } else {
                CellState::Queued { key }
            };
            return self.apply_state(st, pos, next, false);
        }
        if st.failed.contains(&index) {
            return self.apply_state(st, pos, CellState::Failed { key }, false);
        }
        self.apply_state(st, pos, CellState::Idle { key }, false)
    }

    /// Every state write funnels through here: the refresh gate, the
    /// idempotence check, and the change notification in one place.
    fn apply_state(&self, st: &mut GridState, pos: usize, next: CellState, from_refresh: bool) -> bool {
        if self.is_refreshing() && !from_refresh {
            return false;
        }
        let cell = &mut st.cells[pos];
        if cell.apply(next) {
            let _ = self.updates_tx.send(CellUpdate { index: cell.index });
            true
        } else {
            false
        }
    }

    /// Rebuilds the tracked window from the layout, runs a synchronous quick
    /// state pass, and drops scheduler work that scrolled out of range.
    pub fn handle_visible_cells_changed(self: &Arc<Self>) {
        let (first, last, valid) = {
            let st = self.state.lock();
            if st.cell_count == 0 {
                (0, 0, false)
            } else {
                let first = self.layout.first_visible_index();
                let last = self.layout.last_visible_index().min(st.cell_count - 1);
                (first, last, first <= last)
            }
        };

        {
            let mut st = self.state.lock();
            st.cells = if valid {
                (first..=last).map(CellModel::new).collect()
            } else {
                Vec::new()
            };
        }
        if !valid {
            return;
        }

        self.refresh_visible_states();
        self.downloader.cancel_outside_range(first, last);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.fetch_more_pages_if_necessary().await;
        });
    }

    /// Synchronous quick pass after a visibility change. Adds nothing to the
    /// downloader; the heartbeat takes care of assignment.
    fn refresh_visible_states(&self) {
        let mut st = self.state.lock();
        for pos in 0..st.cells.len() {
            let index = st.cells[pos].index;
            if st.record(index).is_none() {
                self.apply_state(&mut st, pos, CellState::MissingRecord, false);
                continue;
            }
            let Some(key) = st.key_for(index) else {
                self.apply_state(&mut st, pos, CellState::MissingKey, false);
                continue;
            };
            if let Some(thumb) = st.results.get(&key).cloned() {
                self.apply_state(&mut st, pos, CellState::Success { key, thumb }, false);
            } else if st.failed.contains(&index) {
                self.apply_state(&mut st, pos, CellState::Failed { key }, false);
            } else {
                match st.cells[pos].state.kind() {
                    CellStateKind::Queued | CellStateKind::Active => {}
                    _ => {
                        self.apply_state(&mut st, pos, CellState::Idle { key }, false);
                    }
                }
            }
        }
    }

    /// Fetches a page of records, falling back to the offline store when the
    /// network yields nothing and no records are held at all.
    pub async fn fetch_page(self: &Arc<Self>, page: usize) {
        if self.is_fetching.load(Ordering::SeqCst) {
            debug!("fetch of page {} skipped, already fetching", page);
            return;
        }
        if self.is_refreshing() {
            debug!("fetch of page {} skipped, refresh in progress", page);
            return;
        }
        self.is_fetching.store(true, Ordering::SeqCst);

        let records = self.fetch_page_from_network(page).await;
        if records.is_empty() {
            let have_any = self.state.lock().records.iter().any(|slot| slot.is_some());
            if have_any {
                debug!("page {} fetch came back empty, keeping current records", page);
            } else {
                match self.store.load_all().await {
                    Ok(offline) if !offline.is_empty() => {
                        info!("offline store supplied {} records", offline.len());
                        self.sync_offline_records(offline);
                        self.any_item_present.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => self.any_item_present.store(false, Ordering::Relaxed),
                    Err(e) => {
                        warn!("offline store load failed: {}", e);
                        self.any_item_present.store(false, Ordering::Relaxed);
                    }
                }
            }
        } else {
            self.sync_page_records(records, page);
            self.any_item_present.store(true, Ordering::Relaxed);
        }

        self.is_fetching.store(false, Ordering::SeqCst);
        let cell_count = self.state.lock().cell_count;
        self.layout.register_cell_count(cell_count);
        self.handle_visible_cells_changed();
    }

    async fn fetch_page_from_network(&self, page: usize) -> Vec<ContentRecord> {
        // Keep peace with the network: a page re-fetched in a tight loop gets
        // stalled rather than hammered.
        {
            let mut st = self.state.lock();
            if st.recent_fetches.len() >= 3 {
                if let Some(last) = st.recent_fetches.last() {
                    if last.page == page
                        && last.at.elapsed() <= Duration::from_secs(FETCH_THROTTLE_SECS)
                    {
                        warn!("stalling fetch of page {}, repeated too soon", page);
                        self.network_error.store(true, Ordering::Relaxed);
                        return Vec::new();
                    }
                }
            }
            st.recent_fetches.push(RecentFetch {
                at: Instant::now(),
                page,
            });
            if st.recent_fetches.len() > 3 {
                st.recent_fetches.remove(0);
            }
        }

        match self.content.fetch_page(page).await {
            Ok(resp) => {
                if let Err(e) = self.store.sync(&resp.records).await {
                    warn!("offline sync failed: {}", e);
                }
                let mut st = self.state.lock();
                st.total_items = resp.total_items;
                st.total_pages = resp.total_pages;
                if resp.records.len() > st.page_size {
                    st.page_size = resp.records.len();
                }
                if page > st.highest_page_fetched {
                    st.highest_page_fetched = page;
                }
                st.cell_count = (st.highest_page_fetched * st.page_size).min(st.total_items);
                self.network_error.store(false, Ordering::Relaxed);
                resp.records
            }
            Err(e) => {
                warn!("unable to fetch page {}: {}", page, e);
                self.network_error.store(true, Ordering::Relaxed);
                Vec::new()
            }
        }
    }

    /// Writes a page of records over its index window, growing the table with
    /// holes as needed.
    fn sync_page_records(&self, records: Vec<ContentRecord>, page: usize) {
        let mut st = self.state.lock();
        if st.page_size == 0 || page == 0 {
            warn!(
                "page synchronize with page_size={} page={}, dropping",
                st.page_size, page
            );
            return;
        }
        let start = (page - 1) * st.page_size;
        let ceiling = start + records.len();
        while st.records.len() < ceiling {
            st.records.push(None);
        }
        for (offset, record) in records.into_iter().enumerate() {
            st.records[start + offset] = Some(Arc::new(record));
        }
    }

    /// Replaces the record table wholesale with offline data; paging is
    /// disabled until a network fetch succeeds again.
    fn sync_offline_records(&self, records: Vec<ContentRecord>) {
        let mut st = self.state.lock();
        st.page_size = 0;
        st.total_items = records.len();
        st.total_pages = 0;
        st.highest_page_fetched = 0;
        st.cell_count = records.len();
        st.records = records.into_iter().map(|r| Some(Arc::new(r))).collect();
    }

    /// Tops up pages covering the window one row above and two below the
    /// viewport: first any page that is entirely missing, then any page with
    /// holes. Runs inside the tick so it never overlaps a refresh.
    async fn fetch_more_pages_if_necessary(self: &Arc<Self>) {
        if self.is_fetching.load(Ordering::SeqCst) || self.is_refreshing() {
            return;
        }
        if !self.is_reachable.load(Ordering::Relaxed) {
            return;
        }

        let page_to_fetch = {
            let st = self.state.lock();
            self.choose_page_to_fetch(&st)
        };
        if let Some(page) = page_to_fetch {
            self.fetch_page(page).await;
        }
    }

    fn choose_page_to_fetch(&self, st: &GridState) -> Option<usize> {
        if st.page_size < 1 || st.total_pages < 1 {
            return None;
        }
        let cols = self.layout.number_of_cols();
        let first_considered = self.layout.first_visible_index().saturating_sub(cols);
        let last_considered = self.layout.last_visible_index_unclamped() + cols * 2;

        let first_page = (first_considered / st.page_size + 1).max(1);
        if first_page > st.total_pages {
            return None;
        }
        let last_page = (last_considered / st.page_size + 1).clamp(1, st.total_pages);

        // A page fetched twice in rapid succession is stuck; if the scan lands
        // on it, give up for this round instead of looping on bad results.
        let mut stuck_page = None;
        if st.recent_fetches.len() >= 2 {
            let newest = &st.recent_fetches[st.recent_fetches.len() - 1];
            let previous = &st.recent_fetches[st.recent_fetches.len() - 2];
            if newest.page == previous.page
                && newest.at.elapsed() <= Duration::from_secs(FETCH_REPEAT_WINDOW_SECS)
            {
                stuck_page = Some(newest.page);
            }
        }

        // The last page may be short; never scan past the real collection.
        let page_range = |page: usize| {
            let start = (page - 1) * st.page_size;
            let end = (start + st.page_size).min(st.total_items);
            start..end
        };

        for page in first_page..=last_page {
            let mut range = page_range(page);
            if range.is_empty() {
                continue;
            }
            if range.all(|i| st.record(i).is_none()) {
                return if stuck_page == Some(page) { None } else { Some(page) };
            }
        }
        for page in first_page..=last_page {
            let mut range = page_range(page);
            if range.any(|i| st.record(i).is_none()) {
                return if stuck_page == Some(page) { None } else { Some(page) };
            }
        }
        None
    }

    /// Full refresh. Mutually exclusive with the heartbeat and paged fetches;
    /// callers already holding either are waited out with a bounded budget.
    pub async fn refresh(self: &Arc<Self>) {
        if self.is_refreshing.swap(true, Ordering::SeqCst) {
            info!("refresh already in progress, not doubling up");
            return;
        }

        self.state.lock().recent_fetches.clear();

        self.downloader.set_blocked(true);
        self.downloader.cancel_all();

        if !self.spin_wait(&self.is_on_tick, "heartbeat").await
            || !self.spin_wait(&self.is_fetching, "page fetch").await
        {
            self.downloader.set_blocked(false);
            self.is_refreshing.store(false, Ordering::SeqCst);
            return;
        }

        // Stage every tracked cell to the blank state, batched like a sweep.
        let batch_size = self.batch_chunk_size();
        let batch_sleep = Duration::from_millis(self.config.batch_sleep_ms);
        let mut cursor = 0;
        loop {
            let mut updates = 0;
            let done;
            {
                let mut st = self.state.lock();
                while cursor < st.cells.len() && updates < batch_size {
                    let pos = cursor;
                    cursor += 1;
                    if self.apply_state(&mut st, pos, CellState::MissingRecord, true) {
                        updates += 1;
                    }
                }
                done = cursor >= st.cells.len();
            }
            if updates > 0 {
                tokio::time::sleep(batch_sleep).await;
            }
            if done {
                break;
            }
        }

        tokio::time::sleep(Duration::from_millis(REFRESH_SETTLE_MS)).await;
        let records = self.fetch_page_from_network(1).await;
        tokio::time::sleep(Duration::from_millis(REFRESH_SETTLE_MS)).await;

        if records.is_empty() {
            warn!("refresh got nothing from the network");
            let offline = self.store.load_all().await.unwrap_or_else(|e| {
                warn!("offline store load failed: {}", e);
                Vec::new()
            });
            if offline.is_empty() {
                warn!("refresh got nothing from the offline store either");
                self.downloader.set_blocked(false);
                self.is_refreshing.store(false, Ordering::SeqCst);
                self.any_item_present.store(false, Ordering::Relaxed);
                return;
            }
            self.clear_for_refresh();
            self.sync_offline_records(offline);
        } else {
            self.clear_for_refresh();
            self.sync_page_records(records, 1);
        }

        self.downloader.set_blocked(false);
        self.is_refreshing.store(false, Ordering::SeqCst);
        self.any_item_present.store(true, Ordering::Relaxed);
        let cell_count = self.state.lock().cell_count;
        self.layout.register_cell_count(cell_count);
        self.handle_visible_cells_changed();
    }

    /// Clears everything a refresh invalidates. The disk cache index stays:
    /// entries are keyed by content and remain valid for the fresh records;
    /// clearing the checked set forces a re-probe instead.
    fn clear_for_refresh(&self) {
        let mut st = self.state.lock();
        st.results.clear();
        st.failed.clear();
        st.cache_checked.clear();
        st.records.clear();
        st.cells.clear();
    }

    async fn spin_wait(&self, flag: &AtomicBool, what: &str) -> bool {
        let mut fudge: u32 = 0;
        while flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
            fudge += 1;
            if fudge >= REFRESH_SPIN_BUDGET {
                warn!("terminating refresh, {} is locked", what);
                return false;
            }
        }
        true
    }

    /// Explicit user retry: clear the failure entry and restart the task,
    /// bypassing the eligibility gate.
    pub async fn force_retry(self: &Arc<Self>, index: usize) {
        let item = {
            let mut st = self.state.lock();
            st.failed.remove(&index);
            st.record(index).map(|record| FetchItem {
                index,
                url: record.image_url(&self.config.image_url_base),
            })
        };
        if let Some(item) = item {
            info!("forced download restart @ {}", index);
            self.downloader.force_restart(&item).await;
        }
    }

    /// Detail lookup for one record, single-flight.
    pub async fn fetch_details(&self, index: usize) -> Result<Option<ContentRecord>> {
        if self.is_fetching_details.swap(true, Ordering::SeqCst) {
            debug!("details fetch already queued, dropping");
            return Ok(None);
        }
        let id = self.state.lock().record(index).map(|record| record.id);
        let result = match id {
            Some(id) => self.content.fetch_details(id).await.map(Some),
            None => Ok(None),
        };
        self.is_fetching_details.store(false, Ordering::SeqCst);
        result
    }

    /// Chaos hook: scrambles cache, downloader, and coordinator tables at
    /// random. The heartbeat is expected to converge back to truth.
    pub async fn invalidate_randomly(&self) {
        self.cache.set_disabled(rand::random::<bool>());
        match rand::random::<u8>() % 3 {
            0 => self.cache.purge().await,
            1 => self.cache.purge_randomly().await,
            _ => {}
        }
        match rand::random::<u8>() % 3 {
            0 => self.downloader.cancel_all(),
            1 => self.downloader.cancel_all_randomly(),
            _ => {}
        }

        let mut st = self.state.lock();
        if rand::random::<bool>() {
            // Punch random holes in the record table.
            for slot in st.records.iter_mut() {
                if rand::random::<u8>() % 6 == 3 {
                    *slot = None;
                }
            }
        }
        match rand::random::<u8>() % 3 {
            0 => st.results.clear(),
            1 => st.results.retain(|_, _| rand::random::<bool>()),
            _ => {}
        }
        match rand::random::<u8>() % 3 {
            0 => st.failed.clear(),
            1 => st.failed.retain(|_| rand::random::<bool>()),
            _ => {}
        }
        // The checked set always goes, or purged cache entries would never be
        // probed again.
        st.cache_checked.clear();
    }
}

/// Vertical proximity to the viewport dominates; horizontal position breaks
/// ties in reading order.
fn priority_score(dist_x: i64, dist_y: i64) -> i64 {
    -dist_x + (8192 * 8192 - 8192 * dist_y)
}
