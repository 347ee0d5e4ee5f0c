// Slot-file disk cache for decoded thumbnails, with a persisted key→slot index.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::recycler::{SlotEntry, SlotRecycler};
use crate::config::{CACHE_READ_WAVE_SIZE, CACHE_SAVE_COOLDOWN_MS};

/// A lookup pair: which key to read, and which cell index the result is for.
pub struct KeyIndex {
    pub key: String,
    pub index: usize,
}

struct SaveState {
    saving: bool,
    enqueued: bool,
}

/// Disk cache with a bounded number of image slots. All index access happens in
/// short critical sections; disk I/O never runs under the lock. I/O failures
/// degrade to absence, never to an error the caller has to handle.
pub struct ImageCache {
    name: String,
    dir: PathBuf,
    disabled: AtomicBool,
    recycler: Mutex<SlotRecycler>,
    save_state: Mutex<SaveState>,
    save_cooldown: Duration,
}

impl ImageCache {
    pub fn new(name: &str, dir: &Path, capacity: usize) -> Self {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("cache dir create failed for {}: {}", dir.display(), e);
        }
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            disabled: AtomicBool::new(false),
            recycler: Mutex::new(SlotRecycler::new(capacity)),
            save_state: Mutex::new(SaveState {
                saving: false,
                enqueued: false,
            }),
            save_cooldown: Duration::from_millis(CACHE_SAVE_COOLDOWN_MS),
        }
    }

    /// Shortens the index-save cool-down. Test hook.
    pub fn with_save_cooldown(mut self, cooldown: Duration) -> Self {
        self.save_cooldown = cooldown;
        self
    }

    /// A disabled cache no-ops writes and reports absence on reads.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.recycler.lock().len()
    }

    pub fn slot_for(&self, key: &str) -> Option<usize> {
        self.recycler.lock().get(key).map(|entry| entry.slot)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(format!("image_cache_{}.cache", self.name))
    }

    fn image_file_name(name: &str, slot: usize) -> String {
        format!("_cached_image_{}_{:04}.png", name, slot)
    }

    /// Loads the persisted slot index. A missing file is an empty cache.
    pub async fn load(&self) {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<SlotEntry>>(&bytes) {
                Ok(entries) => {
                    debug!("cache {} loaded {} index entries", self.name, entries.len());
                    self.recycler.lock().load_entries(entries);
                }
                Err(e) => warn!("cache {} index unreadable: {}", self.name, e),
            },
            Err(_) => debug!("cache {} has no index on disk, starting empty", self.name),
        }
    }

    /// Writes `thumb` under `key`, allocating the smallest unused slot for a
    /// new key. When every slot up to capacity is taken the write is rejected;
    /// callers already tolerate absence on the read side.
    pub async fn put(self: &Arc<Self>, thumb: &DynamicImage, key: &str) {
        if self.is_disabled() {
            return;
        }

        let mut newly_registered = false;
        let file_name = {
            let mut recycler = self.recycler.lock();
            match recycler.get(key) {
                Some(entry) => entry.file_name.clone(),
                None => {
                    let slot = recycler.next_slot();
                    if slot > recycler.capacity() {
                        warn!(
                            "cache {} full ({} slots), dropping write for {}",
                            self.name,
                            recycler.capacity(),
                            key
                        );
                        return;
                    }
                    let file_name = Self::image_file_name(&self.name, slot);
                    recycler.insert(key, slot, file_name.clone());
                    newly_registered = true;
                    file_name
                }
            }
        };

        let mut buf = Vec::new();
        if let Err(e) = thumb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png) {
            warn!("cache {} encode failed for {}: {}", self.name, key, e);
            if newly_registered {
                self.recycler.lock().remove(key);
            }
            return;
        }
        if let Err(e) = tokio::fs::write(self.dir.join(&file_name), &buf).await {
            warn!("cache {} write failed for {}: {}", self.name, file_name, e);
        }

        if newly_registered {
            self.schedule_save();
        }
    }

    /// Single lookup. Batched reads should go through `get_batch`.
    pub async fn get(&self, key_index: &KeyIndex) -> Option<DynamicImage> {
        if self.is_disabled() {
            return None;
        }
        let file_name = self
            .recycler
            .lock()
            .get(&key_index.key)
            .map(|entry| entry.file_name.clone())?;
        self.read_thumb(&file_name).await
    }

    /// Looks up many keys, reading the disk in small waves with a pacing sleep
    /// after each wave that hit, so a large burst of reads never lands on the
    /// caller in one stretch. Returns index → image for whichever lookups hit.
    pub async fn get_batch(&self, key_indices: &[KeyIndex]) -> HashMap<usize, DynamicImage> {
        let mut result = HashMap::new();
        if self.is_disabled() {
            return result;
        }

        let mut cursor = 0;
        while cursor < key_indices.len() {
            let mut wave_hits = 0;
            while cursor < key_indices.len() && wave_hits < CACHE_READ_WAVE_SIZE {
                let key_index = &key_indices[cursor];
                let file_name = self
                    .recycler
                    .lock()
                    .get(&key_index.key)
                    .map(|entry| entry.file_name.clone());
                if let Some(file_name) = file_name {
                    if let Some(thumb) = self.read_thumb(&file_name).await {
                        result.insert(key_index.index, thumb);
                        wave_hits += 1;
                    }
                }
                cursor += 1;
            }
            if wave_hits > 0 {
                tokio::time::sleep(Duration::from_millis(crate::config::BATCH_SLEEP_MS)).await;
            }
        }
        result
    }

    async fn read_thumb(&self, file_name: &str) -> Option<DynamicImage> {
        let bytes = tokio::fs::read(self.dir.join(file_name)).await.ok()?;
        match image::load_from_memory(&bytes) {
            Ok(thumb) => Some(thumb),
            Err(e) => {
                warn!("cache {} decode failed for {}: {}", self.name, file_name, e);
                None
            }
        }
    }

    /// Clears the whole index. Image files are left behind; their slots will be
    /// rewritten on reuse.
    pub async fn purge(&self) {
        tokio::time::sleep(Duration::from_micros(100)).await;
        self.recycler.lock().clear();
    }

    /// Clears a random subset of entries. Chaos-testing hook.
    pub async fn purge_randomly(&self) {
        tokio::time::sleep(Duration::from_micros(100)).await;
        self.recycler.lock().clear_randomly();
    }

    /// Debounced index persistence: one write immediately, and when more saves
    /// arrive during the cool-down they coalesce into at most one trailing
    /// write once it elapses.
    fn schedule_save(self: &Arc<Self>) {
        {
            let mut save = self.save_state.lock();
            if save.saving {
                save.enqueued = true;
                return;
            }
            save.saving = true;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            cache.run_save().await;
        });
    }

    async fn run_save(self: Arc<Self>) {
        loop {
            let entries = self.recycler.lock().entry_list();
            match serde_json::to_vec(&entries) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(self.index_path(), bytes).await {
                        warn!("cache {} index save failed: {}", self.name, e);
                    }
                }
                Err(e) => warn!("cache {} index serialize failed: {}", self.name, e),
            }

            tokio::time::sleep(self.save_cooldown).await;

            let run_again = {
                let mut save = self.save_state.lock();
                if save.enqueued {
                    save.enqueued = false;
                    true
                } else {
                    save.saving = false;
                    false
                }
            };
            if !run_again {
                break;
            }
        }
    }
}
