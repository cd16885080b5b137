//! Cache of rendered image pictures with LRU and TTL eviction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use inkboard_core::config::CacheConfig;
use inkboard_core::image::{CanvasImage, ImageId};
use inkboard_core::viewport::transform_fingerprint;

use crate::renderer::Picture;

/// Identifies one rendered variant of an image.
///
/// The fingerprint changes with every transform change and the selection flag
/// with the highlight, so a lookup never returns a picture of an older state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PictureKey {
    pub image_id: ImageId,
    pub fingerprint: u64,
    pub selected: bool,
}

impl PictureKey {
    pub fn for_image(image: &CanvasImage, selected: bool) -> Self {
        Self {
            image_id: image.id().clone(),
            fingerprint: transform_fingerprint(image.transform()),
            selected,
        }
    }
}

struct Entry<P> {
    picture: P,
    last_access: Instant,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded picture cache.
///
/// Every picture that leaves the cache (replaced, evicted, expired, cleared or
/// dropped with the cache) is disposed exactly once.
pub struct PictureCache<P: Picture> {
    entries: HashMap<PictureKey, Entry<P>>,
    capacity: usize,
    ttl: Duration,
    sweep_interval: Duration,
    last_sweep: Option<Instant>,
    stats: CacheStats,
}

fn dispose<P: Picture>(key: &PictureKey, mut entry: Entry<P>) {
    if let Err(e) = entry.picture.dispose() {
        log::warn!("Picture for {} not released: {}", key.image_id, e);
    }
}

impl<P: Picture> PictureCache<P> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: config.capacity.max(1),
            ttl: config.ttl,
            sweep_interval: config.sweep_interval,
            last_sweep: None,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, key: &PictureKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&mut self, key: &PictureKey) -> Option<&P> {
        self.get_at(key, Instant::now())
    }

    /// Look up a picture, refreshing its last access time on a hit.
    pub fn get_at(&mut self, key: &PictureKey, now: Instant) -> Option<&P> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.stats.hits += 1;
                entry.last_access = now;
                Some(&entry.picture)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: PictureKey, picture: P) {
        self.put_at(key, picture, Instant::now());
    }

    /// Insert a picture. A picture already stored under `key` is disposed first;
    /// a full cache drops its least recently used quarter (at least one).
    pub fn put_at(&mut self, key: PictureKey, picture: P, now: Instant) {
        if let Some(old) = self.entries.remove(&key) {
            dispose(&key, old);
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest((self.entries.len() / 4).max(1));
        }
        self.entries.insert(
            key,
            Entry {
                picture,
                last_access: now,
            },
        );
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut by_age: Vec<(Instant, PictureKey)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_access, key.clone()))
            .collect();
        by_age.sort_by_key(|(at, _)| *at);

        for (_, key) in by_age.into_iter().take(count) {
            if let Some(entry) = self.entries.remove(&key) {
                dispose(&key, entry);
                self.stats.evictions += 1;
            }
        }
        log::trace!("Evicted {} pictures, {} left", count, self.entries.len());
    }

    /// Drop every variant of one image. Returns how many were removed.
    pub fn remove_image(&mut self, image_id: &str) -> usize {
        let keys: Vec<PictureKey> = self
            .entries
            .keys()
            .filter(|key| key.image_id == image_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = self.entries.remove(key) {
                dispose(key, entry);
            }
        }
        keys.len()
    }

    /// Drop entries not accessed within the TTL. Returns how many were removed.
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let expired: Vec<PictureKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                dispose(key, entry);
                self.stats.evictions += 1;
            }
        }
        self.last_sweep = Some(now);
        if !expired.is_empty() {
            log::debug!("Swept {} expired pictures", expired.len());
        }
        expired.len()
    }

    /// Run [`sweep_at`](Self::sweep_at) when the sweep interval has passed.
    pub fn maybe_sweep_at(&mut self, now: Instant) -> usize {
        match self.last_sweep {
            None => {
                // First frame starts the clock.
                self.last_sweep = Some(now);
                0
            }
            Some(last) if now.saturating_duration_since(last) >= self.sweep_interval => self.sweep_at(now),
            Some(_) => 0,
        }
    }

    pub fn clear(&mut self) {
        for (key, entry) in self.entries.drain() {
            dispose(&key, entry);
        }
    }
}

impl<P: Picture> Drop for PictureCache<P> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkboard_core::error::ResourceError;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Tracked {
        disposals: Rc<Cell<usize>>,
        disposed: bool,
    }

    impl Picture for Tracked {
        fn dispose(&mut self) -> Result<(), ResourceError> {
            assert!(!self.disposed, "picture disposed twice");
            self.disposed = true;
            self.disposals.set(self.disposals.get() + 1);
            Ok(())
        }
    }

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig {
            capacity,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(120),
        }
    }

    fn key(id: &str, fingerprint: u64) -> PictureKey {
        PictureKey {
            image_id: id.to_string(),
            fingerprint,
            selected: false,
        }
    }

    fn picture(counter: &Rc<Cell<usize>>) -> Tracked {
        Tracked {
            disposals: counter.clone(),
            disposed: false,
        }
    }

    #[test]
    fn test_get_refreshes_access() {
        let counter = Rc::new(Cell::new(0));
        let mut cache = PictureCache::new(&config(4));
        let start = Instant::now();
        for i in 0..4 {
            cache.put_at(key(&format!("img{i}"), 0), picture(&counter), start + Duration::from_secs(i));
        }
        // img0 is the oldest until touched.
        assert!(cache.get_at(&key("img0", 0), start + Duration::from_secs(10)).is_some());
        cache.put_at(key("img4", 0), picture(&counter), start + Duration::from_secs(11));

        assert!(cache.contains(&key("img0", 0)));
        assert!(!cache.contains(&key("img1", 0)));
        assert_eq!(counter.get(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_full_cache_evicts_a_quarter() {
        let counter = Rc::new(Cell::new(0));
        let mut cache = PictureCache::new(&config(8));
        let start = Instant::now();
        for i in 0..8 {
            cache.put_at(key(&format!("img{i}"), 0), picture(&counter), start + Duration::from_secs(i));
        }
        cache.put_at(key("new", 0), picture(&counter), start + Duration::from_secs(20));

        assert_eq!(counter.get(), 2);
        assert_eq!(cache.len(), 7);
        assert!(!cache.contains(&key("img0", 0)));
        assert!(!cache.contains(&key("img1", 0)));
        assert!(cache.contains(&key("img2", 0)));
    }

    #[test]
    fn test_replacing_a_key_disposes_old_picture() {
        let counter = Rc::new(Cell::new(0));
        let mut cache = PictureCache::new(&config(4));
        cache.put(key("a", 1), picture(&counter));
        cache.put(key("a", 1), picture(&counter));
        assert_eq!(cache.len(), 1);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_remove_image_drops_all_variants() {
        let counter = Rc::new(Cell::new(0));
        let mut cache = PictureCache::new(&config(8));
        cache.put(key("a", 1), picture(&counter));
        cache.put(key("a", 2), picture(&counter));
        cache.put(
            PictureKey {
                selected: true,
                ..key("a", 2)
            },
            picture(&counter),
        );
        cache.put(key("b", 1), picture(&counter));

        assert_eq!(cache.remove_image("a"), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn test_sweep_expires_stale_entries() {
        let counter = Rc::new(Cell::new(0));
        let mut cache = PictureCache::new(&config(8));
        let start = Instant::now();
        cache.put_at(key("old", 0), picture(&counter), start);
        cache.put_at(key("fresh", 0), picture(&counter), start + Duration::from_secs(200));

        assert_eq!(cache.maybe_sweep_at(start), 0);
        assert_eq!(cache.maybe_sweep_at(start + Duration::from_secs(60)), 0);
        assert_eq!(cache.maybe_sweep_at(start + Duration::from_secs(301)), 1);
        assert!(cache.contains(&key("fresh", 0)));
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_drop_releases_everything_once() {
        let counter = Rc::new(Cell::new(0));
        {
            let mut cache = PictureCache::new(&config(2));
            for i in 0..5 {
                cache.put(key(&format!("img{i}"), 0), picture(&counter));
            }
            cache.remove_image("img4");
        }
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_key_tracks_transform_and_selection() {
        use inkboard_core::image::Bitmap;
        use kurbo::Affine;

        let image = CanvasImage::new("a", Bitmap::solid(2, 2, [0, 0, 0, 255]).unwrap());
        let moved = image
            .clone()
            .with_transform(Affine::translate((5.0, 0.0)))
            .unwrap();
        assert_ne!(PictureKey::for_image(&image, false), PictureKey::for_image(&moved, false));
        assert_ne!(PictureKey::for_image(&image, false), PictureKey::for_image(&image, true));
        assert_eq!(PictureKey::for_image(&image, true), PictureKey::for_image(&image.clone(), true));
    }
}
