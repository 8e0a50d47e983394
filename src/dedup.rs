// =============================================================================
// dedup.rs — HAVE WE SEEN THIS URL BEFORE?
// =============================================================================
//
// Bloom filter in front, LRU cache behind.
//
// 1. The Bloom filter answers "definitely new" in O(k) with no false
//    negatives. Most submissions stop here.
// 2. On a Bloom "maybe", the LRU cache gives the definitive answer. A Bloom
//    false positive that the LRU doesn't know about is let through.
// 3. The Bloom filter is rebuilt every rotation interval so it never
//    saturates. The new filter is seeded from the LRU, so rotation only
//    forgets URLs the LRU has already evicted.
//
// URLs are normalised before hashing so that `https://Site.ir/a/#top` and
// `https://site.ir/a` count as the same document.
// =============================================================================

use bloomfilter::Bloom;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct DedupEngine {
    bloom: RwLock<Bloom<String>>,

    /// Authoritative for anything the Bloom filter is unsure about.
    lru_cache: RwLock<LruCache<String, ()>>,

    last_rotation: RwLock<Instant>,

    rotation_interval: Duration,

    bloom_expected_items: u64,
    bloom_fp_rate: f64,

    pub stats: DedupStats,
}

pub struct DedupStats {
    pub checks: portable_atomic::AtomicU64,
    pub unique: portable_atomic::AtomicU64,
    pub duplicates: portable_atomic::AtomicU64,
    pub rotations: portable_atomic::AtomicU64,
    /// Bloom said "maybe", LRU said no.
    pub bloom_false_positives: portable_atomic::AtomicU64,
    pub forgotten: portable_atomic::AtomicU64,
}

impl DedupStats {
    fn new() -> Self {
        Self {
            checks: portable_atomic::AtomicU64::new(0),
            unique: portable_atomic::AtomicU64::new(0),
            duplicates: portable_atomic::AtomicU64::new(0),
            rotations: portable_atomic::AtomicU64::new(0),
            bloom_false_positives: portable_atomic::AtomicU64::new(0),
            forgotten: portable_atomic::AtomicU64::new(0),
        }
    }
}

/// Canonical form used as the dedup key: fragment dropped, trailing slash
/// trimmed from the path. Host case is already folded by the parser.
/// Strings that don't parse as URLs are used verbatim.
pub fn normalize_url(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            let mut key = url.to_string();
            if url.query().is_none() && key.ends_with('/') {
                key.pop();
            }
            key
        }
        Err(_) => raw.trim().to_string(),
    }
}

impl DedupEngine {
    pub fn new(
        expected_items: u64,
        fp_rate: f64,
        lru_capacity: usize,
        rotation_interval: Duration,
    ) -> Self {
        info!(
            expected_items = expected_items,
            fp_rate = fp_rate,
            lru_capacity = lru_capacity,
            rotation_secs = rotation_interval.as_secs(),
            "URL dedup engine ready"
        );

        let bloom = Bloom::new_for_fp_rate(expected_items.max(1) as usize, fp_rate);
        let lru_size = NonZeroUsize::new(lru_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            bloom: RwLock::new(bloom),
            lru_cache: RwLock::new(LruCache::new(lru_size)),
            last_rotation: RwLock::new(Instant::now()),
            rotation_interval,
            bloom_expected_items: expected_items.max(1),
            bloom_fp_rate: fp_rate,
            stats: DedupStats::new(),
        }
    }

    /// Returns `true` if the URL is new, and remembers it.
    pub fn check_and_insert(&self, url: &str) -> bool {
        use portable_atomic::Ordering;

        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        self.maybe_rotate();

        let key = normalize_url(url);

        let maybe_seen = self.bloom.read().check(&key);
        if maybe_seen {
            let mut lru = self.lru_cache.write();
            if lru.get(&key).is_some() {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(url = %key, "Duplicate URL");
                return false;
            }
            self.stats.bloom_false_positives.fetch_add(1, Ordering::Relaxed);
        }

        self.bloom.write().set(&key);
        self.lru_cache.write().put(key, ());

        self.stats.unique.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Let a URL through again, e.g. after its queue item failed for good.
    /// Only the LRU entry goes; the Bloom filter can't delete, and a Bloom
    /// hit with no LRU entry already counts as new.
    pub fn forget(&self, url: &str) -> bool {
        let removed = self.lru_cache.write().pop(&normalize_url(url)).is_some();
        if removed {
            self.stats.forgotten.fetch_add(1, portable_atomic::Ordering::Relaxed);
        }
        removed
    }

    fn maybe_rotate(&self) {
        if self.last_rotation.read().elapsed() < self.rotation_interval {
            return;
        }

        let mut bloom = self.bloom.write();
        let mut last = self.last_rotation.write();

        // Another thread may have rotated while we waited
        if last.elapsed() >= self.rotation_interval {
            let mut fresh = Bloom::new_for_fp_rate(self.bloom_expected_items as usize, self.bloom_fp_rate);
            for (key, _) in self.lru_cache.read().iter() {
                fresh.set(key);
            }
            *bloom = fresh;
            *last = Instant::now();
            self.stats.rotations.fetch_add(1, portable_atomic::Ordering::Relaxed);
            info!("Bloom filter rotated");
        }
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        use portable_atomic::Ordering;
        DedupSnapshot {
            total_checks: self.stats.checks.load(Ordering::Relaxed),
            unique_urls: self.stats.unique.load(Ordering::Relaxed),
            duplicates_caught: self.stats.duplicates.load(Ordering::Relaxed),
            bloom_rotations: self.stats.rotations.load(Ordering::Relaxed),
            bloom_false_positives: self.stats.bloom_false_positives.load(Ordering::Relaxed),
            forgotten: self.stats.forgotten.load(Ordering::Relaxed),
            lru_cache_size: self.lru_cache.read().len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DedupSnapshot {
    pub total_checks: u64,
    pub unique_urls: u64,
    pub duplicates_caught: u64,
    pub bloom_rotations: u64,
    pub bloom_false_positives: u64,
    pub forgotten: u64,
    pub lru_cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DedupEngine {
        DedupEngine::new(1000, 0.01, 100, Duration::from_secs(3600))
    }

    #[test]
    fn test_new_urls_are_accepted() {
        let engine = engine();
        assert!(engine.check_and_insert("https://rc.majlis.ir/fa/law/show/92778"));
        assert!(engine.check_and_insert("https://rc.majlis.ir/fa/law/show/92779"));
    }

    #[test]
    fn test_duplicate_urls_are_rejected() {
        let engine = engine();
        assert!(engine.check_and_insert("https://rc.majlis.ir/fa/law/show/92778"));
        assert!(!engine.check_and_insert("https://rc.majlis.ir/fa/law/show/92778"));
        assert_eq!(engine.snapshot().duplicates_caught, 1);
    }

    #[test]
    fn test_normalisation_folds_cosmetic_differences() {
        let engine = engine();
        assert!(engine.check_and_insert("https://Example.IR/laws/"));
        assert!(!engine.check_and_insert("https://example.ir/laws#section-2"));
        assert_eq!(normalize_url("not a url "), "not a url");
        assert_eq!(
            normalize_url("https://example.ir/search?q=1"),
            "https://example.ir/search?q=1"
        );
    }

    #[test]
    fn test_forget_lets_a_url_back_in() {
        let engine = engine();
        assert!(engine.check_and_insert("https://example.ir/a"));
        assert!(engine.forget("https://example.ir/a"));
        assert!(engine.check_and_insert("https://example.ir/a"));
        assert!(!engine.forget("https://example.ir/never-seen"));
    }

    #[test]
    fn test_rotation_keeps_lru_answers() {
        let engine = DedupEngine::new(1000, 0.01, 100, Duration::ZERO);
        assert!(engine.check_and_insert("https://example.ir/a"));
        // Rotates on every call; the reseeded filter still knows the URL
        assert!(!engine.check_and_insert("https://example.ir/a"));
        assert!(engine.check_and_insert("https://example.ir/b"));
        assert!(engine.snapshot().bloom_rotations >= 1);
    }
}
