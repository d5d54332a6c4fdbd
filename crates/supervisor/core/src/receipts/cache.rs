//! LRU-backed receipts cache with in-flight request deduplication.

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    sync::Arc,
};

use alloy_primitives::B256;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{ReceiptsProvider, ReceiptsRequest, batch_key};
use crate::{BlockInfo, Metrics, Receipts, SupervisorError, SupervisorResult};

type KeyLocks = Mutex<HashMap<B256, Arc<AsyncMutex<()>>>>;

/// A [`ReceiptsProvider`] that caches the receipts served by an inner provider.
///
/// Concurrent requests for the same key are serialized on a per-key lock so that the inner
/// provider is asked only once; every later caller is served from the cache. Failed fetches are
/// never cached. The cache and the lock map are guarded by synchronous mutexes that are never held
/// across a call to the inner provider.
#[derive(Debug)]
pub struct ReceiptCache<P> {
    inner: P,
    cache: Mutex<LruCache<B256, Receipts>>,
    locks: KeyLocks,
}

impl<P> ReceiptCache<P> {
    /// Creates a cache holding up to `size` receipt sets in front of `inner`.
    pub fn new(inner: P, size: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN))),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapped provider.
    pub const fn inner(&self) -> &P {
        &self.inner
    }

    /// Returns the number of cached receipt sets.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Returns the number of keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.locks.lock().len()
    }

    fn cached(&self, key: &B256) -> Option<Receipts> {
        self.cache.lock().get(key).cloned()
    }

    async fn lock_key(&self, key: B256) -> KeyGuard<'_> {
        let lock = self.locks.lock().entry(key).or_default().clone();
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyGuard { key, lock, locks: &self.locks, _guard: guard }
    }
}

/// Holds the lock of one key and removes its map entry when dropped.
struct KeyGuard<'a> {
    key: B256,
    lock: Arc<AsyncMutex<()>>,
    locks: &'a KeyLocks,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // A waiter woken after the entry was removed may hold a lock no longer in the map.
        if locks.get(&self.key).is_some_and(|lock| Arc::ptr_eq(lock, &self.lock)) {
            locks.remove(&self.key);
        }
    }
}

#[async_trait]
impl<P: ReceiptsProvider> ReceiptsProvider for ReceiptCache<P> {
    async fn fetch_receipts(
        &self,
        block: &BlockInfo,
        tx_hashes: &[B256],
    ) -> SupervisorResult<Receipts> {
        let key = ReceiptsRequest::new(*block, tx_hashes.to_vec()).key();
        if let Some(receipts) = self.cached(&key) {
            metrics::counter!(Metrics::RECEIPTS_CACHE_HITS).increment(1);
            return Ok(receipts);
        }

        let _guard = self.lock_key(key).await;
        if let Some(receipts) = self.cached(&key) {
            metrics::counter!(Metrics::RECEIPTS_CACHE_HITS).increment(1);
            return Ok(receipts);
        }
        metrics::counter!(Metrics::RECEIPTS_CACHE_MISSES).increment(1);

        let receipts = self.inner.fetch_receipts(block, tx_hashes).await.inspect_err(|err| {
            debug!(target: "supervisor::receipts", block = %block, error = %err, "Failed to fetch receipts");
        })?;
        self.cache.lock().put(key, receipts.clone());
        Ok(receipts)
    }

    async fn batch_fetch_receipts(
        &self,
        requests: &[ReceiptsRequest],
    ) -> SupervisorResult<Vec<Receipts>> {
        let keys: Vec<B256> = requests.iter().map(ReceiptsRequest::key).collect();

        let mut results: Vec<Option<Receipts>> = {
            let mut cache = self.cache.lock();
            keys.iter().map(|key| cache.get(key).cloned()).collect()
        };

        // Sorted by key, so overlapping batches acquire their locks in the same order.
        let mut missing: BTreeMap<B256, &ReceiptsRequest> = BTreeMap::new();
        for ((key, request), result) in keys.iter().zip(requests).zip(&results) {
            if result.is_none() {
                missing.entry(*key).or_insert(request);
            }
        }
        let hits = results.iter().filter(|r| r.is_some()).count();
        metrics::counter!(Metrics::RECEIPTS_CACHE_HITS).increment(hits as u64);
        if missing.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let mut guards = Vec::with_capacity(missing.len());
        for key in missing.keys() {
            guards.push(self.lock_key(*key).await);
        }

        let mut fetched: HashMap<B256, Receipts> = HashMap::with_capacity(missing.len());
        {
            let mut cache = self.cache.lock();
            missing.retain(|key, _| match cache.get(key) {
                Some(receipts) => {
                    fetched.insert(*key, receipts.clone());
                    false
                }
                None => true,
            });
        }

        if !missing.is_empty() {
            metrics::counter!(Metrics::RECEIPTS_CACHE_MISSES).increment(missing.len() as u64);
            let sub_batch: Vec<ReceiptsRequest> = missing.values().map(|r| (*r).clone()).collect();
            trace!(
                target: "supervisor::receipts",
                batch = %batch_key(&sub_batch),
                requested = requests.len(),
                fetching = sub_batch.len(),
                "Fetching uncached receipts"
            );

            let receipts = self.inner.batch_fetch_receipts(&sub_batch).await?;
            if receipts.len() != sub_batch.len() {
                return Err(SupervisorError::ReceiptCountMismatch {
                    expected: sub_batch.len(),
                    actual: receipts.len(),
                });
            }

            let mut cache = self.cache.lock();
            for (key, receipts) in missing.keys().zip(receipts) {
                cache.put(*key, receipts.clone());
                fetched.insert(*key, receipts);
            }
        }
        drop(guards);

        for (result, key) in results.iter_mut().zip(&keys) {
            if result.is_none() {
                *result = fetched.get(key).cloned();
            }
        }
        results.into_iter().map(|r| r.ok_or(SupervisorError::NotFound)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        receipts::MockReceiptsProvider,
        test_utils::{block_info, receipts_for},
    };

    /// Provider that answers slowly and counts how many blocks it was asked for.
    #[derive(Debug, Default)]
    struct SlowProvider {
        calls: AtomicUsize,
        blocks: AtomicUsize,
    }

    #[async_trait]
    impl ReceiptsProvider for SlowProvider {
        async fn fetch_receipts(
            &self,
            block: &BlockInfo,
            _tx_hashes: &[B256],
        ) -> SupervisorResult<Receipts> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.blocks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(receipts_for(block.number))
        }

        async fn batch_fetch_receipts(
            &self,
            requests: &[ReceiptsRequest],
        ) -> SupervisorResult<Vec<Receipts>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.blocks.fetch_add(requests.len(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(requests.iter().map(|r| receipts_for(r.block.number)).collect())
        }
    }

    #[tokio::test]
    async fn test_concurrent_fetches_hit_source_once() {
        let cache = Arc::new(ReceiptCache::new(SlowProvider::default(), 16));
        let block = block_info(7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.fetch_receipts(&block, &[]).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), receipts_for(7));
        }

        assert_eq!(cache.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let mut inner = MockReceiptsProvider::new();
        let mut seq = mockall::Sequence::new();
        inner
            .expect_fetch_receipts()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SupervisorError::Timeout(Duration::from_secs(1))));
        inner
            .expect_fetch_receipts()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|block, _| Ok(receipts_for(block.number)));
        let cache = ReceiptCache::new(inner, 16);
        let block = block_info(3);

        assert!(matches!(
            cache.fetch_receipts(&block, &[]).await,
            Err(SupervisorError::Timeout(_))
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.in_flight(), 0);

        assert_eq!(cache.fetch_receipts(&block, &[]).await.unwrap(), receipts_for(3));
        // Served from the cache, the mock would panic on a third call.
        assert_eq!(cache.fetch_receipts(&block, &[]).await.unwrap(), receipts_for(3));
    }

    #[tokio::test]
    async fn test_batch_only_fetches_uncached_blocks() {
        let mut inner = MockReceiptsProvider::new();
        inner.expect_fetch_receipts().times(2).returning(|block, _| Ok(receipts_for(block.number)));
        inner
            .expect_batch_fetch_receipts()
            .withf(|requests| {
                let numbers: Vec<u64> = requests.iter().map(|r| r.block.number).collect();
                numbers.len() == 3 && [1, 3, 4].iter().all(|n| numbers.contains(n))
            })
            .times(1)
            .returning(|requests| {
                Ok(requests.iter().map(|r| receipts_for(r.block.number)).collect())
            });
        let cache = ReceiptCache::new(inner, 16);

        cache.fetch_receipts(&block_info(0), &[]).await.unwrap();
        cache.fetch_receipts(&block_info(2), &[]).await.unwrap();

        let requests: Vec<_> = (0..5).map(|n| ReceiptsRequest::all(block_info(n))).collect();
        let results = cache.batch_fetch_receipts(&requests).await.unwrap();

        let expected: Vec<_> = (0..5).map(receipts_for).collect();
        assert_eq!(results, expected);
        assert_eq!(cache.len(), 5);
    }

    #[tokio::test]
    async fn test_batch_deduplicates_requests() {
        let cache = ReceiptCache::new(SlowProvider::default(), 16);
        let requests = vec![
            ReceiptsRequest::all(block_info(4)),
            ReceiptsRequest::all(block_info(5)),
            ReceiptsRequest::all(block_info(4)),
        ];

        let results = cache.batch_fetch_receipts(&requests).await.unwrap();

        assert_eq!(results, vec![receipts_for(4), receipts_for(5), receipts_for(4)]);
        assert_eq!(cache.inner().blocks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_overlapping_batches_do_not_deadlock() {
        let cache = Arc::new(ReceiptCache::new(SlowProvider::default(), 64));
        let forward: Vec<_> = (0..6).map(|n| ReceiptsRequest::all(block_info(n))).collect();
        let backward: Vec<_> = forward.iter().rev().cloned().collect();

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.batch_fetch_receipts(&forward).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.batch_fetch_receipts(&backward).await })
        };

        let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
            .await
            .expect("batches deadlocked");
        let a = a.unwrap().unwrap();
        let mut b = b.unwrap().unwrap();
        b.reverse();
        assert_eq!(a, b);
        assert_eq!(cache.inner().blocks.load(Ordering::SeqCst), 6);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_batch_count_mismatch() {
        let mut inner = MockReceiptsProvider::new();
        inner.expect_batch_fetch_receipts().returning(|_| Ok(vec![receipts_for(0)]));
        let cache = ReceiptCache::new(inner, 16);
        let requests: Vec<_> = (0..2).map(|n| ReceiptsRequest::all(block_info(n))).collect();

        let err = cache.batch_fetch_receipts(&requests).await.unwrap_err();

        assert!(matches!(err, SupervisorError::ReceiptCountMismatch { expected: 2, actual: 1 }));
        assert!(cache.is_empty());
        assert_eq!(cache.in_flight(), 0);
    }
}
