//! In-memory coordination store.
//!
//! Same key layout and atomicity as the Redis store: every operation takes
//! one lock, so a result commit is observed all at once or not at all.

use async_trait::async_trait;
use pullci_core::{BuildKey, BuildResult, BuildState, MethodResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::{Admission, CoordinationStore, KeySpace, StoreError, StoreResult};

#[derive(Default)]
struct Data {
    strings: HashMap<String, Vec<u8>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, Vec<f64>>,
    counters: HashMap<String, u64>,
}

pub struct MemoryStore {
    keys: KeySpace,
    data: RwLock<Data>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(KeySpace::default())
    }
}

impl MemoryStore {
    pub fn new(keys: KeySpace) -> Self {
        Self {
            keys,
            data: RwLock::new(Data::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current value of a stats counter.
    pub async fn counter(&self, action: &str) -> u64 {
        let data = self.data.read().await;
        data.counters
            .get(&self.keys.counter(action))
            .copied()
            .unwrap_or(0)
    }

    /// Duration samples recorded for a queue.
    pub async fn durations(&self, queue: &str) -> Vec<f64> {
        let data = self.data.read().await;
        data.lists
            .get(&self.keys.message_duration(queue))
            .cloned()
            .unwrap_or_default()
    }

    /// Raw string value at a full key, for key layout checks.
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().await.strings.get(key).cloned()
    }

    /// Overwrite a commit's state directly, bypassing admission.
    pub async fn force_state(&self, key: &BuildKey, state: BuildState) {
        let mut data = self.data.write().await;
        data.strings
            .insert(self.keys.state(key), state.as_str().as_bytes().to_vec());
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn try_set_pending(&self, key: &BuildKey) -> StoreResult<Admission> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let state_key = self.keys.state(key);
        if data.strings.contains_key(&state_key) {
            return Ok(Admission::AlreadySet);
        }
        data.strings
            .insert(state_key, BuildState::Pending.as_str().as_bytes().to_vec());
        Ok(Admission::Admitted)
    }

    async fn commit_result(&self, key: &BuildKey, result: &MethodResult) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.strings.insert(
            self.keys.state(key),
            BuildState::Complete.as_str().as_bytes().to_vec(),
        );
        data.hashes
            .entry(self.keys.result(key))
            .or_default()
            .extend(result.fields());
        Ok(())
    }

    async fn fetch_state(&self, key: &BuildKey) -> StoreResult<Option<BuildState>> {
        self.check_available()?;
        let data = self.data.read().await;
        let state_key = self.keys.state(key);
        data.strings
            .get(&state_key)
            .map(|raw| {
                String::from_utf8_lossy(raw)
                    .parse::<BuildState>()
                    .map_err(|message| StoreError::Corrupt {
                        key: state_key.clone(),
                        message,
                    })
            })
            .transpose()
    }

    async fn fetch_result(&self, key: &BuildKey) -> StoreResult<BuildResult> {
        self.check_available()?;
        let data = self.data.read().await;
        let fields = data
            .hashes
            .get(&self.keys.result(key))
            .cloned()
            .unwrap_or_default();
        Ok(BuildResult::from_fields(fields))
    }

    async fn increment_counter(&self, action: &str) -> StoreResult<u64> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let counter = data.counters.entry(self.keys.counter(action)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn record_duration(&self, queue: &str, seconds: f64) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.lists
            .entry(self.keys.message_duration(queue))
            .or_default()
            .push(seconds);
        Ok(())
    }

    async fn save_associated_blob(&self, key: &BuildKey, blob: &[u8]) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.strings.insert(self.keys.payload(key), blob.to_vec());
        Ok(())
    }

    async fn fetch_associated_blob(&self, key: &BuildKey) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data.strings.get(&self.keys.payload(key)).cloned())
    }

    async fn save_event(&self, key: &BuildKey, event: &[u8]) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.strings.insert(self.keys.event(key), event.to_vec());
        Ok(())
    }

    async fn fetch_event(&self, key: &BuildKey) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data.strings.get(&self.keys.event(key)).cloned())
    }

    async fn record_pull_request_commit(
        &self,
        repository: &str,
        number: u64,
        sha: &str,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.sets
            .entry(self.keys.pull_request(repository, number))
            .or_default()
            .insert(sha.to_string());
        Ok(())
    }

    async fn pull_request_commits(
        &self,
        repository: &str,
        number: u64,
    ) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data
            .sets
            .get(&self.keys.pull_request(repository, number))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullci_core::{BuildOutcome, TestMethod};
    use std::sync::Arc;

    fn failed(method: TestMethod, output: &str) -> MethodResult {
        MethodResult::new(
            method,
            BuildOutcome::Failed {
                exit_code: Some(1),
                output: output.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_try_set_pending_admits_once() {
        let store = MemoryStore::default();
        let key = BuildKey::new("moby/moby", "abc123f");

        assert_eq!(store.try_set_pending(&key).await.unwrap(), Admission::Admitted);
        assert_eq!(
            store.try_set_pending(&key).await.unwrap(),
            Admission::AlreadySet
        );
        assert_eq!(
            store.raw("/pullci/moby/moby/commit/abc123f/state").await,
            Some(b"pending".to_vec())
        );
    }

    #[tokio::test]
    async fn test_concurrent_admissions_have_one_winner() {
        let store = Arc::new(MemoryStore::default());
        let key = BuildKey::new("moby/moby", "abc123f");

        let attempts = (0..32).map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.try_set_pending(&key).await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;

        let admitted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|a| a.is_admitted())
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_commit_keeps_other_methods() {
        let store = MemoryStore::default();
        let key = BuildKey::new("moby/moby", "abc123f");
        store.try_set_pending(&key).await.unwrap();

        store
            .commit_result(&key, &failed(TestMethod::Binary, "bin"))
            .await
            .unwrap();
        store
            .commit_result(&key, &failed(TestMethod::Test, "test"))
            .await
            .unwrap();

        let result = store.fetch_result(&key).await.unwrap();
        assert_eq!(result.output_for(TestMethod::Binary), Some("bin"));
        assert_eq!(result.output_for(TestMethod::Test), Some("test"));
        assert_eq!(
            store.fetch_state(&key).await.unwrap(),
            Some(BuildState::Complete)
        );
    }

    #[tokio::test]
    async fn test_recommit_overwrites_same_method() {
        let store = MemoryStore::default();
        let key = BuildKey::new("moby/moby", "abc123f");

        store
            .commit_result(&key, &failed(TestMethod::Test, "first"))
            .await
            .unwrap();
        let rerun = MethodResult::new(
            TestMethod::Test,
            BuildOutcome::Succeeded {
                output: "second".to_string(),
            },
        );
        store.commit_result(&key, &rerun).await.unwrap();

        let result = store.fetch_result(&key).await.unwrap();
        assert_eq!(result.result_for(TestMethod::Test), Some("passed"));
        assert_eq!(result.output_for(TestMethod::Test), Some("second"));
    }

    #[tokio::test]
    async fn test_readers_never_see_complete_without_result() {
        let store = Arc::new(MemoryStore::default());
        let keys: Vec<_> = (0..50)
            .map(|i| BuildKey::new("moby/moby", format!("{:07x}", i)))
            .collect();

        let writer = {
            let store = store.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                for key in &keys {
                    store.try_set_pending(key).await.unwrap();
                    store
                        .commit_result(key, &failed(TestMethod::Test, "out"))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let keys = keys.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        for key in &keys {
                            if store.fetch_state(key).await.unwrap() == Some(BuildState::Complete)
                            {
                                let result = store.fetch_result(key).await.unwrap();
                                assert!(result.result_for(TestMethod::Test).is_some());
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_errors_and_writes_nothing() {
        let store = MemoryStore::default();
        let key = BuildKey::new("moby/moby", "abc123f");
        store.set_available(false);

        assert!(matches!(
            store.try_set_pending(&key).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store
            .commit_result(&key, &failed(TestMethod::Test, "x"))
            .await
            .is_err());

        store.set_available(true);
        assert_eq!(store.fetch_state(&key).await.unwrap(), None);
        assert!(store.fetch_result(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_blobs_and_pull_requests() {
        let store = MemoryStore::default();
        let key = BuildKey::new("moby/moby", "abc123f");

        assert_eq!(store.increment_counter("admitted").await.unwrap(), 1);
        assert_eq!(store.increment_counter("admitted").await.unwrap(), 2);
        assert_eq!(store.counter("admitted").await, 2);

        store.record_duration("build", 2.5).await.unwrap();
        assert_eq!(store.durations("build").await, vec![2.5]);

        store.save_associated_blob(&key, b"payload").await.unwrap();
        assert_eq!(
            store.fetch_associated_blob(&key).await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert_eq!(store.fetch_event(&key).await.unwrap(), None);
        store.save_event(&key, b"event").await.unwrap();
        assert_eq!(store.fetch_event(&key).await.unwrap(), Some(b"event".to_vec()));
        assert_eq!(
            store.fetch_associated_blob(&key).await.unwrap(),
            Some(b"payload".to_vec())
        );

        store
            .record_pull_request_commit("moby/moby", 12, "bbb2222")
            .await
            .unwrap();
        store
            .record_pull_request_commit("moby/moby", 12, "aaa1111")
            .await
            .unwrap();
        assert_eq!(
            store.pull_request_commits("moby/moby", 12).await.unwrap(),
            vec!["aaa1111".to_string(), "bbb2222".to_string()]
        );
    }
}
