//! Redis implementation of the coordination store.

use async_trait::async_trait;
use pullci_core::{BuildKey, BuildResult, BuildState, MethodResult};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{Admission, CoordinationStore, KeySpace, StoreError, StoreResult};

/// Default upper bound for a single store round trip.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordination store backed by Redis.
///
/// Uses one multiplexed connection manager, which reconnects on its own and
/// is safe to clone into concurrent callers without extra locking.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: KeySpace,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect and verify the server answers. Failure here is fatal to the
    /// process, so it is reported as `Unavailable`.
    pub async fn connect(url: &str, keys: KeySpace) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        info!(namespace = %keys.namespace(), "Connecting to coordination store");
        let conn = timeout(DEFAULT_OP_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Unavailable("timed out connecting to redis".to_string()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            keys,
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Run one store operation under the round-trip bound. Operations are
    /// never retried here: a lost reply to a conditional write would make a
    /// retry observe our own write as someone else's.
    async fn bounded<T, Fut>(&self, op: Fut) -> StoreResult<T>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Unavailable(format!(
                "redis did not answer within {:?}",
                self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn try_set_pending(&self, key: &BuildKey) -> StoreResult<Admission> {
        let state_key = self.keys.state(key);
        let mut conn = self.conn.clone();
        let created: bool = self
            .bounded(conn.set_nx(&state_key, BuildState::Pending.as_str()))
            .await?;
        debug!(key = %state_key, created, "SETNX state");
        Ok(if created {
            Admission::Admitted
        } else {
            Admission::AlreadySet
        })
    }

    async fn commit_result(&self, key: &BuildKey, result: &MethodResult) -> StoreResult<()> {
        let fields = result.fields();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.state(key), BuildState::Complete.as_str())
            .ignore()
            .hset_multiple(self.keys.result(key), &fields)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn fetch_state(&self, key: &BuildKey) -> StoreResult<Option<BuildState>> {
        let state_key = self.keys.state(key);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(conn.get(&state_key)).await?;
        raw.map(|s| {
            s.parse::<BuildState>().map_err(|message| StoreError::Corrupt {
                key: state_key.clone(),
                message,
            })
        })
        .transpose()
    }

    async fn fetch_result(&self, key: &BuildKey) -> StoreResult<BuildResult> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            self.bounded(conn.hgetall(self.keys.result(key))).await?;
        Ok(BuildResult::from_fields(fields))
    }

    async fn increment_counter(&self, action: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = self.bounded(conn.incr(self.keys.counter(action), 1_u64)).await?;
        Ok(value)
    }

    async fn record_duration(&self, queue: &str, seconds: f64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = self
            .bounded(conn.rpush(self.keys.message_duration(queue), seconds))
            .await?;
        Ok(())
    }

    async fn save_associated_blob(&self, key: &BuildKey, blob: &[u8]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = self.bounded(conn.set(self.keys.payload(key), blob)).await?;
        Ok(())
    }

    async fn fetch_associated_blob(&self, key: &BuildKey) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let blob: Option<Vec<u8>> = self.bounded(conn.get(self.keys.payload(key))).await?;
        Ok(blob)
    }

    async fn save_event(&self, key: &BuildKey, event: &[u8]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = self.bounded(conn.set(self.keys.event(key), event)).await?;
        Ok(())
    }

    async fn fetch_event(&self, key: &BuildKey) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let event: Option<Vec<u8>> = self.bounded(conn.get(self.keys.event(key))).await?;
        Ok(event)
    }

    async fn record_pull_request_commit(
        &self,
        repository: &str,
        number: u64,
        sha: &str,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = self
            .bounded(conn.sadd(self.keys.pull_request(repository, number), sha))
            .await?;
        Ok(())
    }

    async fn pull_request_commits(
        &self,
        repository: &str,
        number: u64,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut commits: Vec<String> = self
            .bounded(conn.smembers(self.keys.pull_request(repository, number)))
            .await?;
        commits.sort();
        Ok(commits)
    }
}
