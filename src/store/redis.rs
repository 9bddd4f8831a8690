use super::{parse_reply, QuotaStore, ScriptHandle, StoreError, StoreResult};
use crate::algorithms::{Procedure, ProcedureReply};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_routing::get_slot;
use redis::cluster_async::ClusterConnection;
use redis::{Client, Cmd, ErrorKind, FromRedisValue, IntoConnectionInfo, RedisError};
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// `redis://` URLs. One node for standalone mode, the seed nodes in cluster mode.
    pub nodes: Vec<String>,
    pub cluster: bool,
    pub password: Option<String>,
    /// Upper bound for every round trip, including connect.
    pub timeout: Duration,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            nodes: vec!["redis://127.0.0.1:6379".to_string()],
            cluster: false,
            password: None,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Quota store backed by Redis, standalone or clustered.
pub struct RedisStore {
    // Cloned out before every await; both connection kinds multiplex.
    connection: RwLock<Option<RedisConnection>>,
    timeout: Duration,
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with a `PING`.
    pub async fn connect(options: &RedisStoreOptions) -> StoreResult<Self> {
        if options.nodes.is_empty() {
            return Err(StoreError::Unavailable("no Redis nodes configured".into()));
        }

        let connection = with_timeout(options.timeout, Self::open(options)).await?;
        let store = Self {
            connection: RwLock::new(Some(connection)),
            timeout: options.timeout,
        };
        store.ping().await?;

        info!(
            nodes = ?options.nodes,
            cluster = options.cluster,
            "Connected to Redis"
        );
        Ok(store)
    }

    async fn open(options: &RedisStoreOptions) -> StoreResult<RedisConnection> {
        if options.cluster {
            let mut builder = ClusterClientBuilder::new(options.nodes.iter().map(String::as_str));
            if let Some(password) = &options.password {
                builder = builder.password(password.clone());
            }
            let client = builder.build().map_err(map_redis_error)?;
            let connection = client
                .get_async_connection()
                .await
                .map_err(map_redis_error)?;
            Ok(RedisConnection::Cluster(connection))
        } else {
            let mut info = options.nodes[0]
                .as_str()
                .into_connection_info()
                .map_err(map_redis_error)?;
            if let Some(password) = &options.password {
                info.redis.password = Some(password.clone());
            }
            let client = Client::open(info).map_err(map_redis_error)?;
            let manager = ConnectionManager::new(client)
                .await
                .map_err(map_redis_error)?;
            Ok(RedisConnection::Single(manager))
        }
    }

    fn connection(&self) -> StoreResult<RedisConnection> {
        let guard = self
            .connection
            .read()
            .map_err(|_| StoreError::Unavailable("failed to acquire connection lock".into()))?;
        guard
            .clone()
            .ok_or_else(|| StoreError::Unavailable("Redis connection closed".into()))
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> StoreResult<T> {
        match self.connection()? {
            RedisConnection::Single(mut conn) => {
                with_timeout(self.timeout, async move {
                    cmd.query_async(&mut conn).await.map_err(map_redis_error)
                })
                .await
            }
            RedisConnection::Cluster(mut conn) => {
                with_timeout(self.timeout, async move {
                    cmd.query_async(&mut conn).await.map_err(map_redis_error)
                })
                .await
            }
        }
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StoreError::Timeout)?
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::NoScriptError {
        StoreError::ScriptMissing
    } else if err.is_timeout() {
        StoreError::Timeout
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply '{}'", reply)))
        }
    }

    async fn upload_procedure(&self, procedure: &Procedure) -> StoreResult<ScriptHandle> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(procedure.body);

        let sha: String = self.query(&cmd).await?;
        debug!(algorithm = %procedure.algorithm, sha = %sha, "SCRIPT LOAD succeeded");
        Ok(ScriptHandle::new(sha))
    }

    async fn execute(
        &self,
        handle: &ScriptHandle,
        key: &str,
        args: &[String],
    ) -> StoreResult<ProcedureReply> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(handle.as_str()).arg(1).arg(key);
        for arg in args {
            cmd.arg(arg);
        }

        let (allowed, value): (i64, String) = self.query(&cmd).await?;
        parse_reply(allowed, &value)
    }

    /// Asks the cluster for the slot of `key`. Standalone servers have no
    /// slots, so the client-side computation is reported instead.
    async fn partition_for(&self, key: &str) -> StoreResult<u16> {
        if let RedisConnection::Single(_) = self.connection()? {
            return Ok(get_slot(key.as_bytes()));
        }

        let mut cmd = redis::cmd("CLUSTER");
        cmd.arg("KEYSLOT").arg(key);
        let slot: i64 = self.query(&cmd).await?;
        u16::try_from(slot)
            .map_err(|_| StoreError::Protocol(format!("invalid CLUSTER KEYSLOT reply {}", slot)))
    }

    async fn close(&self) -> StoreResult<()> {
        let mut guard = self
            .connection
            .write()
            .map_err(|_| StoreError::Unavailable("failed to acquire connection lock".into()))?;
        if guard.take().is_some() {
            info!("Redis connection closed");
        } else {
            warn!("Redis connection already closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noscript_maps_to_script_missing() {
        let err = RedisError::from((ErrorKind::NoScriptError, "NOSCRIPT No matching script"));
        assert_eq!(map_redis_error(err), StoreError::ScriptMissing);
    }

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RedisError::from(io);
        assert!(matches!(map_redis_error(err), StoreError::Unavailable(_)));
    }

    #[test]
    fn test_other_errors_map_to_protocol() {
        let err = RedisError::from((ErrorKind::TypeError, "unexpected reply type"));
        assert!(matches!(map_redis_error(err), StoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_nodes() {
        let options = RedisStoreOptions {
            nodes: Vec::new(),
            ..RedisStoreOptions::default()
        };
        assert!(matches!(
            RedisStore::connect(&options).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
