//! Named blocking queues between cluster peers.
//!
//! The transport is a thin wrapper over the Redis list protocol: `push` is
//! RPUSH, `pop` is a BLPOP with no timeout, `len` is LLEN. Queues are
//! namespaced by workspace — the on-wire name is `{workspace}_{key}` — and
//! payloads are opaque bytes the transport never interprets.
//!
//! One connection is opened per operation; this keeps call sites free of
//! shared connection state at the cost of extra connects.

use bytes::Bytes;
use std::fmt::Write as _;
use thiserror::Error;

/// Default queue service port.
pub const DEFAULT_PORT: u16 = 6379;
/// Pre-shared password used when the profile does not override it.
pub const DEFAULT_PASSWORD: &str = "gc123456.";
/// Queue of repair-completion ACKs.
pub const REPAIR_ACK_LIST: &str = "_RP_L_ACK";
/// Queue of build-completion ACKs.
pub const BUILD_ACK_LIST: &str = "_BD_L_ACK";
/// Queue of read-completion ACKs.
pub const READ_ACK_LIST: &str = "_RD_L_ACK";
/// Command queue of the sliced worker loop.
pub const CMD_LIST: &str = "_LIST_CMD";
/// Command queue of the block worker loop.
pub const BLK_CMD_LIST: &str = "_LIST_BLK_CMD";
/// Completion payload, byte for byte.
pub const ACK_PAYLOAD: &[u8] = b"ACK";
/// Loopback peer address.
pub const LOCAL_HOST: &str = "127.0.0.1";

#[cfg(feature = "traffic-control")]
const TRAFFIC_CONTROL_MAX_LEN: usize = 512;

/// Data queue carrying one chunk payload.
#[must_use]
pub fn chunk_queue_name(stripe_id: u64, chunk_index: u8, size: usize) -> String {
    let mut name = String::with_capacity(48);
    write!(name, "stripeid_{stripe_id}blockid_{chunk_index}sz_{size}").unwrap();
    name
}

/// Sub-chunk data queue used by the sliced pipelines.
#[must_use]
pub fn sub_chunk_queue_name(stripe_id: u64, shard_id: i64, sub_shard_id: i64) -> String {
    format!("{stripe_id}_{shard_id}_{sub_shard_id}")
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection, authentication, or protocol failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to queue service at {host}: {source}")]
    Connect {
        host: String,
        source: redis::RedisError,
    },

    #[error("queue operation failed: {0}")]
    Operation(#[from] redis::RedisError),

    #[error("queue {0} closed unexpectedly")]
    Closed(String),
}

/// One authenticated connection to a peer's queue service.
pub struct QueueClient {
    conn: redis::Connection,
    workspace: String,
}

impl QueueClient {
    /// Connect and authenticate against `host`.
    pub fn connect(host: &str, port: u16, workspace: &str, password: &str) -> Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_owned(), port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password: Some(password.to_owned()),
            },
        };
        let client = redis::Client::open(info).map_err(|e| TransportError::Connect {
            host: host.to_owned(),
            source: e,
        })?;
        let conn = client
            .get_connection()
            .map_err(|e| TransportError::Connect {
                host: host.to_owned(),
                source: e,
            })?;
        Ok(Self {
            conn,
            workspace: workspace.to_owned(),
        })
    }

    fn wire_name(&self, key: &str) -> String {
        format!("{}_{}", self.workspace, key)
    }

    /// Number of entries currently queued.
    pub fn len(&mut self, key: &str) -> Result<usize> {
        let name = self.wire_name(key);
        Ok(redis::cmd("LLEN").arg(&name).query(&mut self.conn)?)
    }

    #[must_use]
    pub fn is_empty(&mut self, key: &str) -> bool {
        self.len(key).map(|n| n == 0).unwrap_or(true)
    }

    /// Append a payload to the queue.
    ///
    /// With the `traffic-control` feature the call spins, yielding, while
    /// the queue holds 512 or more entries.
    pub fn push(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        #[cfg(feature = "traffic-control")]
        while self.len(key)? >= TRAFFIC_CONTROL_MAX_LEN {
            std::thread::yield_now();
        }
        let name = self.wire_name(key);
        redis::cmd("RPUSH")
            .arg(&name)
            .arg(payload)
            .query::<()>(&mut self.conn)?;
        Ok(())
    }

    /// Blocking left-pop. Never times out.
    pub fn pop(&mut self, key: &str) -> Result<Bytes> {
        let name = self.wire_name(key);
        let reply: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(&name)
            .arg(0_usize)
            .query(&mut self.conn)?;
        match reply {
            Some((_, payload)) => Ok(Bytes::from(payload)),
            None => Err(TransportError::Closed(name)),
        }
    }
}

/// Opens per-operation connections to named peers within one workspace.
pub struct QueueManager {
    workspace: String,
    password: String,
    port: u16,
}

impl QueueManager {
    pub fn new(workspace: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            password: password.into(),
            port: DEFAULT_PORT,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connect(&self, host: &str) -> Result<QueueClient> {
        QueueClient::connect(host, self.port, &self.workspace, &self.password)
    }

    pub fn push_to(&self, host: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.connect(host)?.push(key, payload)
    }

    pub fn pop_from(&self, host: &str, key: &str) -> Result<Bytes> {
        self.connect(host)?.pop(key)
    }
}
