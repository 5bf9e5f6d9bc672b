//! Database interface: session snapshots, blocker resolution, and the two
//! administrative primitives.
//!
//! The watchdog core never talks to PostgreSQL directly; it goes through
//! [`DatabaseInterface`], which allows swapping the live `tokio-postgres`
//! client with [`MockDatabase`] for tests and simulation without changing
//! call sites.
//!
//! The live implementation probes server capabilities once at connect time
//! and fixes the session-query shape there. Everything downstream operates
//! on the normalized [`TransactionRecord`] shape and never branches on
//! server version.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Sentinel for an absent application name.
pub const UNKNOWN_APP: &str = "[unknown]";
/// Sentinel for an absent client address (unix-socket connections).
pub const LOCAL_CLIENT: &str = "[local]";
/// Sentinel for a lock resource with no table-level metadata.
pub const UNKNOWN_RESOURCE: &str = "[unknown]";

/// Boxed future for database interface operations.
pub type DbFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared handle to a database interface implementation.
pub type DbHandle = Arc<dyn DatabaseInterface>;

/// Abstraction over the external collaborators: the session-list provider,
/// the lock-graph provider, and the cancel/terminate primitives.
pub trait DatabaseInterface: Send + Sync {
    /// Current transactions in the connection's database whose elapsed time
    /// exceeds `min_duration`. Unordered; the orchestrator owns priority.
    fn snapshot(&self, min_duration: Duration) -> DbFuture<'_, Vec<TransactionRecord>>;
    /// The single highest-priority session blocking `waiter_pid`, if any.
    /// `None` is a valid outcome, not an error.
    fn resolve_blocker(&self, waiter_pid: i32) -> DbFuture<'_, Option<BlockerRecord>>;
    /// Request cancellation of the backend's current statement. Returns
    /// whether the server accepted the request.
    fn cancel_backend(&self, pid: i32) -> DbFuture<'_, bool>;
    /// Request termination of the backend's connection. Returns whether the
    /// server accepted the request.
    fn terminate_backend(&self, pid: i32) -> DbFuture<'_, bool>;
}

/// Execution state of a session, as far as escalation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// A statement is currently executing.
    Active,
    /// Open transaction with no statement running; cancelling it is
    /// meaningless, so escalation goes straight to terminate evaluation.
    IdleInTransaction,
    /// Anything else (fastpath function call, disabled state tracking, ...).
    Other,
}

impl ExecutionState {
    /// Map a `pg_stat_activity.state` value to the normalized form.
    pub fn from_db_state(state: &str) -> Self {
        match state {
            "active" => ExecutionState::Active,
            "idle in transaction" | "idle in transaction (aborted)" => {
                ExecutionState::IdleInTransaction
            }
            _ => ExecutionState::Other,
        }
    }
}

/// Wait classification, present only when the server exposes wait events.
/// Absence is a valid, reportable state, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitDetail {
    /// Wait event category (`Lock`, `LWLock`, `IO`, ...).
    pub category: String,
    /// Specific wait event within the category.
    pub event: String,
}

/// One active transaction meeting the age threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Backend pid; stable for the session's lifetime and the target of
    /// administrative actions.
    pub backend_id: i32,
    /// Authenticated user running the transaction.
    pub actor: String,
    /// Application name, `"[unknown]"` when absent.
    pub origin_app: String,
    /// Client address, `"[local]"` for unix-socket connections.
    pub origin_client: String,
    /// Last/current statement text. May reflect a prior statement when the
    /// session is idle inside an open transaction.
    pub statement_text: String,
    pub execution_state: ExecutionState,
    /// Time since transaction start.
    pub elapsed: Duration,
    /// Whether the transaction currently blocks on a lock.
    pub is_waiting: bool,
    pub wait_detail: Option<WaitDetail>,
}

impl TransactionRecord {
    /// Elapsed time in whole milliseconds, the unit used in output lines.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Classification of the lock a blocker holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Transaction-id lock; the payload is the xid.
    TransactionId(String),
    /// Any other lock type, named as `pg_locks.locktype` reports it.
    Other(String),
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::TransactionId(xid) => write!(f, "transaction id {xid}"),
            LockKind::Other(kind) => f.write_str(kind),
        }
    }
}

/// Best-effort description of what the blocker holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockedResource {
    /// A specific relation and the mode it is held in.
    Relation { name: String, mode: String },
    /// No single relation resolved; an aggregate of the blocker's granted
    /// relations.
    AnyOf(Vec<String>),
    /// No table-level metadata at all.
    Unknown,
}

impl fmt::Display for LockedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockedResource::Relation { name, mode } => write!(f, "{name} ({mode})"),
            LockedResource::AnyOf(names) => write!(f, "any of ({})", names.join(", ")),
            LockedResource::Unknown => f.write_str(UNKNOWN_RESOURCE),
        }
    }
}

/// The session currently holding the lock a waiting transaction needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerRecord {
    pub backend_id: i32,
    pub actor: String,
    pub origin_app: String,
    pub origin_client: String,
    pub statement_text: String,
    pub execution_state: ExecutionState,
    pub elapsed: Duration,
    pub locked_resource: LockedResource,
    pub lock_kind: LockKind,
}

impl BlockerRecord {
    /// Elapsed time in whole milliseconds, the unit used in output lines.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Server capabilities fixed by the one-time probe at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    /// `server_version_num`, e.g. 170002.
    pub version_num: i64,
    /// Whether `pg_stat_activity` exposes `wait_event_type`/`wait_event`
    /// (9.6+). Older servers only have the `waiting` boolean.
    pub wait_events: bool,
}

impl ServerCapabilities {
    fn from_version_num(version_num: i64) -> Self {
        Self {
            version_num,
            wait_events: version_num >= 90_600,
        }
    }
}

/// Session query for servers with wait-event columns (9.6+).
///
/// Restricted to the connection's database, excluding our own backend.
/// The threshold comparison happens server-side so only qualifying rows
/// travel.
const SESSION_QUERY_WAIT_EVENTS: &str = "\
SELECT pid,
       usename,
       application_name,
       client_addr::text AS client,
       COALESCE(state, '') AS state,
       query,
       EXTRACT(EPOCH FROM (now() - xact_start))::float8 AS elapsed,
       COALESCE(wait_event_type = 'Lock', false) AS is_waiting,
       wait_event_type,
       wait_event
FROM pg_stat_activity
WHERE datname = current_database()
  AND pid <> pg_backend_pid()
  AND xact_start IS NOT NULL
  AND EXTRACT(EPOCH FROM (now() - xact_start)) > $1::float8";

/// Session query for servers with only the legacy `waiting` boolean.
/// Pads the wait-event columns so both shapes map identically.
const SESSION_QUERY_LEGACY: &str = "\
SELECT pid,
       usename,
       application_name,
       client_addr::text AS client,
       COALESCE(state, '') AS state,
       query,
       EXTRACT(EPOCH FROM (now() - xact_start))::float8 AS elapsed,
       COALESCE(waiting, false) AS is_waiting,
       NULL::text AS wait_event_type,
       NULL::text AS wait_event
FROM pg_stat_activity
WHERE datname = current_database()
  AND pid <> pg_backend_pid()
  AND xact_start IS NOT NULL
  AND EXTRACT(EPOCH FROM (now() - xact_start)) > $1::float8";

/// First granted lock on the same resource the waiter needs, held by a
/// different backend. Matches with a resolvable relation name sort first;
/// one row only.
const BLOCKER_QUERY: &str = "\
SELECT holder.pid,
       a.usename,
       a.application_name,
       a.client_addr::text AS client,
       COALESCE(a.state, '') AS state,
       a.query,
       EXTRACT(EPOCH FROM (now() - a.xact_start))::float8 AS elapsed,
       waiter.locktype,
       waiter.transactionid::text AS xid,
       c.relname::text AS relname,
       holder.mode
FROM pg_locks waiter
JOIN pg_locks holder
  ON holder.granted
 AND holder.pid <> waiter.pid
 AND ((waiter.locktype = 'transactionid'
       AND holder.transactionid = waiter.transactionid)
   OR (waiter.relation IS NOT NULL
       AND holder.relation = waiter.relation
       AND holder.database IS NOT DISTINCT FROM waiter.database))
JOIN pg_stat_activity a ON a.pid = holder.pid
LEFT JOIN pg_class c ON c.oid = waiter.relation
WHERE NOT waiter.granted
  AND waiter.pid = $1
ORDER BY (c.relname IS NULL), holder.pid
LIMIT 1";

/// Aggregate fallback: every relation the blocker holds a granted lock on.
const HELD_RELATIONS_QUERY: &str = "\
SELECT DISTINCT c.relname::text AS relname
FROM pg_locks l
JOIN pg_class c ON c.oid = l.relation
WHERE l.pid = $1
  AND l.granted
ORDER BY relname";

/// Live database interface backed by a single `tokio-postgres` connection.
pub struct PgDatabase {
    client: Client,
    capabilities: ServerCapabilities,
    session_query: &'static str,
}

impl PgDatabase {
    /// Connect and probe capabilities. The connection task is spawned onto
    /// the current runtime; a connection-level failure surfaces as an error
    /// on the next query.
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self> {
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection task failed");
            }
        });

        let capabilities = Self::probe(&client).await?;
        info!(
            version_num = capabilities.version_num,
            wait_events = capabilities.wait_events,
            "connected"
        );

        Ok(Self {
            client,
            capabilities,
            session_query: if capabilities.wait_events {
                SESSION_QUERY_WAIT_EVENTS
            } else {
                SESSION_QUERY_LEGACY
            },
        })
    }

    /// Probed server capabilities.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
    }

    async fn probe(client: &Client) -> Result<ServerCapabilities> {
        let row = client
            .query_one("SELECT current_setting('server_version_num')::bigint", &[])
            .await?;
        Ok(ServerCapabilities::from_version_num(row.get(0)))
    }

    async fn snapshot_inner(&self, min_duration: Duration) -> Result<Vec<TransactionRecord>> {
        let threshold_secs = min_duration.as_secs_f64();
        let rows = self
            .client
            .query(self.session_query, &[&threshold_secs])
            .await?;

        let wait_events = self.capabilities.wait_events;
        let records = rows
            .iter()
            .map(|row| {
                session_record_from_parts(SessionRowParts {
                    pid: row.get("pid"),
                    usename: row.get("usename"),
                    application_name: row.get("application_name"),
                    client: row.get("client"),
                    state: row.get("state"),
                    query: row.get("query"),
                    elapsed_secs: row.get("elapsed"),
                    is_waiting: row.get("is_waiting"),
                    wait_event_type: row.get("wait_event_type"),
                    wait_event: row.get("wait_event"),
                    wait_events_supported: wait_events,
                })
            })
            .collect::<Vec<_>>();

        debug!(count = records.len(), "session snapshot fetched");
        Ok(records)
    }

    async fn resolve_blocker_inner(&self, waiter_pid: i32) -> Result<Option<BlockerRecord>> {
        let rows = self.client.query(BLOCKER_QUERY, &[&waiter_pid]).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let blocker_pid: i32 = row.get("pid");
        let relname: Option<String> = row.get("relname");
        let mode: Option<String> = row.get("mode");

        let locked_resource = match relname {
            Some(name) => LockedResource::Relation {
                name,
                mode: mode.unwrap_or_default(),
            },
            None => {
                let held = self
                    .client
                    .query(HELD_RELATIONS_QUERY, &[&blocker_pid])
                    .await?;
                let names: Vec<String> = held.iter().map(|r| r.get("relname")).collect();
                if names.is_empty() {
                    LockedResource::Unknown
                } else {
                    LockedResource::AnyOf(names)
                }
            }
        };

        let locktype: String = row.get("locktype");
        let xid: Option<String> = row.get("xid");
        let lock_kind = if locktype == "transactionid" {
            LockKind::TransactionId(xid.unwrap_or_else(|| "0".to_string()))
        } else {
            LockKind::Other(locktype)
        };

        let state: String = row.get("state");
        Ok(Some(BlockerRecord {
            backend_id: blocker_pid,
            actor: row
                .get::<_, Option<String>>("usename")
                .unwrap_or_else(|| UNKNOWN_APP.to_string()),
            origin_app: normalize_app(row.get("application_name")),
            origin_client: row
                .get::<_, Option<String>>("client")
                .unwrap_or_else(|| LOCAL_CLIENT.to_string()),
            statement_text: row.get::<_, Option<String>>("query").unwrap_or_default(),
            execution_state: ExecutionState::from_db_state(&state),
            elapsed: duration_from_secs(row.get::<_, Option<f64>>("elapsed")),
            locked_resource,
            lock_kind,
        }))
    }

    async fn signal_backend(&self, function: &str, pid: i32) -> Result<bool> {
        let query = format!("SELECT {function}($1)");
        let row = self.client.query_one(query.as_str(), &[&pid]).await?;
        // NULL means the pid no longer exists; treat as a declined request.
        Ok(row.get::<_, Option<bool>>(0).unwrap_or(false))
    }
}

impl DatabaseInterface for PgDatabase {
    fn snapshot(&self, min_duration: Duration) -> DbFuture<'_, Vec<TransactionRecord>> {
        Box::pin(self.snapshot_inner(min_duration))
    }

    fn resolve_blocker(&self, waiter_pid: i32) -> DbFuture<'_, Option<BlockerRecord>> {
        Box::pin(self.resolve_blocker_inner(waiter_pid))
    }

    fn cancel_backend(&self, pid: i32) -> DbFuture<'_, bool> {
        Box::pin(self.signal_backend("pg_cancel_backend", pid))
    }

    fn terminate_backend(&self, pid: i32) -> DbFuture<'_, bool> {
        Box::pin(self.signal_backend("pg_terminate_backend", pid))
    }
}

/// Raw column values of one session row, before normalization.
struct SessionRowParts {
    pid: i32,
    usename: Option<String>,
    application_name: Option<String>,
    client: Option<String>,
    state: String,
    query: Option<String>,
    elapsed_secs: Option<f64>,
    is_waiting: bool,
    wait_event_type: Option<String>,
    wait_event: Option<String>,
    wait_events_supported: bool,
}

fn session_record_from_parts(parts: SessionRowParts) -> TransactionRecord {
    let wait_detail = if parts.wait_events_supported {
        match (parts.wait_event_type, parts.wait_event) {
            (Some(category), Some(event)) => Some(WaitDetail { category, event }),
            _ => None,
        }
    } else {
        None
    };

    TransactionRecord {
        backend_id: parts.pid,
        actor: parts.usename.unwrap_or_else(|| UNKNOWN_APP.to_string()),
        origin_app: normalize_app(parts.application_name),
        origin_client: parts.client.unwrap_or_else(|| LOCAL_CLIENT.to_string()),
        statement_text: parts.query.unwrap_or_default(),
        execution_state: ExecutionState::from_db_state(&parts.state),
        elapsed: duration_from_secs(parts.elapsed_secs),
        is_waiting: parts.is_waiting,
        wait_detail,
    }
}

/// Empty application names come through as `''`, not NULL.
fn normalize_app(app: Option<String>) -> String {
    match app {
        Some(app) if !app.is_empty() => app,
        _ => UNKNOWN_APP.to_string(),
    }
}

fn duration_from_secs(secs: Option<f64>) -> Duration {
    match secs {
        Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
        _ => Duration::ZERO,
    }
}

// ---------------------------------------------------------------------------
// MockDatabase: scripted in-memory state for testing and simulation
// ---------------------------------------------------------------------------

/// An administrative call recorded by [`MockDatabase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCall {
    Cancel(i32),
    Terminate(i32),
}

#[derive(Default)]
struct MockState {
    sessions: Vec<TransactionRecord>,
    blockers: HashMap<i32, BlockerRecord>,
    cancel_results: HashMap<i32, bool>,
    terminate_results: HashMap<i32, bool>,
    calls: Vec<AdminCall>,
    fail_snapshot: bool,
}

/// In-memory database interface with scripted sessions, blockers, and
/// primitive results. Administrative calls are recorded for assertions.
#[derive(Default)]
pub struct MockDatabase {
    inner: Mutex<MockState>,
}

impl MockDatabase {
    /// Create an empty mock. Cancel/terminate default to succeeding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the snapshot set.
    pub fn push_session(&self, record: TransactionRecord) {
        self.inner.lock().expect("mock lock").sessions.push(record);
    }

    /// Script the blocker resolved for a given waiter pid.
    pub fn set_blocker(&self, waiter_pid: i32, blocker: BlockerRecord) {
        self.inner
            .lock()
            .expect("mock lock")
            .blockers
            .insert(waiter_pid, blocker);
    }

    /// Script the result of `pg_cancel_backend` for a pid.
    pub fn set_cancel_result(&self, pid: i32, accepted: bool) {
        self.inner
            .lock()
            .expect("mock lock")
            .cancel_results
            .insert(pid, accepted);
    }

    /// Script the result of `pg_terminate_backend` for a pid.
    pub fn set_terminate_result(&self, pid: i32, accepted: bool) {
        self.inner
            .lock()
            .expect("mock lock")
            .terminate_results
            .insert(pid, accepted);
    }

    /// Make the next snapshot fail (provider-unavailable).
    pub fn fail_snapshot(&self) {
        self.inner.lock().expect("mock lock").fail_snapshot = true;
    }

    /// Administrative calls recorded so far, in order.
    pub fn calls(&self) -> Vec<AdminCall> {
        self.inner.lock().expect("mock lock").calls.clone()
    }
}

impl DatabaseInterface for MockDatabase {
    // The scripted sessions are returned as-is: threshold filtering is the
    // live provider's concern, and tests script the exceeding set directly.
    fn snapshot(&self, _min_duration: Duration) -> DbFuture<'_, Vec<TransactionRecord>> {
        Box::pin(async move {
            let state = self.inner.lock().expect("mock lock");
            if state.fail_snapshot {
                return Err(Error::Runtime("mock snapshot failure".to_string()));
            }
            Ok(state.sessions.clone())
        })
    }

    fn resolve_blocker(&self, waiter_pid: i32) -> DbFuture<'_, Option<BlockerRecord>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .expect("mock lock")
                .blockers
                .get(&waiter_pid)
                .cloned())
        })
    }

    fn cancel_backend(&self, pid: i32) -> DbFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.inner.lock().expect("mock lock");
            state.calls.push(AdminCall::Cancel(pid));
            Ok(state.cancel_results.get(&pid).copied().unwrap_or(true))
        })
    }

    fn terminate_backend(&self, pid: i32) -> DbFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.inner.lock().expect("mock lock");
            state.calls.push(AdminCall::Terminate(pid));
            Ok(state.terminate_results.get(&pid).copied().unwrap_or(true))
        })
    }
}
