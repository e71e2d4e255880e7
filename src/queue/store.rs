//! Durable, deduplicating task queue over SQLite with a dedicated writer
//! thread and a small read-only connection pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::events::QueueEvent;
use super::task::{OvernightTask, QueueCounts, TaskDecision, TaskFilter, TaskStatus};
use crate::error::{NightshiftError, Result};

const DEFAULT_READ_POOL_SIZE: usize = 2;
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn storage_err(msg: impl std::fmt::Display) -> NightshiftError {
    NightshiftError::Storage(msg.to_string())
}

fn storage_err_with<E: std::fmt::Display>(context: &str, err: E) -> NightshiftError {
    NightshiftError::Storage(format!("{}: {}", context, err))
}

/// Raw task row tuple:
/// (id, op_hash, status, decision, session_id, created_at, started_at,
/// completed_at, error)
type TaskRowTuple = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

enum QueueCommand {
    Enqueue {
        decision: Box<TaskDecision>,
        response: oneshot::Sender<Result<(String, bool)>>,
    },
    Dequeue {
        response: oneshot::Sender<Result<Option<OvernightTask>>>,
    },
    UpdateStatus {
        task_id: String,
        status: TaskStatus,
        error: Option<String>,
        response: oneshot::Sender<Result<()>>,
    },
    AttachSession {
        task_id: String,
        session_id: String,
        response: oneshot::Sender<Result<()>>,
    },
    Cleanup {
        older_than: DateTime<Utc>,
        response: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

struct QueueWriter {
    tx: Sender<QueueCommand>,
    handle: Option<JoinHandle<()>>,
}

impl QueueWriter {
    fn new(db_path: PathBuf, events: broadcast::Sender<QueueEvent>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<QueueCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let handle = thread::Builder::new()
            .name("queue-writer".into())
            .spawn(move || {
                let init = Self::init_db(&db_path).and_then(|conn| {
                    Self::recover_interrupted(&conn)?;
                    Ok(conn)
                });
                match init {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        Self::process_commands(&conn, rx, &events);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| storage_err_with("Failed to spawn queue writer thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| storage_err("Queue writer thread died during init"))??;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    fn sender(&self) -> Sender<QueueCommand> {
        self.tx.clone()
    }

    fn init_db(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .map_err(|e| storage_err_with("Failed to open queue database", e))?;
        conn.execute_batch(
            r"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                op_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                agent TEXT NOT NULL,
                decision TEXT NOT NULL,
                session_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_op_hash ON tasks(op_hash);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_hash
                ON tasks(op_hash) WHERE status IN ('pending', 'in_progress');

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );
            INSERT OR IGNORE INTO schema_version VALUES (1);
            ",
        )
        .map_err(|e| storage_err_with("Failed to init queue schema", e))?;
        Ok(conn)
    }

    /// Tasks left in_progress by a previous process have no session driving
    /// them any more. Hand them back to the dequeue loop so the work runs
    /// again instead of sitting behind the dedup index forever.
    fn recover_interrupted(conn: &Connection) -> Result<()> {
        let requeued = conn.execute(
            "UPDATE tasks
                SET status = 'pending', session_id = NULL, started_at = NULL
              WHERE status = 'in_progress'",
            [],
        )?;
        if requeued > 0 {
            warn!(count = requeued, "Requeued tasks interrupted by a previous shutdown");
        }
        Ok(())
    }

    fn process_commands(
        conn: &Connection,
        rx: Receiver<QueueCommand>,
        events: &broadcast::Sender<QueueEvent>,
    ) {
        for cmd in rx {
            match cmd {
                QueueCommand::Enqueue { decision, response } => {
                    let result = Self::enqueue_impl(conn, *decision);
                    let _ = response.send(publish(events, result));
                }
                QueueCommand::Dequeue { response } => {
                    let result = Self::dequeue_impl(conn);
                    let _ = response.send(publish(events, result));
                }
                QueueCommand::UpdateStatus {
                    task_id,
                    status,
                    error,
                    response,
                } => {
                    let result = Self::update_status_impl(conn, &task_id, status, error);
                    let _ = response.send(publish(events, result));
                }
                QueueCommand::AttachSession {
                    task_id,
                    session_id,
                    response,
                } => {
                    let _ = response.send(Self::attach_session_impl(conn, &task_id, &session_id));
                }
                QueueCommand::Cleanup {
                    older_than,
                    response,
                } => {
                    let result = Self::cleanup_impl(conn, older_than);
                    let _ = response.send(publish(events, result));
                }
                QueueCommand::Shutdown => {
                    debug!("Queue writer received shutdown signal");
                    break;
                }
            }
        }
    }

    fn enqueue_impl(
        conn: &Connection,
        decision: TaskDecision,
    ) -> Result<((String, bool), Option<QueueEvent>)> {
        let op_hash = decision.op_hash();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| storage_err_with("Failed to start transaction", e))?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks
                   WHERE op_hash = ?1 AND status IN ('pending', 'in_progress')
                   LIMIT 1",
                params![&op_hash],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            debug!(task_id = %id, op_hash = %op_hash, "Enqueue deduplicated against live task");
            return Ok(((id, false), None));
        }

        let task = OvernightTask::new(decision);
        tx.execute(
            "INSERT INTO tasks (id, op_hash, status, priority, agent, decision, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &task.id,
                &task.op_hash,
                task.status.as_str(),
                task.decision.priority.rank(),
                &task.decision.agent,
                serde_json::to_string(&task.decision)?,
                task.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()
            .map_err(|e| storage_err_with("Failed to commit enqueue", e))?;

        let event = QueueEvent::Enqueued {
            task_id: task.id.clone(),
            op_hash: task.op_hash.clone(),
            agent: task.decision.agent.clone(),
            priority: task.decision.priority,
        };
        Ok(((task.id, true), Some(event)))
    }

    fn dequeue_impl(conn: &Connection) -> Result<(Option<OvernightTask>, Option<QueueEvent>)> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| storage_err_with("Failed to start transaction", e))?;

        // Oldest eligible pending task: priority first, insertion order as
        // the tie-break.
        let row: Option<TaskRowTuple> = tx
            .query_row(
                "SELECT id, op_hash, status, decision, session_id,
                        created_at, started_at, completed_at, error
                   FROM tasks
                  WHERE status = 'pending'
                  ORDER BY priority ASC, seq ASC
                  LIMIT 1",
                [],
                map_task_row,
            )
            .optional()?;

        let Some(tuple) = row else {
            return Ok((None, None));
        };
        let mut task = row_to_task(tuple)?;

        let started_at = Utc::now();
        tx.execute(
            "UPDATE tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
            params![
                TaskStatus::InProgress.as_str(),
                started_at.to_rfc3339(),
                &task.id
            ],
        )?;
        tx.commit()
            .map_err(|e| storage_err_with("Failed to commit dequeue", e))?;

        task.status = TaskStatus::InProgress;
        task.started_at = Some(started_at);

        let event = QueueEvent::StatusChanged {
            task_id: task.id.clone(),
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
            error: None,
        };
        Ok((Some(task), Some(event)))
    }

    fn update_status_impl(
        conn: &Connection,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<((), Option<QueueEvent>)> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| storage_err_with("Failed to start transaction", e))?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(NightshiftError::TaskNotFound(task_id.to_string()));
        };
        let current = TaskStatus::parse(&current)
            .ok_or_else(|| storage_err(format!("unknown stored status \"{}\"", current)))?;

        if !current.can_transition_to(status) {
            let allowed = current
                .allowed_transitions()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(NightshiftError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
                allowed,
            });
        }

        // A failed task always carries a non-empty error string.
        let error = match (status, error) {
            (TaskStatus::Failed, Some(e)) if !e.trim().is_empty() => Some(e),
            (TaskStatus::Failed, _) => Some(String::from("unspecified failure")),
            (_, e) => e,
        };

        let now = Utc::now().to_rfc3339();
        if status.is_terminal() {
            tx.execute(
                "UPDATE tasks SET status = ?1, error = ?2, completed_at = ?3 WHERE id = ?4",
                params![status.as_str(), &error, now, task_id],
            )?;
        } else {
            tx.execute(
                "UPDATE tasks
                    SET status = ?1, error = ?2,
                        started_at = COALESCE(started_at, ?3)
                  WHERE id = ?4",
                params![status.as_str(), &error, now, task_id],
            )?;
        }
        tx.commit()
            .map_err(|e| storage_err_with("Failed to commit status update", e))?;

        let event = QueueEvent::StatusChanged {
            task_id: task_id.to_string(),
            from: current,
            to: status,
            error,
        };
        Ok(((), Some(event)))
    }

    fn attach_session_impl(conn: &Connection, task_id: &str, session_id: &str) -> Result<()> {
        let changed = conn.execute(
            "UPDATE tasks SET session_id = ?1 WHERE id = ?2",
            params![session_id, task_id],
        )?;
        if changed == 0 {
            return Err(NightshiftError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn cleanup_impl(
        conn: &Connection,
        older_than: DateTime<Utc>,
    ) -> Result<(u64, Option<QueueEvent>)> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| storage_err_with("Failed to start transaction", e))?;
        let removed = tx.execute(
            "DELETE FROM tasks
              WHERE status IN ('completed', 'failed', 'cancelled')
                AND completed_at IS NOT NULL
                AND completed_at < ?1",
            params![older_than.to_rfc3339()],
        )? as u64;
        tx.commit()
            .map_err(|e| storage_err_with("Failed to commit cleanup", e))?;

        let event = (removed > 0).then_some(QueueEvent::CleanedUp { removed });
        Ok((removed, event))
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(QueueCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                warn!("Queue writer thread panicked: {:?}", e);
            }
        }
    }
}

/// Publish the mutation's event (post-commit, pre-response) and unwrap the
/// payload. Publish order therefore equals commit order.
fn publish<T>(
    events: &broadcast::Sender<QueueEvent>,
    result: Result<(T, Option<QueueEvent>)>,
) -> Result<T> {
    match result {
        Ok((value, Some(event))) => {
            let _ = events.send(event);
            Ok(value)
        }
        Ok((value, None)) => Ok(value),
        Err(e) => Err(e),
    }
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRowTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn row_to_task(tuple: TaskRowTuple) -> Result<OvernightTask> {
    let (id, op_hash, status, decision, session_id, created_at, started_at, completed_at, error) =
        tuple;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| storage_err(format!("unknown stored status \"{}\"", status)))?;
    let decision: TaskDecision = serde_json::from_str(&decision)
        .map_err(|e| storage_err_with("corrupt decision payload", e))?;
    Ok(OvernightTask {
        id,
        op_hash,
        status,
        decision,
        session_id,
        created_at: parse_ts(&created_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        error,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| storage_err_with("bad stored timestamp", e))
}

struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: std::sync::atomic::AtomicUsize,
}

impl ReadPool {
    fn new(db_path: &Path, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| storage_err_with("Failed to open read connection", e))?;
            conn.pragma_update(None, "busy_timeout", 5000)
                .map_err(|e| storage_err_with("Failed to set busy_timeout", e))?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self {
            connections,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> parking_lot::MutexGuard<'_, Connection> {
        let idx =
            self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.connections.len();
        self.connections[idx].lock()
    }
}

struct QueueInner {
    writer_tx: Sender<QueueCommand>,
    read_pool: ReadPool,
    db_path: PathBuf,
    events_tx: broadcast::Sender<QueueEvent>,
    /// Holds the writer thread handle; dropped last.
    #[allow(dead_code)]
    writer: QueueWriter,
}

/// Durable task queue. Cheap to clone; all clones share one writer thread
/// and read pool.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_read_pool_size(db_path, DEFAULT_READ_POOL_SIZE)
    }

    pub fn with_read_pool_size(db_path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| storage_err_with("Failed to create state directory", e))?;
        }

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let writer = QueueWriter::new(db_path.clone(), events_tx.clone())?;
        let writer_tx = writer.sender();
        let read_pool = ReadPool::new(&db_path, pool_size.max(1))?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                writer_tx,
                read_pool,
                db_path,
                events_tx,
                writer,
            }),
        })
    }

    /// New change-event receiver. Each subscriber gets its own ordered
    /// stream starting from the moment of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    /// Create a pending task for the decision, or return the live task that
    /// already covers the same work. The `bool` is true when a new entry
    /// was created.
    pub async fn enqueue(&self, decision: TaskDecision) -> Result<(String, bool)> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Enqueue {
            decision: Box::new(decision),
            response: tx,
        })?;
        recv(rx).await
    }

    /// Atomically pick the oldest eligible pending task and mark it
    /// in_progress. Returns None when nothing is pending.
    pub async fn dequeue(&self) -> Result<Option<OvernightTask>> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Dequeue { response: tx })?;
        recv(rx).await
    }

    /// Apply a lifecycle transition. Transitions outside the lifecycle
    /// graph are rejected and leave the row unchanged.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::UpdateStatus {
            task_id: task_id.to_string(),
            status,
            error,
            response: tx,
        })?;
        recv(rx).await
    }

    pub async fn attach_session(&self, task_id: &str, session_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::AttachSession {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            response: tx,
        })?;
        recv(rx).await
    }

    /// Remove terminal tasks completed before the cutoff. Returns how many
    /// rows were deleted.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Cleanup {
            older_than,
            response: tx,
        })?;
        recv(rx).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<OvernightTask>> {
        let task_id = task_id.to_string();
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let row: Option<TaskRowTuple> = guard
                .query_row(
                    "SELECT id, op_hash, status, decision, session_id,
                            created_at, started_at, completed_at, error
                       FROM tasks WHERE id = ?1",
                    params![&task_id],
                    map_task_row,
                )
                .optional()?;
            row.map(row_to_task).transpose()
        })
        .await
        .map_err(|e| storage_err_with("Read task failed", e))?
    }

    /// Read-only query, newest first. Unset filter fields match everything.
    pub async fn all(&self, filter: TaskFilter) -> Result<Vec<OvernightTask>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let mut stmt = guard.prepare(
                "SELECT id, op_hash, status, decision, session_id,
                        created_at, started_at, completed_at, error
                   FROM tasks ORDER BY seq DESC",
            )?;
            let rows = stmt.query_map([], map_task_row)?;
            let mut tasks = Vec::new();
            for row in rows {
                let task = row_to_task(row?)?;
                if filter.matches(&task) {
                    tasks.push(task);
                }
            }
            Ok(tasks)
        })
        .await
        .map_err(|e| storage_err_with("Read tasks failed", e))?
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let mut stmt =
                guard.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            let mut counts = QueueCounts::default();
            for row in rows {
                let (status, count) = row?;
                match TaskStatus::parse(&status) {
                    Some(TaskStatus::Pending) => counts.pending = count,
                    Some(TaskStatus::InProgress) => counts.in_progress = count,
                    Some(TaskStatus::Completed) => counts.completed = count,
                    Some(TaskStatus::Failed) => counts.failed = count,
                    Some(TaskStatus::Cancelled) => counts.cancelled = count,
                    None => warn!(status = %status, "Ignoring row with unknown status"),
                }
            }
            Ok(counts)
        })
        .await
        .map_err(|e| storage_err_with("Read counts failed", e))?
    }

    fn send(&self, cmd: QueueCommand) -> Result<()> {
        self.inner
            .writer_tx
            .send(cmd)
            .map_err(|_| storage_err("Queue writer thread disconnected"))
    }
}

async fn recv<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await
        .map_err(|_| storage_err("Queue writer response channel dropped"))?
}
