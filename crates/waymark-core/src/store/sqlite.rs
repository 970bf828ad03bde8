//! SQLite-backed element version store.
//!
//! Rows are append-only. The only in-place write is setting
//! `next_sequence_id` on the version a commit supersedes. Members are kept
//! twice: as JSON on the row for reads, and in `element_member` for reverse
//! (parent) lookups.
//!
//! File-backed stores run in WAL mode with one writer connection and a set of
//! read-only connections, so reads see the last committed state while a
//! commit is in progress. In-memory stores have a single connection.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};

use crate::config::EngineConfig;
use crate::error::{ErrorCode, WaymarkError, WaymarkResult};
use crate::sequence;
use crate::traits::{CommitPlan, CommitReceipt, ElementStore, VersionQuery};
use crate::types::{
    DiffAction, DiffResultEntry, ElementMember, ElementRef, ElementType, ElementVersion, Point,
    SequenceId, VersionedElementRef,
};

/// Refs per `VALUES` chunk. Each ref binds up to four parameters.
const REF_CHUNK_SIZE: usize = 500;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_READ_CONNECTIONS: usize = 4;

const COLUMNS: &str = "e.sequence_id, e.type, e.id, e.version, e.next_sequence_id, e.visible, \
                       e.changeset_id, e.tags, e.members, e.lon, e.lat, e.created_at";

/// SQLite-backed element store.
pub struct SqliteElementStore {
    writer: Arc<Mutex<Connection>>,
    /// Empty when reads share the writer.
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: AtomicUsize,
}

impl SqliteElementStore {
    /// Open or create a database file.
    pub fn new<P: AsRef<Path>>(path: P) -> WaymarkResult<Self> {
        Self::open_file(path.as_ref(), DEFAULT_BUSY_TIMEOUT, DEFAULT_READ_CONNECTIONS)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> WaymarkResult<Self> {
        Self::open_memory(DEFAULT_BUSY_TIMEOUT)
    }

    /// Open the store described by an engine configuration.
    pub fn open(config: &EngineConfig) -> WaymarkResult<Self> {
        match &config.database_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Self::open_file(path, config.busy_timeout(), config.read_connections)
            }
            None => Self::open_memory(config.busy_timeout()),
        }
    }

    fn open_memory(busy_timeout: Duration) -> WaymarkResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(busy_timeout)?;
        init_schema(&conn)?;
        Ok(Self::from_connections(conn, Vec::new()))
    }

    fn open_file(path: &Path, busy_timeout: Duration, read_connections: usize) -> WaymarkResult<Self> {
        let writer = Connection::open(path)?;
        writer.busy_timeout(busy_timeout)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        // Readers open read-only, so the schema has to exist first.
        init_schema(&writer)?;

        let readers = (0..read_connections)
            .map(|_| -> WaymarkResult<Connection> {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(busy_timeout)?;
                Ok(conn)
            })
            .collect::<WaymarkResult<Vec<_>>>()?;

        tracing::debug!(
            path = %path.display(),
            readers = readers.len(),
            "Opened element store file"
        );
        Ok(Self::from_connections(writer, readers))
    }

    fn from_connections(writer: Connection, readers: Vec<Connection>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers.into_iter().map(Mutex::new).collect()),
            next_reader: AtomicUsize::new(0),
        }
    }

    /// Run blocking work on the writer connection off the async runtime.
    async fn with_writer<T, F>(&self, f: F) -> WaymarkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> WaymarkResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| WaymarkError::database(e.to_string()))?;
            f(&mut guard)
        })
        .await?
    }

    /// Run a read on the next reader connection, or on the writer when there
    /// are no readers.
    async fn with_reader<T, F>(&self, f: F) -> WaymarkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> WaymarkResult<T> + Send + 'static,
    {
        if self.readers.is_empty() {
            return self.with_writer(move |conn| f(conn)).await;
        }
        let readers = Arc::clone(&self.readers);
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let guard = readers[index]
                .lock()
                .map_err(|e| WaymarkError::database(e.to_string()))?;
            f(&guard)
        })
        .await?
    }
}

/// Create tables, indexes and counter rows if missing.
fn init_schema(conn: &Connection) -> WaymarkResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS element (
            sequence_id INTEGER PRIMARY KEY,
            type TEXT NOT NULL,
            id INTEGER NOT NULL,
            version INTEGER NOT NULL,
            next_sequence_id INTEGER,
            visible INTEGER NOT NULL,
            changeset_id INTEGER NOT NULL,
            tags TEXT NOT NULL,
            members TEXT NOT NULL,
            lon REAL,
            lat REAL,
            created_at TEXT NOT NULL,
            UNIQUE (type, id, version)
        );

        CREATE INDEX IF NOT EXISTS idx_element_ref_sequence ON element(type, id, sequence_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_element_current
            ON element(type, id) WHERE next_sequence_id IS NULL;

        -- Reverse member index for parent lookups
        CREATE TABLE IF NOT EXISTS element_member (
            sequence_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            type TEXT NOT NULL,
            id INTEGER NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY (sequence_id, position)
        );

        CREATE INDEX IF NOT EXISTS idx_element_member_ref ON element_member(type, id, sequence_id);

        CREATE TABLE IF NOT EXISTS counter (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        ",
    )?;
    sequence::init_counters(conn)?;

    tracing::debug!("Element store schema ready");
    Ok(())
}

#[async_trait]
impl ElementStore for SqliteElementStore {
    async fn current_sequence_id(&self) -> WaymarkResult<SequenceId> {
        self.with_reader(|conn| sequence::current_sequence_id(conn))
            .await
    }

    async fn get_by_refs(
        &self,
        refs: &[ElementRef],
        at: SequenceId,
        recurse_ways: bool,
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        let refs = dedupe(refs.iter().copied());
        self.with_reader(move |conn| {
            let mut elements = select_current(conn, &refs, at, limit)?;

            if recurse_ways && !limit_reached(elements.len(), limit) {
                let seen: HashSet<ElementRef> = elements.iter().map(|e| e.element_ref()).collect();
                let nodes = dedupe(
                    elements
                        .iter()
                        .filter(|e| e.element_type == ElementType::Way)
                        .flat_map(|e| e.member_refs())
                        .filter(|r| !seen.contains(r)),
                );
                let remaining = limit.map(|l| l - elements.len());
                elements.extend(select_current(conn, &nodes, at, remaining)?);
            }
            Ok(elements)
        })
        .await
    }

    async fn get_by_versioned_refs(
        &self,
        refs: &[VersionedElementRef],
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        let refs = dedupe(refs.iter().copied());
        self.with_reader(move |conn| {
            let mut elements = Vec::new();
            for chunk in refs.chunks(REF_CHUNK_SIZE) {
                let mut values = Vec::with_capacity(chunk.len() * 4);
                let rows = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        values.push(Value::Integer(i as i64));
                        values.push(Value::Text(r.element_type.as_str().to_string()));
                        values.push(Value::Integer(r.id));
                        values.push(Value::Integer(i64::from(r.version)));
                        let base = i * 4;
                        format!("(?{}, ?{}, ?{}, ?{})", base + 1, base + 2, base + 3, base + 4)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "WITH refs(position, type, id, version) AS (VALUES {rows})
                     SELECT {COLUMNS} FROM refs r
                     JOIN element e ON e.type = r.type AND e.id = r.id AND e.version = r.version
                     ORDER BY r.position"
                );
                let mut stmt = conn.prepare(&sql)?;
                let found = stmt
                    .query_map(params_from_iter(values.iter()), row_to_element)?
                    .collect::<Result<Vec<_>, _>>()?;
                elements.extend(found);
                if limit_reached(elements.len(), limit) {
                    break;
                }
            }
            truncate(&mut elements, limit);
            Ok(elements)
        })
        .await
    }

    async fn get_versions(
        &self,
        element: ElementRef,
        at: SequenceId,
        query: VersionQuery,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.with_reader(move |conn| {
            let order = if query.ascending { "ASC" } else { "DESC" };
            let sql = format!(
                "SELECT {COLUMNS} FROM element e
                 WHERE e.type = ?1 AND e.id = ?2 AND e.sequence_id <= ?3
                   AND (?4 IS NULL OR e.version >= ?4)
                   AND (?5 IS NULL OR e.version <= ?5)
                 ORDER BY e.version {order}
                 LIMIT ?6"
            );
            let limit = query.limit.map_or(-1, |l| l as i64);
            let mut stmt = conn.prepare(&sql)?;
            let versions = stmt
                .query_map(
                    params![
                        element.element_type.as_str(),
                        element.id,
                        seq_param(at),
                        query.min_version,
                        query.max_version,
                        limit
                    ],
                    row_to_element,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
        .await
    }

    async fn get_current_version(
        &self,
        element: ElementRef,
        at: SequenceId,
    ) -> WaymarkResult<u32> {
        self.with_reader(move |conn| {
            let version: Option<u32> = conn
                .query_row(
                    "SELECT version FROM element
                     WHERE type = ?1 AND id = ?2 AND sequence_id <= ?3
                     ORDER BY sequence_id DESC LIMIT 1",
                    params![element.element_type.as_str(), element.id, seq_param(at)],
                    |row| row.get(0),
                )
                .optional()?;
            version.ok_or_else(|| WaymarkError::not_found(element))
        })
        .await
    }

    async fn get_many_parents(
        &self,
        refs: &[ElementRef],
        at: SequenceId,
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        let refs = dedupe(refs.iter().copied());
        self.with_reader(move |conn| {
            let mut seen = HashSet::new();
            let mut parents = Vec::new();
            for chunk in refs.chunks(REF_CHUNK_SIZE) {
                let (cte, mut values) = refs_cte(chunk, 2);
                values.insert(0, Value::Integer(seq_param(at)));
                let sql = format!(
                    "WITH refs(type, id) AS (VALUES {cte})
                     SELECT {COLUMNS} FROM element e
                     WHERE e.sequence_id IN (
                         SELECT m.sequence_id FROM element_member m
                         JOIN refs r ON m.type = r.type AND m.id = r.id
                         WHERE m.sequence_id <= ?1
                     )
                       AND (e.next_sequence_id IS NULL OR e.next_sequence_id > ?1)
                       AND e.visible = 1
                     ORDER BY e.sequence_id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values.iter()), row_to_element)?;
                for row in rows {
                    let parent = row?;
                    if seen.insert(parent.sequence_id) {
                        parents.push(parent);
                    }
                }
                if limit_reached(parents.len(), limit) {
                    break;
                }
            }
            truncate(&mut parents, limit);
            Ok(parents)
        })
        .await
    }

    async fn commit(&self, plan: CommitPlan) -> WaymarkResult<CommitReceipt> {
        self.with_writer(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(changed) = first_changed(&tx, plan.snapshot, &plan.read_set)? {
                return Err(WaymarkError::stale_snapshot(format!(
                    "Element {} changed after sequence {}",
                    changed, plan.snapshot
                )));
            }
            if let Some(parent) = first_new_parent(&tx, plan.snapshot, &plan.deleted)? {
                return Err(WaymarkError::stale_snapshot(format!(
                    "Element {} gained a member to be deleted after sequence {}",
                    parent, plan.snapshot
                )));
            }

            let committed_at = Utc::now();
            let mut assigned: HashMap<ElementRef, ElementRef> = HashMap::new();
            let mut entries = Vec::with_capacity(plan.writes.len());

            for write in &plan.writes {
                let element_ref = if write.action == DiffAction::Create {
                    let id = sequence::next_element_id(&tx, write.element_ref.element_type)?;
                    let real = ElementRef::new(write.element_ref.element_type, id);
                    assigned.insert(write.element_ref, real);
                    real
                } else {
                    resolve_placeholder(write.element_ref, &assigned)?
                };
                let members = write
                    .members
                    .iter()
                    .map(|m| {
                        Ok(ElementMember {
                            element_ref: resolve_placeholder(m.element_ref, &assigned)?,
                            role: m.role.clone(),
                        })
                    })
                    .collect::<WaymarkResult<Vec<_>>>()?;

                let sequence_id = sequence::next_sequence_id(&tx)?;

                if write.has_predecessor() {
                    let superseded = tx.execute(
                        "UPDATE element SET next_sequence_id = ?1
                         WHERE type = ?2 AND id = ?3 AND version = ?4 AND next_sequence_id IS NULL",
                        params![
                            seq_param(sequence_id),
                            element_ref.element_type.as_str(),
                            element_ref.id,
                            write.version - 1
                        ],
                    )?;
                    if superseded != 1 {
                        return Err(WaymarkError::stale_snapshot(format!(
                            "Version {} of {} is no longer current",
                            write.version - 1,
                            element_ref
                        )));
                    }
                }

                tx.execute(
                    "INSERT INTO element (sequence_id, type, id, version, next_sequence_id, visible,
                                          changeset_id, tags, members, lon, lat, created_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        seq_param(sequence_id),
                        element_ref.element_type.as_str(),
                        element_ref.id,
                        write.version,
                        write.visible,
                        plan.changeset_id,
                        serde_json::to_string(&write.tags)?,
                        serde_json::to_string(&members)?,
                        write.point.map(|p| p.lon),
                        write.point.map(|p| p.lat),
                        committed_at.to_rfc3339(),
                    ],
                )?;

                let mut member_stmt = tx.prepare_cached(
                    "INSERT INTO element_member (sequence_id, position, type, id, role)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, member) in members.iter().enumerate() {
                    member_stmt.execute(params![
                        seq_param(sequence_id),
                        position as i64,
                        member.element_ref.element_type.as_str(),
                        member.element_ref.id,
                        member.role,
                    ])?;
                }
                drop(member_stmt);

                entries.push(DiffResultEntry {
                    action: write.action,
                    old_ref: write.element_ref,
                    new_ref: element_ref,
                    new_version: write.version,
                    sequence_id,
                });
            }

            tx.commit()?;

            tracing::debug!(
                changeset_id = plan.changeset_id,
                rows = entries.len(),
                last_sequence_id = entries.last().map(|e| e.sequence_id.value()),
                "Committed element versions"
            );
            Ok(CommitReceipt {
                entries,
                committed_at,
            })
        })
        .await
    }
}

/// Rows current as of `at`, in the order of `refs`.
fn select_current(
    conn: &Connection,
    refs: &[ElementRef],
    at: SequenceId,
    limit: Option<usize>,
) -> WaymarkResult<Vec<ElementVersion>> {
    let mut elements = Vec::new();
    for chunk in refs.chunks(REF_CHUNK_SIZE) {
        let mut values = vec![Value::Integer(seq_param(at))];
        let rows = chunk
            .iter()
            .enumerate()
            .map(|(i, r)| {
                values.push(Value::Integer(i as i64));
                values.push(Value::Text(r.element_type.as_str().to_string()));
                values.push(Value::Integer(r.id));
                let base = 2 + i * 3;
                format!("(?{}, ?{}, ?{})", base, base + 1, base + 2)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "WITH refs(position, type, id) AS (VALUES {rows})
             SELECT {COLUMNS} FROM refs r
             JOIN element e ON e.type = r.type AND e.id = r.id
             WHERE e.sequence_id <= ?1
               AND (e.next_sequence_id IS NULL OR e.next_sequence_id > ?1)
             ORDER BY r.position"
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(values.iter()), row_to_element)?
            .collect::<Result<Vec<_>, _>>()?;
        elements.extend(found);
        if limit_reached(elements.len(), limit) {
            break;
        }
    }
    truncate(&mut elements, limit);
    Ok(elements)
}

/// First read-set element with a row committed after `snapshot`.
fn first_changed(
    conn: &Connection,
    snapshot: SequenceId,
    refs: &[ElementRef],
) -> WaymarkResult<Option<ElementRef>> {
    for chunk in refs.chunks(REF_CHUNK_SIZE) {
        let (cte, mut values) = refs_cte(chunk, 2);
        values.insert(0, Value::Integer(seq_param(snapshot)));
        let sql = format!(
            "WITH refs(type, id) AS (VALUES {cte})
             SELECT e.type, e.id FROM refs r
             JOIN element e ON e.type = r.type AND e.id = r.id
             WHERE e.sequence_id > ?1
             LIMIT 1"
        );
        let found = conn
            .query_row(&sql, params_from_iter(values.iter()), row_to_ref)
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// First visible element committed after `snapshot` that lists any of `refs`.
fn first_new_parent(
    conn: &Connection,
    snapshot: SequenceId,
    refs: &[ElementRef],
) -> WaymarkResult<Option<ElementRef>> {
    for chunk in refs.chunks(REF_CHUNK_SIZE) {
        let (cte, mut values) = refs_cte(chunk, 2);
        values.insert(0, Value::Integer(seq_param(snapshot)));
        let sql = format!(
            "WITH refs(type, id) AS (VALUES {cte})
             SELECT e.type, e.id FROM element_member m
             JOIN refs r ON m.type = r.type AND m.id = r.id
             JOIN element e ON e.sequence_id = m.sequence_id
             WHERE m.sequence_id > ?1 AND e.visible = 1
             LIMIT 1"
        );
        let found = conn
            .query_row(&sql, params_from_iter(values.iter()), row_to_ref)
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// `(?n, ?n+1), ...` rows for a `refs(type, id)` CTE, numbered from `first`.
fn refs_cte(refs: &[ElementRef], first: usize) -> (String, Vec<Value>) {
    let mut values = Vec::with_capacity(refs.len() * 2);
    let rows = refs
        .iter()
        .enumerate()
        .map(|(i, r)| {
            values.push(Value::Text(r.element_type.as_str().to_string()));
            values.push(Value::Integer(r.id));
            let base = first + i * 2;
            format!("(?{}, ?{})", base, base + 1)
        })
        .collect::<Vec<_>>()
        .join(", ");
    (rows, values)
}

fn resolve_placeholder(
    element_ref: ElementRef,
    assigned: &HashMap<ElementRef, ElementRef>,
) -> WaymarkResult<ElementRef> {
    if !element_ref.is_placeholder() {
        return Ok(element_ref);
    }
    assigned.get(&element_ref).copied().ok_or_else(|| {
        WaymarkError::invalid_element(
            ErrorCode::ValBadPlaceholder,
            element_ref,
            format!("Placeholder {} is not created earlier in the batch", element_ref),
        )
    })
}

fn seq_param(sequence_id: SequenceId) -> i64 {
    i64::try_from(sequence_id.value()).unwrap_or(i64::MAX)
}

fn limit_reached(len: usize, limit: Option<usize>) -> bool {
    limit.is_some_and(|l| len >= l)
}

fn truncate<T>(items: &mut Vec<T>, limit: Option<usize>) {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
}

fn dedupe<T: Copy + Eq + std::hash::Hash>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(*item)).collect()
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn row_to_ref(row: &Row<'_>) -> rusqlite::Result<ElementRef> {
    let element_type: String = row.get(0)?;
    let element_type = ElementType::from_str(&element_type).map_err(|e| conversion_error(0, e))?;
    Ok(ElementRef::new(element_type, row.get(1)?))
}

fn row_to_element(row: &Row<'_>) -> rusqlite::Result<ElementVersion> {
    let sequence_id: i64 = row.get(0)?;
    let element_type: String = row.get(1)?;
    let next_sequence_id: Option<i64> = row.get(4)?;
    let tags: String = row.get(7)?;
    let members: String = row.get(8)?;
    let lon: Option<f64> = row.get(9)?;
    let lat: Option<f64> = row.get(10)?;
    let created_at: String = row.get(11)?;

    Ok(ElementVersion {
        element_type: ElementType::from_str(&element_type).map_err(|e| conversion_error(1, e))?,
        id: row.get(2)?,
        version: row.get(3)?,
        sequence_id: SequenceId::new(sequence_id as u64),
        next_sequence_id: next_sequence_id.map(|s| SequenceId::new(s as u64)),
        visible: row.get(5)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(7, e))?,
        members: serde_json::from_str(&members).map_err(|e| conversion_error(8, e))?,
        changeset_id: row.get(6)?,
        point: lon.zip(lat).map(|(lon, lat)| Point::new(lon, lat)),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(11, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::PlannedWrite;
    use std::collections::BTreeMap;

    fn write(
        action: DiffAction,
        element_ref: ElementRef,
        version: u32,
        members: Vec<ElementRef>,
    ) -> PlannedWrite {
        PlannedWrite {
            action,
            element_ref,
            version,
            visible: action != DiffAction::Delete,
            tags: BTreeMap::new(),
            members: members.into_iter().map(ElementMember::new).collect(),
            point: (element_ref.element_type == ElementType::Node && action != DiffAction::Delete)
                .then(|| Point::new(1.0, 2.0)),
        }
    }

    fn plan(snapshot: SequenceId, writes: Vec<PlannedWrite>) -> CommitPlan {
        CommitPlan {
            snapshot,
            changeset_id: 1,
            writes,
            read_set: Vec::new(),
            deleted: Vec::new(),
        }
    }

    async fn seed_way(store: &SqliteElementStore) -> CommitReceipt {
        store
            .commit(plan(
                SequenceId::ZERO,
                vec![
                    write(DiffAction::Create, ElementRef::node(-1), 1, vec![]),
                    write(DiffAction::Create, ElementRef::node(-2), 1, vec![]),
                    write(
                        DiffAction::Create,
                        ElementRef::way(-1),
                        1,
                        vec![ElementRef::node(-1), ElementRef::node(-2)],
                    ),
                ],
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_assigns_ids_and_sequences() {
        let store = SqliteElementStore::in_memory().unwrap();
        let receipt = seed_way(&store).await;

        let refs: Vec<_> = receipt.entries.iter().map(|e| e.new_ref).collect();
        assert_eq!(
            refs,
            vec![ElementRef::node(1), ElementRef::node(2), ElementRef::way(1)]
        );
        let seqs: Vec<_> = receipt.entries.iter().map(|e| e.sequence_id.value()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.current_sequence_id().await.unwrap(), SequenceId::new(3));

        let way = store
            .get_by_refs(&[ElementRef::way(1)], SequenceId::new(3), false, None)
            .await
            .unwrap();
        assert_eq!(
            way[0].member_refs().collect::<Vec<_>>(),
            vec![ElementRef::node(1), ElementRef::node(2)]
        );
    }

    #[tokio::test]
    async fn test_reads_respect_sequence_point() {
        let store = SqliteElementStore::in_memory().unwrap();
        seed_way(&store).await;

        let before = store
            .get_by_refs(&[ElementRef::node(2)], SequenceId::new(1), false, None)
            .await
            .unwrap();
        assert!(before.is_empty());

        store
            .commit(CommitPlan {
                read_set: vec![ElementRef::node(1)],
                ..plan(
                    SequenceId::new(3),
                    vec![write(DiffAction::Modify, ElementRef::node(1), 2, vec![])],
                )
            })
            .await
            .unwrap();

        let old = store
            .get_by_refs(&[ElementRef::node(1)], SequenceId::new(3), false, None)
            .await
            .unwrap();
        assert_eq!(old[0].version, 1);
        assert_eq!(old[0].next_sequence_id, Some(SequenceId::new(4)));

        let new = store
            .get_by_refs(&[ElementRef::node(1)], SequenceId::new(4), false, None)
            .await
            .unwrap();
        assert_eq!(new[0].version, 2);
        assert!(new[0].is_current());
    }

    #[tokio::test]
    async fn test_recurse_ways_appends_member_nodes() {
        let store = SqliteElementStore::in_memory().unwrap();
        seed_way(&store).await;
        let at = SequenceId::new(3);

        let rows = store
            .get_by_refs(&[ElementRef::way(1)], at, true, None)
            .await
            .unwrap();
        let refs: Vec<_> = rows.iter().map(|e| e.element_ref()).collect();
        assert_eq!(
            refs,
            vec![ElementRef::way(1), ElementRef::node(1), ElementRef::node(2)]
        );

        let limited = store
            .get_by_refs(&[ElementRef::way(1)], at, true, Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_versions_and_current_version() {
        let store = SqliteElementStore::in_memory().unwrap();
        seed_way(&store).await;
        for (snapshot, version) in [(3, 2), (4, 3)] {
            store
                .commit(plan(
                    SequenceId::new(snapshot),
                    vec![write(DiffAction::Modify, ElementRef::node(1), version, vec![])],
                ))
                .await
                .unwrap();
        }
        let at = store.current_sequence_id().await.unwrap();

        let newest = store
            .get_versions(ElementRef::node(1), at, VersionQuery::newest_first())
            .await
            .unwrap();
        assert_eq!(newest.iter().map(|e| e.version).collect::<Vec<_>>(), vec![3, 2, 1]);

        let ranged = store
            .get_versions(
                ElementRef::node(1),
                at,
                VersionQuery::oldest_first().with_range(2, 3).with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].version, 2);

        assert_eq!(
            store
                .get_current_version(ElementRef::node(1), SequenceId::new(4))
                .await
                .unwrap(),
            2
        );
        assert!(matches!(
            store
                .get_current_version(ElementRef::node(9), at)
                .await,
            Err(WaymarkError::NotFound { .. })
        ));

        let exact = store
            .get_by_versioned_refs(
                &[
                    ElementRef::node(1).with_version(2),
                    ElementRef::node(1).with_version(9),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].version, 2);
    }

    #[tokio::test]
    async fn test_parents_follow_visibility() {
        let store = SqliteElementStore::in_memory().unwrap();
        seed_way(&store).await;

        let parents = store
            .get_many_parents(&[ElementRef::node(1), ElementRef::node(2)], SequenceId::new(3), None)
            .await
            .unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].element_ref(), ElementRef::way(1));

        store
            .commit(plan(
                SequenceId::new(3),
                vec![write(DiffAction::Delete, ElementRef::way(1), 2, vec![])],
            ))
            .await
            .unwrap();

        let after = store
            .get_many_parents(&[ElementRef::node(1)], SequenceId::new(4), None)
            .await
            .unwrap();
        assert!(after.is_empty());
        let before = store
            .get_many_parents(&[ElementRef::node(1)], SequenceId::new(3), None)
            .await
            .unwrap();
        assert_eq!(before.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_read_set() {
        let store = SqliteElementStore::in_memory().unwrap();
        seed_way(&store).await;
        store
            .commit(plan(
                SequenceId::new(3),
                vec![write(DiffAction::Modify, ElementRef::node(1), 2, vec![])],
            ))
            .await
            .unwrap();

        let err = store
            .commit(CommitPlan {
                read_set: vec![ElementRef::node(1)],
                ..plan(
                    SequenceId::new(3),
                    vec![write(DiffAction::Modify, ElementRef::node(1), 2, vec![])],
                )
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.current_sequence_id().await.unwrap(), SequenceId::new(4));
    }

    #[tokio::test]
    async fn test_commit_rejects_new_parent_of_deleted() {
        let store = SqliteElementStore::in_memory().unwrap();
        seed_way(&store).await;

        let err = store
            .commit(CommitPlan {
                deleted: vec![ElementRef::node(1)],
                ..plan(
                    SequenceId::new(1),
                    vec![write(DiffAction::Delete, ElementRef::node(1), 2, vec![])],
                )
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DiffStaleSnapshot);
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let store = SqliteElementStore::in_memory().unwrap();
        let err = store
            .commit(plan(
                SequenceId::ZERO,
                vec![
                    write(DiffAction::Create, ElementRef::node(-1), 1, vec![]),
                    write(
                        DiffAction::Create,
                        ElementRef::way(-1),
                        1,
                        vec![ElementRef::node(-7)],
                    ),
                ],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValBadPlaceholder);
        assert_eq!(store.current_sequence_id().await.unwrap(), SequenceId::ZERO);
        let rows = store
            .get_by_refs(&[ElementRef::node(1)], SequenceId::new(10), false, None)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waymark.db");
        {
            let store = SqliteElementStore::new(&path).unwrap();
            seed_way(&store).await;
        }
        let store = SqliteElementStore::new(&path).unwrap();
        assert_eq!(store.current_sequence_id().await.unwrap(), SequenceId::new(3));

        let receipt = store
            .commit(plan(
                SequenceId::new(3),
                vec![write(DiffAction::Create, ElementRef::node(-1), 1, vec![])],
            ))
            .await
            .unwrap();
        assert_eq!(receipt.entries[0].new_ref, ElementRef::node(3));
        assert_eq!(receipt.entries[0].sequence_id, SequenceId::new(4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_do_not_wait_for_a_commit_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waymark.db");
        let config = EngineConfig::builder()
            .database_path(&path)
            .busy_timeout_ms(10_000)
            .build();
        let store = Arc::new(SqliteElementStore::open(&config).unwrap());
        seed_way(&store).await;
        let before = store.current_sequence_id().await.unwrap();

        // Hold the database write lock from a second connection so the
        // commit below stalls while owning the store's writer.
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let committing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .commit(plan(
                        before,
                        vec![write(DiffAction::Create, ElementRef::node(-1), 1, vec![])],
                    ))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!committing.is_finished());

        let seen = tokio::time::timeout(Duration::from_millis(500), store.current_sequence_id())
            .await
            .expect("read waited for the writer")
            .unwrap();
        assert_eq!(seen, before);
        let rows = tokio::time::timeout(
            Duration::from_millis(500),
            store.get_by_refs(&[ElementRef::node(1), ElementRef::node(3)], seen, false, None),
        )
        .await
        .expect("read waited for the writer")
        .unwrap();
        assert_eq!(rows.len(), 1);

        blocker.execute_batch("ROLLBACK").unwrap();
        let receipt = committing.await.unwrap().unwrap();
        let after = SequenceId::new(before.value() + 1);
        assert_eq!(receipt.entries[0].sequence_id, after);
        assert_eq!(store.current_sequence_id().await.unwrap(), after);
    }

    #[tokio::test]
    async fn test_in_memory_store_reads_through_writer() {
        let store = SqliteElementStore::in_memory().unwrap();
        assert!(store.readers.is_empty());
        seed_way(&store).await;
        assert_eq!(store.current_sequence_id().await.unwrap(), SequenceId::new(3));
    }
}
