//! Sequence allocation.
//!
//! Sequence ids and real element ids come from durable counter rows in the
//! `counter` table. Counters only advance inside the committing write
//! transaction, so a rolled-back commit leaves no gap and a reopened database
//! resumes where it stopped.

use rusqlite::{params, Connection, OptionalExtension};
use strum::IntoEnumIterator;

use crate::error::{WaymarkError, WaymarkResult};
use crate::types::{ElementType, SequenceId};

/// A named durable counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Global commit order.
    Sequence,
    /// Real ids of one element type.
    ElementId(ElementType),
}

impl Counter {
    /// Row name in the `counter` table.
    pub fn name(&self) -> String {
        match self {
            Counter::Sequence => "sequence".to_string(),
            Counter::ElementId(element_type) => format!("element_id:{}", element_type),
        }
    }

    fn all() -> impl Iterator<Item = Counter> {
        std::iter::once(Counter::Sequence).chain(ElementType::iter().map(Counter::ElementId))
    }
}

/// Create the counter rows if missing. Existing values are left alone.
pub fn init_counters(conn: &Connection) -> WaymarkResult<()> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO counter (name, value) VALUES (?1, 0)")?;
    for counter in Counter::all() {
        stmt.execute(params![counter.name()])?;
    }
    Ok(())
}

/// Advance a counter by one and return the new value.
///
/// Must run inside the caller's write transaction.
pub fn advance(tx: &Connection, counter: Counter) -> WaymarkResult<i64> {
    tx.query_row(
        "UPDATE counter SET value = value + 1 WHERE name = ?1 RETURNING value",
        params![counter.name()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| WaymarkError::database(format!("Counter {} is missing", counter.name())))
}

/// Read a counter without advancing it.
pub fn current_value(conn: &Connection, counter: Counter) -> WaymarkResult<i64> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT value FROM counter WHERE name = ?1",
            params![counter.name()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

/// Allocate the next sequence id.
pub fn next_sequence_id(tx: &Connection) -> WaymarkResult<SequenceId> {
    let value = advance(tx, Counter::Sequence)?;
    Ok(SequenceId::new(value as u64))
}

/// Highest committed sequence id, or zero on an empty store.
pub fn current_sequence_id(conn: &Connection) -> WaymarkResult<SequenceId> {
    let value = current_value(conn, Counter::Sequence)?;
    Ok(SequenceId::new(value.max(0) as u64))
}

/// Allocate a real id for a newly created element.
pub fn next_element_id(tx: &Connection, element_type: ElementType) -> WaymarkResult<i64> {
    advance(tx, Counter::ElementId(element_type))
}
