use std::path::Path;

use rusqlite::{params, Connection};
use tracing::debug;

use super::Sink;
use crate::errors::Result;
use crate::event::LogEvent;

/// Stores events in a SQLite database.
///
/// ```sql
/// CREATE TABLE log_events (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     timestamp TEXT NOT NULL,
///     level TEXT NOT NULL,
///     message_template TEXT NOT NULL,
///     rendered_message TEXT NOT NULL,
///     exception TEXT NULL,
///     trace_id TEXT NULL,
///     span_id TEXT NULL,
///     properties TEXT NULL
/// );
/// ```
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened sqlite sink");
        Ok(SqliteSink { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(SqliteSink { conn: Connection::open_in_memory()? })
    }

    /// Number of stored events.
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM log_events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Rendered messages in insertion order.
    pub fn rendered_messages(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT rendered_message FROM log_events ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }
}

impl Sink for SqliteSink {
    fn create_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS log_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message_template TEXT NOT NULL,
                rendered_message TEXT NOT NULL,
                exception TEXT NULL,
                trace_id TEXT NULL,
                span_id TEXT NULL,
                properties TEXT NULL
            )",
            [],
        )?;
        self.conn.execute("CREATE INDEX IF NOT EXISTS idx_log_events_timestamp ON log_events(timestamp)", [])?;
        Ok(())
    }

    /// Inserts the whole batch in one transaction.
    fn add_batch(&self, events: &[LogEvent]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO log_events
                    (timestamp, level, message_template, rendered_message, exception, trace_id, span_id, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for event in events {
                let properties = if event.properties.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&event.properties)?)
                };
                stmt.execute(params![
                    event.timestamp.to_rfc3339(),
                    event.level.to_string(),
                    event.message_template,
                    event.render(),
                    event.exception,
                    event.trace_id,
                    event.span_id,
                    properties,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn test_connection(&self) -> bool {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;

    #[test]
    fn stores_rendered_events() {
        let sink = SqliteSink::open_in_memory().unwrap();
        sink.create_schema().unwrap();
        assert!(sink.test_connection());

        let events = vec![
            LogEvent::new(Level::Information, "Hello {Name}").with_property("Name", "world"),
            LogEvent::new(Level::Error, "Failed").with_exception("boom"),
        ];
        sink.add_batch(&events).unwrap();

        assert_eq!(sink.count().unwrap(), 2);
        assert_eq!(sink.rendered_messages().unwrap(), vec!["Hello world", "Failed"]);
        let (level, exception): (String, Option<String>) = sink
            .conn
            .query_row("SELECT level, exception FROM log_events WHERE id = 2", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(level, "Error");
        assert_eq!(exception.as_deref(), Some("boom"));
    }

    #[test]
    fn create_schema_is_repeatable_and_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.db");
        {
            let sink = SqliteSink::open(&path).unwrap();
            sink.create_schema().unwrap();
            sink.add_batch(&[LogEvent::new(Level::Warning, "kept")]).unwrap();
        }
        let sink = SqliteSink::open(&path).unwrap();
        sink.create_schema().unwrap();
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn batch_without_schema_fails() {
        let sink = SqliteSink::open_in_memory().unwrap();
        assert!(sink.add_batch(&[LogEvent::new(Level::Debug, "x")]).is_err());
    }
}
