//! Buffered span rows - the durable side of the span queue

use rusqlite::params;

use super::super::Database;
use crate::error::AgentResult;
use crate::telemetry::store::{RecordHandle, SpanPersistence};

impl SpanPersistence for Database {
    fn append(&self, payload: &[u8]) -> AgentResult<RecordHandle> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO buffered_spans (payload, size_bytes) VALUES (?1, ?2)",
            params![payload, payload.len() as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn read_all(&self) -> AgentResult<Vec<(RecordHandle, Vec<u8>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, payload FROM buffered_spans ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete(&self, handles: &[RecordHandle]) -> AgentResult<usize> {
        if handles.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM buffered_spans WHERE id = ?1")?;
            for handle in handles {
                deleted += stmt.execute([handle])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_oldest(&self, count: usize) -> AgentResult<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM buffered_spans WHERE id IN
                (SELECT id FROM buffered_spans ORDER BY id LIMIT ?1)",
            [count as i64],
        )?;
        Ok(deleted)
    }

    fn total_bytes_used(&self) -> AgentResult<u64> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM buffered_spans",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }
}
