//! Timestamp index over the Messages table. The index is implicit: the
//! `start_timestamp` column is indexed, so range lookups are single scans.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use memoir_core::{
    DateRange, MemoirError, MessageOrdinal, TextRange, TimestampToTextRangeIndex,
    TimestampedTextRange,
};

use crate::memory::timestamp_index::{parse_timestamp, sortable_timestamp};

/// Validate and normalize an optional timestamp for storage.
pub fn normalize_optional_timestamp(timestamp: Option<&str>) -> Result<Option<String>> {
    match timestamp {
        None => Ok(None),
        Some("") => Ok(None),
        Some(raw) => Ok(Some(sortable_timestamp(parse_timestamp(raw)?))),
    }
}

pub struct SqliteTimestampIndex {
    pool: SqlitePool,
}

impl SqliteTimestampIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimestampToTextRangeIndex for SqliteTimestampIndex {
    async fn size(&self) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM Messages WHERE start_timestamp IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn add_timestamp(
        &self,
        message_ordinal: MessageOrdinal,
        timestamp: &str,
    ) -> Result<bool> {
        if timestamp.is_empty() {
            return Ok(false);
        }
        let normalized = sortable_timestamp(parse_timestamp(timestamp)?);
        let result = sqlx::query("UPDATE Messages SET start_timestamp = ? WHERE msg_id = ?")
            .bind(&normalized)
            .bind(message_ordinal as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MemoirError::integrity(format!(
                "message ordinal {message_ordinal} not found for timestamp"
            ))
            .into());
        }
        Ok(true)
    }

    async fn add_timestamps(&self, entries: &[(MessageOrdinal, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (ordinal, timestamp) in entries {
            if timestamp.is_empty() {
                continue;
            }
            let normalized = sortable_timestamp(parse_timestamp(timestamp)?);
            sqlx::query("UPDATE Messages SET start_timestamp = ? WHERE msg_id = ?")
                .bind(&normalized)
                .bind(*ordinal as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn lookup_range(&self, date_range: &DateRange) -> Result<Vec<TimestampedTextRange>> {
        let start = sortable_timestamp(date_range.start);
        let rows = match date_range.end {
            // Point query: exact equality with the start timestamp.
            None => {
                sqlx::query(
                    r#"SELECT msg_id, start_timestamp FROM Messages
                       WHERE start_timestamp = ? ORDER BY start_timestamp, msg_id"#,
                )
                .bind(&start)
                .fetch_all(&self.pool)
                .await?
            }
            Some(end) => {
                sqlx::query(
                    r#"SELECT msg_id, start_timestamp FROM Messages
                       WHERE start_timestamp >= ? AND start_timestamp < ?
                       ORDER BY start_timestamp, msg_id"#,
                )
                .bind(&start)
                .bind(sortable_timestamp(end))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| TimestampedTextRange {
                timestamp: row.get("start_timestamp"),
                range: TextRange::from_message_chunk(row.get::<i64, _>("msg_id") as usize, 0),
            })
            .collect())
    }
}
