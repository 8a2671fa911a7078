//! In-memory timestamp index over messages, sorted for range scans.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use memoir_core::{
    DateRange, MemoirError, MessageOrdinal, TextRange, TimestampToTextRangeIndex,
    TimestampedTextRange,
};

/// Format a datetime so lexicographic order equals chronological order.
/// Fixed sub-second precision keeps the strings uniformly comparable.
pub fn sortable_timestamp(datetime: DateTime<Utc>) -> String {
    datetime.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a message timestamp, normalizing to UTC.
pub fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            MemoirError::invalid_input(format!("invalid timestamp {timestamp:?}: {e}")).into()
        })
}

#[derive(Default)]
pub struct MemoryTimestampIndex {
    // Kept sorted ascending by timestamp.
    ranges: RwLock<Vec<TimestampedTextRange>>,
}

impl MemoryTimestampIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        ranges: &mut Vec<TimestampedTextRange>,
        message_ordinal: MessageOrdinal,
        timestamp: &str,
        in_order: bool,
    ) -> Result<bool> {
        if timestamp.is_empty() {
            return Ok(false);
        }
        let entry = TimestampedTextRange {
            timestamp: sortable_timestamp(parse_timestamp(timestamp)?),
            range: TextRange::from_message_chunk(message_ordinal, 0),
        };
        if in_order {
            let at = ranges.partition_point(|r| r.timestamp < entry.timestamp);
            ranges.insert(at, entry);
        } else {
            ranges.push(entry);
        }
        Ok(true)
    }
}

#[async_trait]
impl TimestampToTextRangeIndex for MemoryTimestampIndex {
    async fn size(&self) -> Result<usize> {
        Ok(self.ranges.read().unwrap().len())
    }

    async fn add_timestamp(
        &self,
        message_ordinal: MessageOrdinal,
        timestamp: &str,
    ) -> Result<bool> {
        let mut ranges = self.ranges.write().unwrap();
        Self::insert(&mut ranges, message_ordinal, timestamp, true)
    }

    async fn add_timestamps(&self, entries: &[(MessageOrdinal, String)]) -> Result<()> {
        let mut ranges = self.ranges.write().unwrap();
        for (ordinal, timestamp) in entries {
            Self::insert(&mut ranges, *ordinal, timestamp, false)?;
        }
        ranges.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(())
    }

    async fn lookup_range(&self, date_range: &DateRange) -> Result<Vec<TimestampedTextRange>> {
        let start = sortable_timestamp(date_range.start);
        let ranges = self.ranges.read().unwrap();
        let from = ranges.partition_point(|r| r.timestamp < start);
        let result = match date_range.end {
            // Point query: only entries whose timestamp equals start exactly.
            None => ranges[from..]
                .iter()
                .take_while(|r| r.timestamp == start)
                .cloned()
                .collect(),
            Some(end) => {
                let stop = sortable_timestamp(end);
                ranges[from..]
                    .iter()
                    .take_while(|r| r.timestamp < stop)
                    .cloned()
                    .collect()
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    async fn filled() -> MemoryTimestampIndex {
        let index = MemoryTimestampIndex::new();
        let entries: Vec<(usize, String)> = (0..5)
            .map(|i| (i, at(i as u32).to_rfc3339()))
            .collect();
        index.add_timestamps(&entries).await.unwrap();
        index
    }

    #[tokio::test]
    async fn range_is_start_inclusive_end_exclusive() {
        let index = filled().await;
        let hits = index
            .lookup_range(&DateRange::new(at(1), Some(at(3))))
            .await
            .unwrap();
        let ordinals: Vec<usize> = hits
            .iter()
            .map(|h| h.range.start.message_ordinal)
            .collect();
        assert_eq!(ordinals, vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_end_is_a_point_query() {
        let index = filled().await;
        let hits = index
            .lookup_range(&DateRange::new(at(2), None))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range.start.message_ordinal, 2);

        let between = Utc.with_ymd_and_hms(2024, 1, 1, 2, 30, 0).unwrap();
        let hits = index
            .lookup_range(&DateRange::new(between, None))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn results_ascend_by_timestamp() {
        let index = MemoryTimestampIndex::new();
        index.add_timestamp(2, &at(4).to_rfc3339()).await.unwrap();
        index.add_timestamp(0, &at(1).to_rfc3339()).await.unwrap();
        index.add_timestamp(1, &at(2).to_rfc3339()).await.unwrap();
        let hits = index
            .lookup_range(&DateRange::new(at(0), Some(at(9))))
            .await
            .unwrap();
        let ordinals: Vec<usize> = hits
            .iter()
            .map(|h| h.range.start.message_ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_timestamp_is_rejected() {
        let index = MemoryTimestampIndex::new();
        assert!(!index.add_timestamp(0, "").await.unwrap());
        assert!(index.add_timestamp(0, "not-a-date").await.is_err());
    }

    #[tokio::test]
    async fn timezone_offsets_normalize_to_utc() {
        let index = MemoryTimestampIndex::new();
        index
            .add_timestamp(0, "2024-01-01T02:00:00+01:00")
            .await
            .unwrap();
        let hits = index
            .lookup_range(&DateRange::new(at(1), None))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
