//! Change events and the normalizer that produces them.
//!
//! The replication adapter hands over [`RawRecord`]s, a closed set of decoded record
//! shapes. [`EventNormalizer::normalize`] turns each of them into exactly one
//! [`ChangeEvent`], the immutable form that travels through the rest of the pipeline.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checkpoint::CheckpointMarker;

/// Column name to value map for one row image.
pub type RowValues = Map<String, Value>;

/// Canonical event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Heartbeat or log rotation; only moves the log position
    LogState,
    Insert,
    Update,
    Delete,
    /// Table metadata (column layout) announcement
    TableMeta,
    /// Anything else, including records the decoder could not make sense of
    Other,
}

impl EventKind {
    /// Whether events of this kind are shipped to the sink.
    ///
    /// `LogState` and `Other` events only advance the checkpoint.
    pub fn is_deliverable(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::TableMeta
        )
    }
}

/// Row mutation carried by a rows record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
}

/// Metadata every decoded record carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Seconds since the epoch, as written in the log
    pub timestamp: i64,
    /// Log file the record was read from, if the stream knows it yet
    pub log_file: Option<String>,
    /// Position of the next record in `log_file`
    pub log_pos: Option<u64>,
}

/// Before/after images of one row touched by a rows record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowChange {
    pub before: Option<RowValues>,
    pub after: Option<RowValues>,
}

/// A decoded record as delivered by the change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Keep-alive sent by the source while idle; `ident` names the current log file
    Heartbeat { header: RecordHeader, ident: String },

    /// The source switched to a new log file
    Rotate {
        header: RecordHeader,
        next_file: String,
        position: u64,
    },

    /// Row mutation for one table, possibly touching many rows
    Rows {
        header: RecordHeader,
        operation: RowOperation,
        schema: String,
        table: String,
        primary_key: Vec<String>,
        rows: Vec<RowChange>,
    },

    /// Column layout announcement preceding rows records
    TableMap {
        header: RecordHeader,
        schema: String,
        table: String,
    },

    /// Statement-level record (DDL, BEGIN, ...)
    Query { header: RecordHeader, schema: String },

    /// A record type the pipeline does not interpret, or one that failed to decode
    Unrecognized {
        header: RecordHeader,
        type_name: String,
    },
}

impl RawRecord {
    pub fn header(&self) -> &RecordHeader {
        match self {
            Self::Heartbeat { header, .. }
            | Self::Rotate { header, .. }
            | Self::Rows { header, .. }
            | Self::TableMap { header, .. }
            | Self::Query { header, .. }
            | Self::Unrecognized { header, .. } => header,
        }
    }

    /// Replication-protocol name of the record type.
    pub fn source_kind(&self) -> &str {
        match self {
            Self::Heartbeat { .. } => "HeartbeatLogEvent",
            Self::Rotate { .. } => "RotateEvent",
            Self::Rows { operation, .. } => match operation {
                RowOperation::Insert => "WriteRowsEvent",
                RowOperation::Update => "UpdateRowsEvent",
                RowOperation::Delete => "DeleteRowsEvent",
            },
            Self::TableMap { .. } => "TableMapEvent",
            Self::Query { .. } => "QueryEvent",
            Self::Unrecognized { type_name, .. } => type_name.as_str(),
        }
    }
}

/// Normalized change event, also the wire format shipped to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "event_type")]
    pub kind: EventKind,

    pub source_kind: String,

    pub timestamp: i64,

    pub log_file: Option<String>,

    pub log_pos: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,

    /// One entry per row touched; only set for updates and deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_values: Option<Vec<RowValues>>,

    /// One entry per row touched; only set for inserts and updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_values: Option<Vec<RowValues>>,
}

impl ChangeEvent {
    /// Resume marker for the position right after this event.
    pub fn checkpoint(&self) -> CheckpointMarker {
        CheckpointMarker::new(self.log_file.clone(), self.log_pos)
    }

    fn bare(kind: EventKind, source_kind: String, header: RecordHeader) -> Self {
        Self {
            kind,
            source_kind,
            timestamp: header.timestamp,
            log_file: header.log_file,
            log_pos: header.log_pos,
            schema: None,
            table: None,
            primary_key: None,
            before_values: None,
            after_values: None,
        }
    }
}

/// Classifies raw records and strips protected schemas.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    protected_schemas: HashSet<String>,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new([Self::DEFAULT_PROTECTED_SCHEMA])
    }
}

impl EventNormalizer {
    /// Schema redacted when no explicit list is configured.
    pub const DEFAULT_PROTECTED_SCHEMA: &'static str = "auth";

    pub fn new<I, S>(protected_schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protected_schemas: protected_schemas.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_protected(&self, schema: &str) -> bool {
        self.protected_schemas.contains(schema)
    }

    /// Produce the change event for one raw record. Never fails.
    pub fn normalize(&self, record: RawRecord) -> ChangeEvent {
        let kind = classify(&record);
        let source_kind = record.source_kind().to_string();

        match record {
            RawRecord::Heartbeat { header, ident } => {
                let mut event = ChangeEvent::bare(kind, source_kind, header);
                event.log_file = Some(ident);
                event.log_pos = None;
                event
            }
            RawRecord::Rotate {
                header,
                next_file,
                position,
            } => {
                let mut event = ChangeEvent::bare(kind, source_kind, header);
                event.log_file = Some(next_file);
                event.log_pos = Some(position);
                event
            }
            RawRecord::Rows {
                header,
                operation,
                schema,
                table,
                primary_key,
                rows,
            } => {
                let mut event = ChangeEvent::bare(kind, source_kind, header);
                if self.is_protected(&schema) {
                    return event;
                }

                let (before, after) = split_images(operation, rows);
                event.schema = Some(schema);
                event.table = Some(table);
                event.primary_key = (!primary_key.is_empty()).then_some(primary_key);
                event.before_values = before;
                event.after_values = after;
                event
            }
            RawRecord::TableMap {
                header,
                schema,
                table,
            } => {
                let mut event = ChangeEvent::bare(kind, source_kind, header);
                if !self.is_protected(&schema) {
                    event.schema = Some(schema);
                    event.table = Some(table);
                }
                event
            }
            RawRecord::Query { header, .. } | RawRecord::Unrecognized { header, .. } => {
                ChangeEvent::bare(kind, source_kind, header)
            }
        }
    }
}

/// First match wins: log state, delete, update, insert, table metadata, other.
fn classify(record: &RawRecord) -> EventKind {
    match record {
        RawRecord::Heartbeat { .. } | RawRecord::Rotate { .. } => EventKind::LogState,
        RawRecord::Rows {
            operation: RowOperation::Delete,
            ..
        } => EventKind::Delete,
        RawRecord::Rows {
            operation: RowOperation::Update,
            ..
        } => EventKind::Update,
        RawRecord::Rows {
            operation: RowOperation::Insert,
            ..
        } => EventKind::Insert,
        RawRecord::TableMap { .. } => EventKind::TableMeta,
        RawRecord::Query { .. } | RawRecord::Unrecognized { .. } => EventKind::Other,
    }
}

/// Deletes keep before images, inserts keep after images, updates keep both.
fn split_images(
    operation: RowOperation,
    rows: Vec<RowChange>,
) -> (Option<Vec<RowValues>>, Option<Vec<RowValues>>) {
    let keep_before = matches!(operation, RowOperation::Update | RowOperation::Delete);
    let keep_after = matches!(operation, RowOperation::Insert | RowOperation::Update);

    let mut before = Vec::new();
    let mut after = Vec::new();
    for row in rows {
        if keep_before {
            before.extend(row.before);
        }
        if keep_after {
            after.extend(row.after);
        }
    }

    (
        (keep_before && !before.is_empty()).then_some(before),
        (keep_after && !after.is_empty()).then_some(after),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(pos: u64) -> RecordHeader {
        RecordHeader {
            timestamp: 1_700_000_000,
            log_file: Some("mysql-bin.000001".to_string()),
            log_pos: Some(pos),
        }
    }

    fn values(v: Value) -> RowValues {
        v.as_object().cloned().unwrap()
    }

    fn rows_record(operation: RowOperation, schema: &str) -> RawRecord {
        RawRecord::Rows {
            header: header(120),
            operation,
            schema: schema.to_string(),
            table: "users".to_string(),
            primary_key: vec!["id".to_string()],
            rows: vec![RowChange {
                before: Some(values(json!({"id": 1, "name": "old"}))),
                after: Some(values(json!({"id": 1, "name": "new"}))),
            }],
        }
    }

    #[test]
    fn test_classification_is_total() {
        let records = vec![
            (
                RawRecord::Heartbeat {
                    header: header(4),
                    ident: "mysql-bin.000001".to_string(),
                },
                EventKind::LogState,
            ),
            (
                RawRecord::Rotate {
                    header: header(0),
                    next_file: "mysql-bin.000002".to_string(),
                    position: 4,
                },
                EventKind::LogState,
            ),
            (rows_record(RowOperation::Delete, "app"), EventKind::Delete),
            (rows_record(RowOperation::Update, "app"), EventKind::Update),
            (rows_record(RowOperation::Insert, "app"), EventKind::Insert),
            (
                RawRecord::TableMap {
                    header: header(90),
                    schema: "app".to_string(),
                    table: "users".to_string(),
                },
                EventKind::TableMeta,
            ),
            (
                RawRecord::Query {
                    header: header(60),
                    schema: "app".to_string(),
                },
                EventKind::Other,
            ),
            (
                RawRecord::Unrecognized {
                    header: RecordHeader::default(),
                    type_name: "FormatDescriptionEvent".to_string(),
                },
                EventKind::Other,
            ),
        ];

        let normalizer = EventNormalizer::default();
        for (record, expected) in records {
            assert_eq!(normalizer.normalize(record).kind, expected);
        }
    }

    #[test]
    fn test_rotate_carries_target_position() {
        let event = EventNormalizer::default().normalize(RawRecord::Rotate {
            header: header(0),
            next_file: "mysql-bin.000002".to_string(),
            position: 4,
        });

        assert_eq!(event.log_file.as_deref(), Some("mysql-bin.000002"));
        assert_eq!(event.log_pos, Some(4));
        assert_eq!(event.source_kind, "RotateEvent");
    }

    #[test]
    fn test_heartbeat_carries_ident_without_position() {
        let event = EventNormalizer::default().normalize(RawRecord::Heartbeat {
            header: header(777),
            ident: "mysql-bin.000009".to_string(),
        });

        assert_eq!(event.kind, EventKind::LogState);
        assert_eq!(event.log_file.as_deref(), Some("mysql-bin.000009"));
        assert_eq!(event.log_pos, None);
    }

    #[test]
    fn test_row_images_follow_operation() {
        let normalizer = EventNormalizer::default();

        let insert = normalizer.normalize(rows_record(RowOperation::Insert, "app"));
        assert!(insert.before_values.is_none());
        assert_eq!(insert.after_values.unwrap()[0]["name"], json!("new"));

        let update = normalizer.normalize(rows_record(RowOperation::Update, "app"));
        assert_eq!(update.before_values.unwrap()[0]["name"], json!("old"));
        assert_eq!(update.after_values.unwrap()[0]["name"], json!("new"));

        let delete = normalizer.normalize(rows_record(RowOperation::Delete, "app"));
        assert_eq!(delete.before_values.unwrap()[0]["name"], json!("old"));
        assert!(delete.after_values.is_none());
        assert_eq!(delete.primary_key, Some(vec!["id".to_string()]));
        assert_eq!(delete.schema.as_deref(), Some("app"));
        assert_eq!(delete.table.as_deref(), Some("users"));
    }

    #[test]
    fn test_multi_row_record_keeps_every_row() {
        let record = RawRecord::Rows {
            header: header(300),
            operation: RowOperation::Insert,
            schema: "app".to_string(),
            table: "orders".to_string(),
            primary_key: vec![],
            rows: (1..=3)
                .map(|id| RowChange {
                    before: None,
                    after: Some(values(json!({ "id": id }))),
                })
                .collect(),
        };

        let event = EventNormalizer::default().normalize(record);
        assert_eq!(event.after_values.as_ref().map(Vec::len), Some(3));
        assert!(event.primary_key.is_none());
    }

    #[test]
    fn test_protected_schema_is_redacted() {
        let normalizer = EventNormalizer::default();

        for operation in [RowOperation::Insert, RowOperation::Update, RowOperation::Delete] {
            let event = normalizer.normalize(rows_record(operation, "auth"));
            assert!(event.schema.is_none());
            assert!(event.table.is_none());
            assert!(event.primary_key.is_none());
            assert!(event.before_values.is_none());
            assert!(event.after_values.is_none());
            assert_eq!(event.log_pos, Some(120));
            assert_eq!(event.timestamp, 1_700_000_000);
        }

        let table_map = normalizer.normalize(RawRecord::TableMap {
            header: header(90),
            schema: "auth".to_string(),
            table: "credentials".to_string(),
        });
        assert_eq!(table_map.kind, EventKind::TableMeta);
        assert!(table_map.schema.is_none());
        assert!(table_map.table.is_none());
    }

    #[test]
    fn test_custom_protected_schemas() {
        let normalizer = EventNormalizer::new(["billing", "secrets"]);
        assert!(normalizer.is_protected("billing"));
        assert!(!normalizer.is_protected("auth"));

        let event = normalizer.normalize(rows_record(RowOperation::Insert, "secrets"));
        assert!(event.after_values.is_none());
    }

    #[test]
    fn test_wire_format_omits_absent_fields() {
        let event = EventNormalizer::default().normalize(rows_record(RowOperation::Insert, "auth"));
        let wire = serde_json::to_value(&event).unwrap();

        assert_eq!(wire["event_type"], json!("INSERT"));
        assert_eq!(wire["source_kind"], json!("WriteRowsEvent"));
        assert!(wire.get("schema").is_none());
        assert!(wire.get("after_values").is_none());
    }

    #[test]
    fn test_deliverable_kinds() {
        assert!(EventKind::Insert.is_deliverable());
        assert!(EventKind::TableMeta.is_deliverable());
        assert!(!EventKind::LogState.is_deliverable());
        assert!(!EventKind::Other.is_deliverable());
    }
}
