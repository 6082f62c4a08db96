//! MySQL binlog change source built on `mysql_async` replication streams.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::StreamExt;
use mysql_async::binlog::events::{
    Event, EventData, OptionalMetadataField, RowsEventData, TableMapEvent,
};
use mysql_async::binlog::jsonb;
use mysql_async::binlog::jsondiff::JsonDiffOperation;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, OptsBuilder};
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

use super::{ChangeSource, ChangeStream};
use crate::checkpoint::CheckpointMarker;
use crate::error::RelayResult;
use crate::event::{RawRecord, RecordHeader, RowChange, RowOperation, RowValues};

/// Connection settings for the replication client.
#[derive(Debug, Clone)]
pub struct BinlogSourceOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub server_id: u32,
    /// Idle interval after which the server sends a heartbeat; zero keeps the server default.
    pub heartbeat: Duration,
}

pub struct MysqlBinlogSource {
    options: BinlogSourceOptions,
}

impl MysqlBinlogSource {
    pub fn new(options: BinlogSourceOptions) -> Self {
        Self { options }
    }

    fn opts(&self) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(&self.options.host)
            .tcp_port(self.options.port)
            .user(Some(&self.options.user))
            .pass(Some(&self.options.password))
            .prefer_socket(Some(false))
    }
}

#[async_trait]
impl ChangeSource for MysqlBinlogSource {
    async fn open(&self, resume: &CheckpointMarker) -> RelayResult<Box<dyn ChangeStream>> {
        info!(
            host = %self.options.host,
            port = self.options.port,
            server_id = self.options.server_id,
            "Connecting replication client"
        );
        let mut conn = Conn::new(self.opts()).await?;

        if !self.options.heartbeat.is_zero() {
            conn.query_drop(format!(
                "SET @master_heartbeat_period = {}",
                self.options.heartbeat.as_nanos()
            ))
            .await?;
        }

        let mut request = BinlogStreamRequest::new(self.options.server_id);
        match (&resume.log_file, resume.log_pos) {
            (Some(file), Some(pos)) => {
                request = request.with_filename(file.as_bytes()).with_pos(pos);
                info!(log_file = %file, log_pos = pos, "Starting binlog stream");
            }
            _ => info!("Starting binlog stream from the oldest available log"),
        }

        let stream = conn.get_binlog_stream(request).await?;

        Ok(Box::new(BinlogChangeStream {
            stream: Some(stream),
            cursor: StreamCursor::starting_at(resume),
        }))
    }
}

/// Open replication stream.
struct BinlogChangeStream {
    stream: Option<BinlogStream>,
    cursor: StreamCursor,
}

/// The log file being read and the last real offset seen in it.
#[derive(Debug)]
struct StreamCursor {
    file: Option<String>,
    pos: Option<u64>,
}

impl StreamCursor {
    fn starting_at(resume: &CheckpointMarker) -> Self {
        Self {
            file: resume.log_file.clone(),
            pos: resume.log_pos,
        }
    }

    /// Artificial events (the fake rotate and format description sent at stream start)
    /// carry offset 0; they inherit the last known offset so their marker stays complete.
    fn header(&self, timestamp: u32, log_pos: u32) -> RecordHeader {
        RecordHeader {
            timestamp: i64::from(timestamp),
            log_file: self.file.clone(),
            log_pos: Some(u64::from(log_pos))
                .filter(|pos| *pos > 0)
                .or(self.pos),
        }
    }

    fn advance(&mut self, record: &RawRecord) {
        match record {
            RawRecord::Rotate {
                next_file,
                position,
                ..
            } => {
                self.file = Some(next_file.clone());
                self.pos = Some(*position);
            }
            other => {
                if let Some(pos) = other.header().log_pos {
                    self.pos = Some(pos);
                }
            }
        }
    }
}

#[async_trait]
impl ChangeStream for BinlogChangeStream {
    async fn next(&mut self) -> RelayResult<Option<RawRecord>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let event = match stream.next().await {
            Some(event) => event?,
            None => {
                debug!("Binlog stream ended");
                return Ok(None);
            }
        };

        let record = decode_event(&event, stream, &self.cursor);
        self.cursor.advance(&record);

        Ok(Some(record))
    }

    async fn close(&mut self) -> RelayResult<()> {
        if let Some(stream) = self.stream.take() {
            stream.close().await?;
            info!("Binlog stream closed");
        }
        Ok(())
    }
}

fn decode_event(event: &Event, stream: &BinlogStream, cursor: &StreamCursor) -> RawRecord {
    let header = cursor.header(event.header().timestamp(), event.header().log_pos());

    let data = match event.read_data() {
        Ok(Some(data)) => data,
        Ok(None) => return unrecognized(event, header),
        Err(e) => {
            warn!(error = %e, log_pos = ?header.log_pos, "Failed to decode binlog event");
            return unrecognized(event, header);
        }
    };

    match data {
        EventData::HeartbeatEvent => RawRecord::Heartbeat {
            ident: cursor.file.clone().unwrap_or_default(),
            header,
        },
        EventData::RotateEvent(re) => RawRecord::Rotate {
            header,
            next_file: re.name().into_owned(),
            position: re.position(),
        },
        EventData::TableMapEvent(tme) => RawRecord::TableMap {
            header,
            schema: tme.database_name().into_owned(),
            table: tme.table_name().into_owned(),
        },
        EventData::QueryEvent(qe) => RawRecord::Query {
            header,
            schema: qe.schema().into_owned(),
        },
        EventData::RowsEvent(rows_event) => decode_rows(event, &rows_event, stream, header),
        _ => unrecognized(event, header),
    }
}

fn decode_rows(
    event: &Event,
    rows_event: &RowsEventData<'_>,
    stream: &BinlogStream,
    header: RecordHeader,
) -> RawRecord {
    let operation = match rows_event {
        RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
            RowOperation::Insert
        }
        RowsEventData::UpdateRowsEvent(_)
        | RowsEventData::UpdateRowsEventV1(_)
        | RowsEventData::PartialUpdateRowsEvent(_) => RowOperation::Update,
        RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
            RowOperation::Delete
        }
    };

    let table_id = rows_event.table_id();
    let Some(tme) = stream.get_tme(table_id) else {
        warn!(table_id, "Rows event without a preceding table map");
        return unrecognized(event, header);
    };

    let columns = column_names(tme);
    let types = column_types(tme);
    let primary_key = primary_key_columns(tme, &columns);

    let mut rows = Vec::new();
    for row in rows_event.rows(tme) {
        match row {
            Ok((before, after)) => rows.push(RowChange {
                before: before.map(|r| row_values(&r, &columns, &types)),
                after: after.map(|r| row_values(&r, &columns, &types)),
            }),
            Err(e) => {
                warn!(table_id, error = %e, "Failed to decode row image");
                return unrecognized(event, header);
            }
        }
    }

    RawRecord::Rows {
        header,
        operation,
        schema: tme.database_name().into_owned(),
        table: tme.table_name().into_owned(),
        primary_key,
        rows,
    }
}

fn unrecognized(event: &Event, header: RecordHeader) -> RawRecord {
    // Not delivered to the sink, the name only appears in logs.
    let type_name = format!("{:?}", event.header().event_type());
    RawRecord::Unrecognized { header, type_name }
}

/// Column names from the table map's optional metadata; `col_N` where the server
/// did not send them (`binlog_row_metadata = MINIMAL`).
fn column_names(tme: &TableMapEvent<'_>) -> Vec<String> {
    let mut names = Vec::new();
    for meta in tme.iter_optional_meta().flatten() {
        if let OptionalMetadataField::ColumnName(col_names) = meta {
            for name in col_names.iter_names().flatten() {
                names.push(name.name().into_owned());
            }
        }
    }

    let count = usize::try_from(tme.columns_count()).unwrap_or(names.len());
    for i in names.len()..count {
        names.push(format!("col_{}", i));
    }
    names
}

/// Declared type of each column, `None` where the table map carries an unknown code.
fn column_types(tme: &TableMapEvent<'_>) -> Vec<Option<ColumnType>> {
    let count = usize::try_from(tme.columns_count()).unwrap_or_default();
    (0..count)
        .map(|i| tme.get_raw_column_type(i).ok().flatten())
        .collect()
}

/// Key column names, from either primary key layout the server may send.
fn primary_key_columns(tme: &TableMapEvent<'_>, columns: &[String]) -> Vec<String> {
    let mut indexes = Vec::new();
    for meta in tme.iter_optional_meta().flatten() {
        match meta {
            OptionalMetadataField::SimplePrimaryKey(pk) => {
                indexes.extend(pk.iter_indexes().flatten());
            }
            OptionalMetadataField::PrimaryKeyWithPrefix(pk) => {
                indexes.extend(pk.iter_keys().flatten().map(|key| key.column_index()));
            }
            _ => {}
        }
    }

    indexes
        .into_iter()
        .filter_map(|index| usize::try_from(index).ok().and_then(|i| columns.get(i)))
        .cloned()
        .collect()
}

fn row_values(row: &BinlogRow, columns: &[String], types: &[Option<ColumnType>]) -> RowValues {
    let mut values = RowValues::new();
    for i in 0..row.len() {
        let name = columns
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("col_{}", i));
        let column_type = types.get(i).copied().flatten();
        let value = row
            .as_ref(i)
            .map_or(Value::Null, |v| binlog_value_to_json(v, column_type));
        values.insert(name, value);
    }
    values
}

fn binlog_value_to_json(value: &BinlogValue<'_>, column_type: Option<ColumnType>) -> Value {
    match value {
        BinlogValue::Value(v) => mysql_value_to_json(v, column_type),
        BinlogValue::Jsonb(jsonb) => jsonb_to_json(jsonb),
        BinlogValue::JsonDiff(diffs) => partial_update(diffs.iter().map(|diff| {
            json_diff_entry(
                diff.operation(),
                &diff.path_str(),
                diff.value().map(jsonb_to_json),
            )
        })),
    }
}

fn jsonb_to_json(jsonb: &jsonb::Value<'_>) -> Value {
    match Value::try_from(jsonb.clone()) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Failed to convert JSON column value");
            Value::Null
        }
    }
}

/// Partial JSON updates (`binlog_row_value_options = PARTIAL_JSON`) carry edits, not
/// the document; they ship as `{"json_diff": [...]}`.
fn partial_update(diffs: impl Iterator<Item = Value>) -> Value {
    serde_json::json!({ "json_diff": diffs.collect::<Vec<_>>() })
}

fn json_diff_entry(operation: JsonDiffOperation, path: &str, value: Option<Value>) -> Value {
    let op = match operation {
        JsonDiffOperation::REPLACE => "replace",
        JsonDiffOperation::INSERT => "insert",
        JsonDiffOperation::REMOVE => "remove",
    };
    let mut entry = serde_json::Map::new();
    entry.insert("op".to_string(), Value::from(op));
    entry.insert("path".to_string(), Value::from(path));
    if let Some(value) = value {
        entry.insert("value".to_string(), value);
    }
    Value::Object(entry)
}

fn mysql_value_to_json(value: &mysql_async::Value, column_type: Option<ColumnType>) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(v) => Value::from(*v),
        mysql_async::Value::UInt(v) => Value::from(*v),
        mysql_async::Value::Float(v) => float_to_json(f64::from(*v)),
        mysql_async::Value::Double(v) => float_to_json(*v),
        mysql_async::Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::String(STANDARD.encode(bytes)),
        },
        mysql_async::Value::Date(year, month, day, hour, min, sec, micros) => match column_type {
            Some(ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE) => {
                Value::String(format!("{:04}-{:02}-{:02}", year, month, day))
            }
            _ => Value::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
                year,
                month,
                day,
                hour,
                min,
                sec,
                fraction(*micros)
            )),
        },
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            Value::String(format!(
                "{}{:02}:{:02}:{:02}{}",
                if *negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds,
                fraction(*micros)
            ))
        }
    }
}

fn float_to_json(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn fraction(micros: u32) -> String {
    if micros == 0 {
        String::new()
    } else {
        format!(".{:06}", micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::binlog::events::FormatDescriptionEvent;
    use mysql_async::binlog::BinlogVersion;
    use mysql_async::Value as MyValue;
    use serde_json::json;

    const COLUMN_NAME: u8 = 4;
    const SIMPLE_PRIMARY_KEY: u8 = 8;
    const PRIMARY_KEY_WITH_PREFIX: u8 = 9;

    /// Wire bytes of a table map for `app.users (id INT, email VARCHAR, created_at DATETIME(0))`
    /// followed by the given optional metadata fields.
    fn table_map_event(optional_meta: &[(u8, Vec<u8>)]) -> Event {
        let mut data = vec![42, 0, 0, 0, 0, 0, 0, 0];
        data.extend([3, b'a', b'p', b'p', 0]);
        data.extend([5, b'u', b's', b'e', b'r', b's', 0]);
        data.extend([3, 0x03, 0x0f, 0x12]);
        data.extend([3, 0xff, 0x00, 0x00]);
        data.push(0b0000_0110);
        for (field, value) in optional_meta {
            data.push(*field);
            data.push(u8::try_from(value.len()).unwrap());
            data.extend(value);
        }

        let event_size = u32::try_from(19 + data.len()).unwrap();
        let mut bytes = Vec::new();
        bytes.extend(1_717_171_717_u32.to_le_bytes());
        bytes.push(0x13);
        bytes.extend(1_u32.to_le_bytes());
        bytes.extend(event_size.to_le_bytes());
        bytes.extend(900_u32.to_le_bytes());
        bytes.extend(0_u16.to_le_bytes());
        bytes.extend(data);

        let fde = FormatDescriptionEvent::new(BinlogVersion::Version4);
        Event::read(&fde, &bytes[..]).unwrap()
    }

    fn names_field(names: &[&str]) -> (u8, Vec<u8>) {
        let mut value = Vec::new();
        for name in names {
            value.push(u8::try_from(name.len()).unwrap());
            value.extend(name.as_bytes());
        }
        (COLUMN_NAME, value)
    }

    #[test]
    fn test_table_map_simple_primary_key() {
        let event = table_map_event(&[
            names_field(&["id", "email", "created_at"]),
            (SIMPLE_PRIMARY_KEY, vec![0]),
        ]);
        let tme = event.read_event::<TableMapEvent>().unwrap();

        let columns = column_names(&tme);
        assert_eq!(columns, vec!["id", "email", "created_at"]);
        assert_eq!(primary_key_columns(&tme, &columns), vec!["id"]);
        assert_eq!(
            column_types(&tme),
            vec![
                Some(ColumnType::MYSQL_TYPE_LONG),
                Some(ColumnType::MYSQL_TYPE_VARCHAR),
                Some(ColumnType::MYSQL_TYPE_DATETIME2),
            ]
        );
    }

    #[test]
    fn test_table_map_prefixed_primary_key() {
        // PRIMARY KEY (id, email(8))
        let event = table_map_event(&[
            names_field(&["id", "email", "created_at"]),
            (PRIMARY_KEY_WITH_PREFIX, vec![0, 0, 1, 8]),
        ]);
        let tme = event.read_event::<TableMapEvent>().unwrap();

        let columns = column_names(&tme);
        assert_eq!(primary_key_columns(&tme, &columns), vec!["id", "email"]);
    }

    #[test]
    fn test_table_map_minimal_metadata_pads_names() {
        let event = table_map_event(&[]);
        let tme = event.read_event::<TableMapEvent>().unwrap();

        let columns = column_names(&tme);
        assert_eq!(columns, vec!["col_0", "col_1", "col_2"]);
        assert!(primary_key_columns(&tme, &columns).is_empty());
    }

    #[test]
    fn test_numbers_convert() {
        assert_eq!(mysql_value_to_json(&MyValue::Int(-7), None), json!(-7));
        assert_eq!(mysql_value_to_json(&MyValue::UInt(u64::MAX), None), json!(u64::MAX));
        assert_eq!(mysql_value_to_json(&MyValue::Double(1.5), None), json!(1.5));
        assert_eq!(mysql_value_to_json(&MyValue::Double(f64::NAN), None), Value::Null);
        assert_eq!(mysql_value_to_json(&MyValue::NULL, None), Value::Null);
    }

    #[test]
    fn test_text_and_binary_bytes() {
        assert_eq!(
            mysql_value_to_json(&MyValue::Bytes(b"hello".to_vec()), None),
            json!("hello")
        );
        assert_eq!(
            mysql_value_to_json(&MyValue::Bytes(vec![0xff, 0x00, 0x10]), None),
            json!("/wAQ")
        );
    }

    #[test]
    fn test_temporal_values_follow_column_type() {
        let midnight = MyValue::Date(2024, 2, 29, 0, 0, 0, 0);
        assert_eq!(
            mysql_value_to_json(&midnight, Some(ColumnType::MYSQL_TYPE_DATE)),
            json!("2024-02-29")
        );
        assert_eq!(
            mysql_value_to_json(&midnight, Some(ColumnType::MYSQL_TYPE_DATETIME2)),
            json!("2024-02-29 00:00:00")
        );
        assert_eq!(
            mysql_value_to_json(&midnight, Some(ColumnType::MYSQL_TYPE_TIMESTAMP)),
            json!("2024-02-29 00:00:00")
        );
        assert_eq!(
            mysql_value_to_json(
                &MyValue::Date(2024, 2, 29, 13, 5, 9, 120),
                Some(ColumnType::MYSQL_TYPE_DATETIME2)
            ),
            json!("2024-02-29 13:05:09.000120")
        );
        assert_eq!(
            mysql_value_to_json(&MyValue::Time(true, 1, 2, 3, 4, 0), None),
            json!("-26:03:04")
        );
    }

    #[test]
    fn test_json_column_is_decoded() {
        let value = BinlogValue::Jsonb(jsonb::Value::I32(5));
        assert_eq!(binlog_value_to_json(&value, Some(ColumnType::MYSQL_TYPE_JSON)), json!(5));

        let value = BinlogValue::Jsonb(jsonb::Value::Null);
        assert_eq!(binlog_value_to_json(&value, None), Value::Null);
    }

    #[test]
    fn test_partial_json_update_is_not_null() {
        let shipped = partial_update(
            vec![
                json_diff_entry(JsonDiffOperation::REPLACE, "$.name", Some(json!("x"))),
                json_diff_entry(JsonDiffOperation::REMOVE, "$.tags[0]", None),
            ]
            .into_iter(),
        );

        assert_ne!(shipped, Value::Null);
        assert_eq!(
            shipped,
            json!({ "json_diff": [
                { "op": "replace", "path": "$.name", "value": "x" },
                { "op": "remove", "path": "$.tags[0]" },
            ]})
        );
    }

    #[test]
    fn test_artificial_events_inherit_last_offset() {
        let mut cursor = StreamCursor::starting_at(&CheckpointMarker::at("mysql-bin.000007", 4120));

        // Fake rotate, then the format description, both at offset 0.
        let fake_rotate = RawRecord::Rotate {
            header: cursor.header(0, 0),
            next_file: "mysql-bin.000007".to_string(),
            position: 4120,
        };
        cursor.advance(&fake_rotate);
        let format_description = cursor.header(1_717_171_717, 0);
        assert_eq!(format_description.log_file.as_deref(), Some("mysql-bin.000007"));
        assert_eq!(format_description.log_pos, Some(4120));

        let query = RawRecord::Query {
            header: cursor.header(1_717_171_718, 4388),
            schema: "app".to_string(),
        };
        assert_eq!(query.header().log_pos, Some(4388));
        cursor.advance(&query);

        let real_rotate = RawRecord::Rotate {
            header: cursor.header(1_717_171_719, 4500),
            next_file: "mysql-bin.000008".to_string(),
            position: 4,
        };
        cursor.advance(&real_rotate);
        let header = cursor.header(1_717_171_720, 0);
        assert_eq!(header.log_file.as_deref(), Some("mysql-bin.000008"));
        assert_eq!(header.log_pos, Some(4));
    }

    #[test]
    fn test_cursor_without_resume_offset_stays_empty() {
        let cursor = StreamCursor::starting_at(&CheckpointMarker::default());
        let header = cursor.header(0, 0);
        assert_eq!(header.log_file, None);
        assert_eq!(header.log_pos, None);
    }
}
