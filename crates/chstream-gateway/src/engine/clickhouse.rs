//! ClickHouse client over the HTTP interface
//!
//! Queries are submitted with `default_format=JSONEachRowWithProgress`, so the
//! response body is a line-oriented feed mixing `meta`, `row`, `progress` and
//! `exception` objects. Progress lines are surfaced one at a time as the body
//! streams in; rows are collected until the body ends.

use super::{Engine, EngineConnection};
use crate::connection::ConnectionDescriptor;
use crate::types::{Cell, Column, ProgressSnapshot, ResultSet, Row};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{NaiveDate, NaiveDateTime};
use chstream_common::error::codes;
use chstream_common::{ChStreamError, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{Error as _, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const OUTPUT_FORMAT: &str = "JSONEachRowWithProgress";
const EXCEPTION_CODE_HEADER: &str = "x-clickhouse-exception-code";

static EXCEPTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*Code:\s*(\d+)\.\s*(?:DB::Exception:\s*)?(.*?)\s*$")
        .expect("exception pattern is valid")
});
static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\(version [^)]*\)\s*$").expect("version pattern is valid"));

/// Settings shared by every connection the engine hands out
#[derive(Debug, Clone)]
pub struct HttpEngineSettings {
    /// Engine user (`X-ClickHouse-User`)
    pub user: Option<String>,
    /// Engine password (`X-ClickHouse-Key`)
    pub password: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for HttpEngineSettings {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Engine backed by ClickHouse's HTTP interface
pub struct ClickHouseHttpEngine {
    settings: Arc<HttpEngineSettings>,
}

impl ClickHouseHttpEngine {
    pub fn new(settings: HttpEngineSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl Engine for ClickHouseHttpEngine {
    fn client(&self, descriptor: &ConnectionDescriptor) -> Box<dyn EngineConnection> {
        Box::new(ClickHouseConnection {
            descriptor: descriptor.clone(),
            settings: self.settings.clone(),
            state: State::Idle,
        })
    }
}

enum State {
    Idle,
    Connected(reqwest::Client),
    Streaming(QueryStream),
    Finished(ResultSet),
    Drained,
    Failed,
    Disconnected,
}

/// One logical engine connection backed by a single-use HTTP client.
///
/// Idle sockets are never kept, so the `/ping` in [`connect`] and the query
/// POST each open their own TCP connection. Nothing is shared across requests.
///
/// [`connect`]: EngineConnection::connect
pub struct ClickHouseConnection {
    descriptor: ConnectionDescriptor,
    settings: Arc<HttpEngineSettings>,
    state: State,
}

impl ClickHouseConnection {
    fn query_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.descriptor.http_base())
            .map_err(|e| ChStreamError::ConfigError(format!("invalid engine address: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("database", &self.descriptor.database)
                .append_pair("default_format", OUTPUT_FORMAT);
            if self.descriptor.compression {
                pairs.append_pair("enable_http_compression", "1");
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request;
        if let Some(user) = &self.settings.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.settings.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        request
    }
}

#[async_trait]
impl EngineConnection for ClickHouseConnection {
    async fn connect(&mut self) -> Result<()> {
        let base = self.descriptor.http_base();
        let http = reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .gzip(self.descriptor.compression)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ChStreamError::ConnectionFailed(e.to_string()))?;

        let response = self
            .authorize(http.get(format!("{}/ping", base)))
            .send()
            .await
            .map_err(|e| ChStreamError::ConnectionFailed(format!("{}: {}", base, e)))?;
        if !response.status().is_success() {
            return Err(ChStreamError::ConnectionFailed(format!(
                "{} answered ping with {}",
                base,
                response.status()
            )));
        }

        debug!(engine = %base, compression = self.descriptor.compression, "Connected to engine");
        self.state = State::Connected(http);
        Ok(())
    }

    async fn execute_with_progress(&mut self, sql: &str) -> Result<()> {
        let http = match std::mem::replace(&mut self.state, State::Failed) {
            State::Connected(http) => http,
            other => {
                self.state = other;
                return Err(ChStreamError::internal(
                    "query submitted on a connection that is not open",
                ));
            }
        };

        let url = self.query_url()?;
        let response = self
            .authorize(http.post(url))
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| ChStreamError::ConnectionFailed(format!("query submission failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let header_code = response
                .headers()
                .get(EXCEPTION_CODE_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i32>().ok());
            let body = response.text().await.unwrap_or_default();
            let (body_code, message) = parse_exception(&body);
            warn!(status = %status, "Engine rejected query");
            return Err(ChStreamError::execution(
                header_code.or(body_code).unwrap_or(codes::UNKNOWN_EXCEPTION),
                message,
            ));
        }

        self.state = State::Streaming(QueryStream {
            body: response.bytes_stream().boxed(),
            buffer: BytesMut::new(),
            collector: ResultCollector::default(),
            eof: false,
        });
        Ok(())
    }

    async fn next_progress(&mut self) -> Option<Result<ProgressSnapshot>> {
        loop {
            let step = match &mut self.state {
                State::Streaming(stream) => stream.advance().await,
                _ => return None,
            };
            match step {
                Advance::Progress(progress) => return Some(Ok(progress)),
                Advance::Pending => continue,
                Advance::Finished(result) => {
                    self.state = State::Finished(result);
                    return None;
                }
                Advance::Failed(err) => {
                    self.state = State::Failed;
                    return Some(Err(err));
                }
            }
        }
    }

    async fn result(&mut self) -> Result<ResultSet> {
        match std::mem::replace(&mut self.state, State::Drained) {
            State::Finished(result) => Ok(result),
            other => {
                self.state = other;
                Err(ChStreamError::internal(
                    "result requested before the progress stream finished",
                ))
            }
        }
    }

    fn disconnect(&mut self) {
        // Dropping the client and any open body closes the socket
        self.state = State::Disconnected;
    }
}

enum Advance {
    Progress(ProgressSnapshot),
    Pending,
    Finished(ResultSet),
    Failed(ChStreamError),
}

struct QueryStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: BytesMut,
    collector: ResultCollector,
    eof: bool,
}

impl QueryStream {
    async fn advance(&mut self) -> Advance {
        if let Some(line) = next_line(&mut self.buffer, self.eof) {
            return match self.collector.apply(&line) {
                Ok(Some(progress)) => Advance::Progress(progress),
                Ok(None) => Advance::Pending,
                Err(err) => Advance::Failed(err),
            };
        }
        if self.eof {
            return Advance::Finished(std::mem::take(&mut self.collector).finish());
        }
        match self.body.next().await {
            Some(Ok(chunk)) => {
                self.buffer.extend_from_slice(&chunk);
                Advance::Pending
            }
            Some(Err(e)) => Advance::Failed(ChStreamError::ConnectionFailed(format!(
                "engine stream interrupted: {}",
                e
            ))),
            None => {
                self.eof = true;
                Advance::Pending
            }
        }
    }
}

/// Split one `\n`-terminated line off the buffer; at end of body, whatever is left
fn next_line(buffer: &mut BytesMut, eof: bool) -> Option<BytesMut> {
    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line = buffer.split_to(pos + 1);
        line.truncate(pos);
        return Some(line);
    }
    if eof && !buffer.is_empty() {
        return Some(buffer.split());
    }
    None
}

#[derive(Debug, Deserialize)]
struct WireColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct WireProgress {
    #[serde(default, deserialize_with = "lenient_u64")]
    read_rows: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    read_bytes: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    total_rows_to_read: u64,
}

impl From<WireProgress> for ProgressSnapshot {
    fn from(p: WireProgress) -> Self {
        ProgressSnapshot {
            rows_processed: p.read_rows,
            bytes_processed: p.read_bytes,
            rows_total: p.total_rows_to_read,
        }
    }
}

/// ClickHouse quotes 64-bit counters in progress objects
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("counter out of range: {}", n))),
        Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("unexpected counter value: {}", other))),
    }
}

/// One object of the `JSONEachRowWithProgress` feed
enum WireLine {
    Meta(Vec<WireColumn>),
    Row(Vec<(String, Value)>),
    Progress(WireProgress),
    Exception(String),
    /// totals, extremes, rows_before_limit_at_least
    Other,
}

impl<'de> Deserialize<'de> for WireLine {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(WireLineVisitor)
    }
}

struct WireLineVisitor;

impl<'de> Visitor<'de> for WireLineVisitor {
    type Value = WireLine;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSONEachRowWithProgress object")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<WireLine, A::Error>
    where
        A: MapAccess<'de>,
    {
        let Some(key) = map.next_key::<String>()? else {
            return Ok(WireLine::Other);
        };
        let line = match key.as_str() {
            "meta" => WireLine::Meta(map.next_value()?),
            "row" => WireLine::Row(map.next_value::<RowFields>()?.0),
            "progress" => WireLine::Progress(map.next_value()?),
            "exception" => WireLine::Exception(map.next_value()?),
            _ => {
                map.next_value::<IgnoredAny>()?;
                WireLine::Other
            }
        };
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(line)
    }
}

/// Row fields in output order; names repeat for queries like `SELECT 1, 1`
struct RowFields(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for RowFields {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RowFieldsVisitor;

        impl<'de> Visitor<'de> for RowFieldsVisitor {
            type Value = RowFields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a row object")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<RowFields, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut fields = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Value>()? {
                    fields.push(entry);
                }
                Ok(RowFields(fields))
            }
        }

        deserializer.deserialize_map(RowFieldsVisitor)
    }
}

/// Accumulates columns and rows from the line feed
#[derive(Debug, Default)]
struct ResultCollector {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl ResultCollector {
    /// Apply one line; returns the snapshot when the line was a progress report
    fn apply(&mut self, line: &[u8]) -> Result<Option<ProgressSnapshot>> {
        let text = std::str::from_utf8(line)
            .map_err(|e| ChStreamError::ProtocolError(format!("engine output is not UTF-8: {}", e)))?
            .trim();
        if text.is_empty() {
            return Ok(None);
        }
        if text.starts_with("Code:") {
            return Err(exception_error(text));
        }

        let line: WireLine = serde_json::from_str(text).map_err(|e| {
            ChStreamError::ProtocolError(format!("unexpected engine output: {}", e))
        })?;

        match line {
            WireLine::Meta(meta) => {
                self.columns = meta
                    .into_iter()
                    .map(|c| Column::new(c.name, c.type_name))
                    .collect();
                Ok(None)
            }
            WireLine::Row(fields) => {
                self.push_row(fields);
                Ok(None)
            }
            WireLine::Progress(progress) => Ok(Some(progress.into())),
            WireLine::Exception(message) => Err(exception_error(&message)),
            WireLine::Other => Ok(None),
        }
    }

    /// Cells are matched to columns by position
    fn push_row(&mut self, fields: Vec<(String, Value)>) {
        if self.columns.is_empty() {
            // Servers without `meta` support: names come from the first row
            self.columns = fields
                .iter()
                .map(|(name, _)| Column::new(name.clone(), ""))
                .collect();
        }
        let mut values = fields.into_iter().map(|(_, value)| value);
        let row = self
            .columns
            .iter()
            .map(|column| {
                values
                    .next()
                    .map(|v| convert_cell(v, &column.type_name))
                    .unwrap_or(Cell::Null)
            })
            .collect();
        self.rows.push(row);
    }

    fn finish(self) -> ResultSet {
        ResultSet {
            rows: self.rows,
            columns: self.columns,
        }
    }
}

fn exception_error(text: &str) -> ChStreamError {
    let (code, message) = parse_exception(text);
    ChStreamError::execution(code.unwrap_or(codes::UNKNOWN_EXCEPTION), message)
}

/// Split `Code: 60. DB::Exception: <message> (version ...)` into code and message
fn parse_exception(text: &str) -> (Option<i32>, String) {
    match EXCEPTION_RE.captures(text) {
        Some(caps) => {
            let code = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let message = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            (code, VERSION_SUFFIX_RE.replace(message, "").into_owned())
        }
        None => (None, text.trim().to_string()),
    }
}

/// Strip `Nullable(...)` and `LowCardinality(...)` wrappers
fn base_type(type_name: &str) -> &str {
    let mut ty = type_name.trim();
    loop {
        let inner = ["Nullable(", "LowCardinality("]
            .iter()
            .find_map(|prefix| ty.strip_prefix(prefix).and_then(|s| s.strip_suffix(')')));
        match inner {
            Some(inner) => ty = inner.trim(),
            None => return ty,
        }
    }
}

/// Convert one JSON value to a cell, using the column type to recover dates
fn convert_cell(value: Value, type_name: &str) -> Cell {
    let ty = base_type(type_name);
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Bool(b),
        Value::Number(n) => n
            .as_u64()
            .map(Cell::UInt)
            .or_else(|| n.as_i64().map(Cell::Int))
            .unwrap_or_else(|| Cell::Float(n.as_f64().unwrap_or(f64::NAN))),
        Value::String(s) => convert_text(s, ty),
        Value::Array(items) => {
            let inner = ty
                .strip_prefix("Array(")
                .and_then(|s| s.strip_suffix(')'))
                .unwrap_or("");
            Cell::Array(items.into_iter().map(|v| convert_cell(v, inner)).collect())
        }
        object @ Value::Object(_) => Cell::Json(object),
    }
}

/// `UInt8` .. `UInt256` and `Int8` .. `Int256`
fn is_integer_type(ty: &str) -> bool {
    let digits = ty
        .strip_prefix("UInt")
        .or_else(|| ty.strip_prefix("Int"))
        .unwrap_or("");
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn convert_text(text: String, ty: &str) -> Cell {
    if is_integer_type(ty) {
        // 64-bit and wider integers arrive quoted; wider than 64 bits stays text
        if let Ok(n) = text.parse::<u64>() {
            return Cell::UInt(n);
        }
        if let Ok(n) = text.parse::<i64>() {
            return Cell::Int(n);
        }
    } else if ty.starts_with("DateTime") {
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(ts) = NaiveDateTime::parse_from_str(&text, format) {
                return Cell::DateTime(ts);
            }
        }
    } else if ty.starts_with("Date") {
        if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
            return Cell::Date(date);
        }
    }
    Cell::String(text)
}
