use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tablevault_core::{Page, Row, TableTransport, TransportError, UpsertOutcome, DEFAULT_PRIMARY_KEY};

const DELETE_CHUNK: usize = 100;

/// PostgREST client speaking the `/rest/v1/<table>` dialect.
pub struct RestTransport {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    default_order: String,
    order_columns: BTreeMap<String, String>,
}

impl RestTransport {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_order: DEFAULT_PRIMARY_KEY.to_string(),
            order_columns: BTreeMap::new(),
        }
    }

    /// Page `table` in `column` order so offsets stay stable between requests.
    #[must_use]
    pub fn with_order_column(mut self, table: &str, column: &str) -> Self {
        self.order_columns.insert(table.to_string(), column.to_string());
        self
    }

    /// Order column for tables without their own, including tables found by
    /// discovery after construction.
    #[must_use]
    pub fn with_default_order_column(mut self, column: &str) -> Self {
        self.default_order = column.to_string();
        self
    }

    #[must_use]
    pub fn order_column(&self, table: &str) -> &str {
        self.order_columns.get(table).map_or(self.default_order.as_str(), String::as_str)
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        self.agent
            .request(method, url)
            .set("apikey", &self.api_key)
            .set("Authorization", &format!("Bearer {}", self.api_key))
    }
}

/// Map an HTTP status to a transport error class.
#[must_use]
pub fn classify_status(status: u16, message: String) -> TransportError {
    match status {
        408 | 425 | 429 | 500..=599 => TransportError::retryable(message),
        409 => TransportError::conflict(message),
        _ => TransportError::fatal(message),
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
#[must_use]
pub fn parse_content_range(header: &str) -> Option<u64> {
    let (_, total) = header.trim().rsplit_once('/')?;
    total.parse().ok()
}

/// Render a key for a PostgREST `in.(...)` filter.
#[must_use]
pub fn filter_literal(value: &Value) -> String {
    match value {
        Value::String(text) => format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\"")),
        other => other.to_string(),
    }
}

fn map_error(table: &str, err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(status, format!("`{table}` returned HTTP {status}: {body}"))
        }
        ureq::Error::Transport(transport) => TransportError::retryable(format!("`{table}` request failed: {transport}")),
    }
}

impl TableTransport for RestTransport {
    fn fetch_page(&self, table: &str, offset: u64, page_size: usize) -> Result<Page, TransportError> {
        let request = self
            .request("GET", &self.endpoint(table))
            .query("select", "*")
            .query("offset", &offset.to_string())
            .query("limit", &page_size.to_string())
            .query("order", &format!("{}.asc", self.order_column(table)));

        let rows: Vec<Row> = request
            .call()
            .map_err(|err| map_error(table, err))?
            .into_json()
            .map_err(|err| TransportError::retryable(format!("`{table}` page could not be decoded: {err}")))?;

        let next = if rows.len() < page_size { None } else { Some(offset + rows.len() as u64) };
        tracing::trace!(table, offset, rows = rows.len(), "fetched page");
        Ok(Page { rows, next })
    }

    fn upsert_batch(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
        exclude_columns: &[String],
    ) -> Result<UpsertOutcome, TransportError> {
        let mut outcome = UpsertOutcome::default();
        let mut payload = Vec::with_capacity(rows.len());
        for row in rows {
            if row.get(key_column).map_or(true, Value::is_null) {
                outcome.errors += 1;
                outcome.error_details.push(format!("row has no `{key_column}` value"));
                continue;
            }
            let filtered: Row = row
                .iter()
                .filter(|(column, _)| !exclude_columns.iter().any(|ex| ex == *column))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            payload.push(Value::Object(filtered));
        }
        if payload.is_empty() {
            return Ok(outcome);
        }

        let sent = payload.len();
        self.request("POST", &self.endpoint(table))
            .query("on_conflict", key_column)
            .set("Prefer", "resolution=merge-duplicates,return=minimal")
            .send_json(Value::Array(payload))
            .map_err(|err| map_error(table, err))?;

        // PostgREST does not report which rows already existed.
        outcome.inserted = sent;
        Ok(outcome)
    }

    fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
        let response = self
            .request("HEAD", &self.endpoint(table))
            .query("select", "*")
            .set("Prefer", "count=exact")
            .call()
            .map_err(|err| map_error(table, err))?;
        response
            .header("Content-Range")
            .and_then(parse_content_range)
            .ok_or_else(|| TransportError::fatal(format!("`{table}` count response has no Content-Range total")))
    }

    fn delete_rows(&self, table: &str, key_column: &str, keys: &[Value]) -> Result<usize, TransportError> {
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let list = chunk.iter().map(filter_literal).collect::<Vec<_>>().join(",");
            let response = self
                .request("DELETE", &self.endpoint(table))
                .query(key_column, &format!("in.({list})"))
                .set("Prefer", "count=exact,return=minimal")
                .call()
                .map_err(|err| map_error(table, err))?;
            removed += response
                .header("Content-Range")
                .and_then(parse_content_range)
                .map_or(chunk.len(), |total| usize::try_from(total).unwrap_or(chunk.len()));
        }
        Ok(removed)
    }

    fn list_tables(&self) -> Result<Vec<String>, TransportError> {
        let spec: Value = self
            .request("GET", &format!("{}/rest/v1/", self.base_url))
            .call()
            .map_err(|err| map_error("<root>", err))?
            .into_json()
            .map_err(|err| TransportError::retryable(format!("schema listing could not be decoded: {err}")))?;
        let Some(definitions) = spec.get("definitions").and_then(Value::as_object) else {
            return Err(TransportError::fatal("schema listing has no `definitions` object"));
        };
        Ok(definitions.keys().cloned().collect())
    }
}
