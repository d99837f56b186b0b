//! Generic JSON API source shapes: offset-indexed, token-continued and link-followed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::{DateRange, Page, PageCursor};
use pulse_storage::{redact_query, FetchError, JsonRequest, JsonTransport};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::paginate::{drain_nested, PageSource, PaginationStyle};

/// Request fields shared by every source kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON pointer to the rows of a page. An object there is a single row.
    #[serde(default)]
    pub rows: Option<String>,
    #[serde(default)]
    pub start_date_param: Option<String>,
    #[serde(default)]
    pub end_date_param: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Batch lookup merged into every page before it is returned.
    #[serde(default)]
    pub enrich: Option<EnrichSpec>,
}

/// Detail lookup issued once per page: the ids of the page rows go out in one request
/// and each detail record is merged into the row carrying its id.
///
/// Rows without a detail record are returned unchanged, so offset arithmetic still
/// counts the rows the listing API returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichSpec {
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON pointer to the id inside a page row, e.g. `/id/videoId`.
    pub id: String,
    /// Request parameter receiving the comma-joined ids.
    #[serde(default = "default_id_param")]
    pub id_param: String,
    /// JSON pointer to the detail records in the lookup response.
    #[serde(default = "default_enrich_rows_pointer")]
    pub rows: String,
    /// JSON pointer to the id inside a detail record.
    #[serde(default = "default_enrich_key_pointer")]
    pub key: String,
}

impl RequestSpec {
    fn first_request(&self, source_id: &str, range: &DateRange) -> JsonRequest {
        let mut query: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if let Some(param) = &self.start_date_param {
            query.push((param.clone(), range.start.format("%Y-%m-%d").to_string()));
        }
        if let Some(param) = &self.end_date_param {
            query.push((param.clone(), range.end.format("%Y-%m-%d").to_string()));
        }
        JsonRequest::new(source_id, self.url.as_str())
            .with_query(query)
            .with_bearer(self.bearer_token.clone())
    }

    fn rows_pointer<'a>(&'a self, default: &'a str) -> &'a str {
        self.rows.as_deref().unwrap_or(default)
    }

    /// Applies `map` to every string field, e.g. to expand credential placeholders.
    pub fn map_strings(&mut self, mut map: impl FnMut(&str) -> String) {
        self.url = map(&self.url);
        for value in self.params.values_mut() {
            *value = map(value);
        }
        if let Some(token) = &mut self.bearer_token {
            *token = map(token);
        }
        if let Some(enrich) = &mut self.enrich {
            enrich.url = map(&enrich.url);
            for value in enrich.params.values_mut() {
                *value = map(value);
            }
        }
    }
}

fn default_id_param() -> String {
    "id".to_string()
}

fn default_enrich_rows_pointer() -> String {
    "/items".to_string()
}

fn default_enrich_key_pointer() -> String {
    "/id".to_string()
}

fn default_start_param() -> String {
    "start-index".to_string()
}

fn default_size_param() -> String {
    "max-results".to_string()
}

fn default_page_size() -> u64 {
    10_000
}

fn default_first_index() -> u64 {
    1
}

fn default_total_pointer() -> String {
    "/totalResults".to_string()
}

fn default_token_param() -> String {
    "pageToken".to_string()
}

fn default_next_token_pointer() -> String {
    "/nextPageToken".to_string()
}

fn default_next_link_pointer() -> String {
    "/paging/next".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetSpec {
    #[serde(flatten)]
    pub request: RequestSpec,
    #[serde(default = "default_start_param")]
    pub start_param: String,
    #[serde(default = "default_size_param")]
    pub size_param: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_first_index")]
    pub first_index: u64,
    /// JSON pointer to the server-reported total row count.
    #[serde(default = "default_total_pointer")]
    pub total: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpec {
    #[serde(flatten)]
    pub request: RequestSpec,
    #[serde(default = "default_token_param")]
    pub token_param: String,
    #[serde(default = "default_next_token_pointer")]
    pub next_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    #[serde(flatten)]
    pub request: RequestSpec,
    /// JSON pointer to the absolute URL of the next page.
    #[serde(default = "default_next_link_pointer")]
    pub next: String,
}

/// Declarative source block of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Offset(OffsetSpec),
    Token(TokenSpec),
    Link(LinkSpec),
}

impl SourceSpec {
    pub fn request(&self) -> &RequestSpec {
        match self {
            SourceSpec::Offset(spec) => &spec.request,
            SourceSpec::Token(spec) => &spec.request,
            SourceSpec::Link(spec) => &spec.request,
        }
    }

    pub fn request_mut(&mut self) -> &mut RequestSpec {
        match self {
            SourceSpec::Offset(spec) => &mut spec.request,
            SourceSpec::Token(spec) => &mut spec.request,
            SourceSpec::Link(spec) => &mut spec.request,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Offset(_) => "offset",
            SourceSpec::Token(_) => "token",
            SourceSpec::Link(_) => "link",
        }
    }

    /// Binds this source description to a transport and an extraction window.
    pub fn build(
        &self,
        transport: Arc<dyn JsonTransport>,
        source_id: &str,
        range: &DateRange,
    ) -> ApiSource {
        let base = self.request().first_request(source_id, range);
        match self {
            SourceSpec::Offset(spec) => ApiSource::Offset(OffsetApiSource {
                transport,
                base,
                rows: spec.request.rows_pointer("/rows").to_string(),
                spec: spec.clone(),
            }),
            SourceSpec::Token(spec) => ApiSource::Token(TokenApiSource {
                transport,
                base,
                rows: spec.request.rows_pointer("/items").to_string(),
                spec: spec.clone(),
            }),
            SourceSpec::Link(spec) => ApiSource::Link(LinkApiSource {
                transport,
                base,
                rows: spec.request.rows_pointer("/data").to_string(),
                spec: spec.clone(),
            }),
        }
    }
}

/// Takes the rows at `pointer` out of a decoded page.
fn take_rows(doc: &mut JsonValue, pointer: &str, url: &str) -> Result<Vec<JsonValue>, FetchError> {
    match doc.pointer_mut(pointer).map(JsonValue::take) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(rows)) => Ok(rows),
        Some(row @ JsonValue::Object(_)) => Ok(vec![row]),
        Some(other) => Err(FetchError::Malformed {
            url: redact_query(url),
            reason: format!("rows at `{pointer}` are neither a list nor an object: {other}"),
        }),
    }
}

/// Ids are matched as text so numeric and string ids join alike.
fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Applies the request's [`EnrichSpec`], if any, to one page of rows.
async fn enrich_rows(
    transport: &dyn JsonTransport,
    base: &JsonRequest,
    spec: Option<&EnrichSpec>,
    mut rows: Vec<JsonValue>,
) -> Result<Vec<JsonValue>, FetchError> {
    let Some(spec) = spec else {
        return Ok(rows);
    };
    let ids: Vec<String> = rows
        .iter()
        .filter_map(|row| row.pointer(&spec.id).and_then(id_text))
        .collect();
    if ids.is_empty() {
        return Ok(rows);
    }

    let mut query: Vec<(String, String)> = spec
        .params
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    query.push((spec.id_param.clone(), ids.join(",")));
    let request = JsonRequest::new(base.source_id.as_str(), spec.url.as_str())
        .with_query(query)
        .with_bearer(base.bearer_token.clone());

    let mut doc = transport.get_json(&request).await?;
    let mut details: HashMap<String, JsonValue> = take_rows(&mut doc, &spec.rows, &request.url)?
        .into_iter()
        .filter_map(|detail| Some((detail.pointer(&spec.key).and_then(id_text)?, detail)))
        .collect();

    let mut unmatched = 0usize;
    for row in &mut rows {
        let detail = row
            .pointer(&spec.id)
            .and_then(id_text)
            .and_then(|id| details.remove(&id));
        match (row.as_object_mut(), detail) {
            (Some(target), Some(JsonValue::Object(fields))) => target.extend(fields),
            _ => unmatched += 1,
        }
    }
    if unmatched > 0 {
        debug!(unmatched, url = %redact_query(&request.url), "rows without a detail record");
    }
    Ok(rows)
}

fn json_u64(value: &JsonValue) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn pointer_text(doc: &JsonValue, pointer: &str) -> Option<String> {
    doc.pointer(pointer)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Start-index paging with a reported total, e.g. analytics report APIs.
pub struct OffsetApiSource {
    transport: Arc<dyn JsonTransport>,
    base: JsonRequest,
    rows: String,
    spec: OffsetSpec,
}

#[async_trait]
impl PageSource for OffsetApiSource {
    type Item = JsonValue;

    fn style(&self) -> PaginationStyle {
        PaginationStyle::Offset {
            first_index: self.spec.first_index,
        }
    }

    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<JsonValue>, FetchError> {
        let start = match cursor {
            Some(PageCursor::Offset(start)) => *start,
            _ => self.spec.first_index,
        };
        let mut request = self.base.clone();
        request.query.push((self.spec.start_param.clone(), start.to_string()));
        request
            .query
            .push((self.spec.size_param.clone(), self.spec.page_size.to_string()));

        let mut doc = self.transport.get_json(&request).await?;
        let total = doc.pointer(&self.spec.total).and_then(json_u64);
        let rows = take_rows(&mut doc, &self.rows, &request.url)?;
        let rows = enrich_rows(self.transport.as_ref(), &self.base, self.spec.request.enrich.as_ref(), rows).await?;
        Ok(Page::new(rows).with_total(total))
    }
}

/// Next-page-token paging, e.g. video listing APIs.
pub struct TokenApiSource {
    transport: Arc<dyn JsonTransport>,
    base: JsonRequest,
    rows: String,
    spec: TokenSpec,
}

#[async_trait]
impl PageSource for TokenApiSource {
    type Item = JsonValue;

    fn style(&self) -> PaginationStyle {
        PaginationStyle::Token
    }

    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<JsonValue>, FetchError> {
        let mut request = self.base.clone();
        if let Some(PageCursor::Token(token)) = cursor {
            request.query.push((self.spec.token_param.clone(), token.clone()));
        }

        let mut doc = self.transport.get_json(&request).await?;
        let next = pointer_text(&doc, &self.spec.next_token).map(PageCursor::Token);
        let rows = take_rows(&mut doc, &self.rows, &request.url)?;
        let rows = enrich_rows(self.transport.as_ref(), &self.base, self.spec.request.enrich.as_ref(), rows).await?;
        Ok(Page::new(rows).with_next(next))
    }
}

/// Absolute next-URL paging with nested collections, e.g. social graph APIs.
pub struct LinkApiSource {
    transport: Arc<dyn JsonTransport>,
    base: JsonRequest,
    rows: String,
    spec: LinkSpec,
}

#[async_trait]
impl PageSource for LinkApiSource {
    type Item = JsonValue;

    fn style(&self) -> PaginationStyle {
        PaginationStyle::Token
    }

    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<JsonValue>, FetchError> {
        // Next links carry their own query string and are followed verbatim.
        let request = match cursor {
            Some(PageCursor::Token(url)) => JsonRequest::new(self.base.source_id.as_str(), url.as_str())
                .with_bearer(self.base.bearer_token.clone()),
            _ => self.base.clone(),
        };

        let mut doc = self.transport.get_json(&request).await?;
        let next = pointer_text(&doc, &self.spec.next).map(PageCursor::Token);
        let rows = take_rows(&mut doc, &self.rows, &request.url)?;
        let rows = enrich_rows(self.transport.as_ref(), &self.base, self.spec.request.enrich.as_ref(), rows).await?;
        Ok(Page::new(rows).with_next(next))
    }

    async fn materialize(&self, item: &mut JsonValue) -> Result<(), FetchError> {
        drain_nested(self.transport.as_ref(), &self.base.source_id, item).await
    }
}

/// Any of the declarative source kinds, bound and ready to paginate.
pub enum ApiSource {
    Offset(OffsetApiSource),
    Token(TokenApiSource),
    Link(LinkApiSource),
}

#[async_trait]
impl PageSource for ApiSource {
    type Item = JsonValue;

    fn style(&self) -> PaginationStyle {
        match self {
            ApiSource::Offset(source) => source.style(),
            ApiSource::Token(source) => source.style(),
            ApiSource::Link(source) => source.style(),
        }
    }

    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<JsonValue>, FetchError> {
        match self {
            ApiSource::Offset(source) => source.fetch_page(cursor).await,
            ApiSource::Token(source) => source.fetch_page(cursor).await,
            ApiSource::Link(source) => source.fetch_page(cursor).await,
        }
    }

    async fn materialize(&self, item: &mut JsonValue) -> Result<(), FetchError> {
        match self {
            ApiSource::Offset(source) => source.materialize(item).await,
            ApiSource::Token(source) => source.materialize(item).await,
            ApiSource::Link(source) => source.materialize(item).await,
        }
    }
}
