//! Cursor-following aggregation of paginated API results.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use pulse_core::{Page, PageCursor};
use pulse_storage::{FetchError, JsonRequest, JsonTransport};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    /// Numeric start index; `first_index` is what the API expects for the first page.
    Offset { first_index: u64 },
    /// Opaque continuation token (or next-page URL) returned with each page.
    Token,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    fn style(&self) -> PaginationStyle;

    /// Fetches one page. `None` requests the first page.
    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<Self::Item>, FetchError>;

    /// Completes an item before it is accumulated, e.g. by following its nested pages.
    async fn materialize(&self, _item: &mut Self::Item) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Follows continuation until the source is exhausted and returns every row in server order.
///
/// Any page failure aborts the whole fetch; rows gathered so far are dropped.
pub async fn fetch_all<S>(source: &S) -> Result<Vec<S::Item>, FetchError>
where
    S: PageSource + ?Sized,
{
    let style = source.style();
    let mut rows = Vec::new();
    let mut cursor: Option<PageCursor> = None;
    let mut page_number = 0usize;

    loop {
        page_number += 1;
        let page = source.fetch_page(cursor.as_ref()).await?;
        let returned = page.rows.len() as u64;
        debug!(page = page_number, rows = returned, total = ?page.reported_total, "fetched page");

        for mut item in page.rows {
            source.materialize(&mut item).await?;
            rows.push(item);
        }

        let next = match style {
            PaginationStyle::Token => match page.next_cursor {
                Some(next) if Some(&next) == cursor.as_ref() => {
                    return Err(FetchError::Malformed {
                        url: format!("page {page_number}"),
                        reason: "continuation token repeated".to_string(),
                    });
                }
                next => next,
            },
            PaginationStyle::Offset { first_index } => {
                let start = match cursor {
                    Some(PageCursor::Offset(start)) => start,
                    _ => first_index,
                };
                let new_start = start + returned;
                match page.reported_total {
                    Some(total) if returned > 0 && total > new_start - first_index => {
                        Some(PageCursor::Offset(new_start))
                    }
                    _ => None,
                }
            }
        };

        match next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(rows)
}

type DrainFuture<'a> = Pin<Box<dyn Future<Output = Result<(), FetchError>> + Send + 'a>>;

/// Walks `value` and completes every `{ "data": [...], "paging": { "next": url } }`
/// collection by following its next links, appending sub-pages to `data` in order.
/// Drained elements are walked as well. The `next` link is removed once exhausted.
pub fn drain_nested<'a>(
    transport: &'a dyn JsonTransport,
    source_id: &'a str,
    value: &'a mut JsonValue,
) -> DrainFuture<'a> {
    Box::pin(async move {
        match value {
            JsonValue::Object(map) => {
                if let Some(next) = nested_next_link(map) {
                    follow_links(transport, source_id, map, next).await?;
                }
                for child in map.values_mut() {
                    drain_nested(transport, source_id, child).await?;
                }
            }
            JsonValue::Array(items) => {
                for item in items.iter_mut() {
                    drain_nested(transport, source_id, item).await?;
                }
            }
            _ => {}
        }
        Ok(())
    })
}

fn nested_next_link(map: &Map<String, JsonValue>) -> Option<String> {
    if !map.get("data").is_some_and(JsonValue::is_array) {
        return None;
    }
    map.get("paging")?
        .get("next")?
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

async fn follow_links(
    transport: &dyn JsonTransport,
    source_id: &str,
    map: &mut Map<String, JsonValue>,
    mut next: String,
) -> Result<(), FetchError> {
    let mut sub_page = 0usize;
    loop {
        sub_page += 1;
        let mut page = transport.get_json(&JsonRequest::new(source_id, next.as_str())).await?;
        let more = match page.get_mut("data").map(JsonValue::take) {
            Some(JsonValue::Array(more)) => more,
            _ => Vec::new(),
        };
        debug!(sub_page, rows = more.len(), "drained nested page");
        if let Some(JsonValue::Array(data)) = map.get_mut("data") {
            data.extend(more);
        }

        match page.pointer("/paging/next").and_then(JsonValue::as_str) {
            Some(url) if url == next => {
                return Err(FetchError::Malformed {
                    url: pulse_storage::redact_query(url),
                    reason: "nested next link repeated".to_string(),
                });
            }
            Some(url) if !url.is_empty() => next = url.to_string(),
            _ => break,
        }
    }

    if let Some(JsonValue::Object(paging)) = map.get_mut("paging") {
        paging.remove("next");
    }
    Ok(())
}
