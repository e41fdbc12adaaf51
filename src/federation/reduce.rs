//! Compression and reduction of fan-out query results
//!
//! Non-root nodes compress each matching thing to `{thing_id, _query_data}`
//! before returning it upward; only the query origin runs the final
//! reduction. Reductions over time-series data are time-weighted: a datum
//! represents a value held constant over its `[start, end]` interval.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::client::PeerClient;
use super::query::{lookup_path, Operation, TimeRange};

/// One time-series datum: a value held over an interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub data: f64,
    pub start: f64,
    pub end: f64,
}

/// The compressed form of a thing: its id plus the extracted datum values.
/// COUNT queries carry no data at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedThing {
    pub thing_id: String,
    #[serde(rename = "_query_data", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Datum>>,
}

/// A remote segment of a record's time series, fetched on demand
#[derive(Debug, Clone, Deserialize)]
struct RemoteForm {
    url: String,
    start: f64,
    end: f64,
}

/// Clip a datum against the requested window. Fully outside -> dropped,
/// fully inside -> unchanged, overlapping -> clipped to the intersection.
pub fn clip(datum: &Datum, range: TimeRange) -> Option<Datum> {
    let lo = range.start.unwrap_or(f64::NEG_INFINITY);
    let hi = range.end.unwrap_or(f64::INFINITY);
    let start = datum.start.max(lo);
    let end = datum.end.min(hi);
    if start > end {
        return None;
    }
    // an interval clipped down to a point is gone; an originally
    // zero-width datum inside the window survives
    if start == end && datum.start != datum.end {
        return None;
    }
    Some(Datum {
        data: datum.data,
        start,
        end,
    })
}

/// Clip a datum list against the requested window
pub fn clip_time_range(data: &[Datum], range: TimeRange) -> Vec<Datum> {
    data.iter().filter_map(|d| clip(d, range)).collect()
}

/// Compress one flat thing document for an aggregation query.
///
/// Walks the dotted `data_path` and accepts three shapes: an inline datum
/// array, an object carrying inline `data` plus remote `forms` segments, or
/// a bare number (treated as a zero-width datum). Remote forms whose
/// coverage window intersects the requested range are fetched best-effort
/// and unioned with the inline data. Returns None (record dropped) when the
/// path cannot be resolved or nothing survives clipping.
pub async fn compress(
    client: &PeerClient,
    document: &Value,
    operation: Operation,
    data_path: Option<&str>,
    range: TimeRange,
) -> Option<CompressedThing> {
    let thing_id = document.get("thing_id")?.as_str()?.to_string();

    if operation == Operation::Count {
        return Some(CompressedThing {
            thing_id,
            data: None,
        });
    }

    // already-compressed intermediates from a child pass straight through
    // (re-clipping is idempotent)
    if let Some(existing) = document.get("_query_data") {
        let data: Vec<Datum> = serde_json::from_value(existing.clone()).ok()?;
        let clipped = clip_time_range(&data, range);
        if clipped.is_empty() {
            return None;
        }
        return Some(CompressedThing {
            thing_id,
            data: Some(clipped),
        });
    }

    let field = lookup_path(document, data_path?)?;
    let mut data = extract_inline(field)?;
    if let Some(forms) = field.get("forms") {
        fetch_forms(client, forms, range, &mut data).await;
    }

    let clipped = clip_time_range(&data, range);
    if clipped.is_empty() {
        debug!(thing_id = %thing_id, "record dropped: no data in requested window");
        return None;
    }
    Some(CompressedThing {
        thing_id,
        data: Some(clipped),
    })
}

/// Inline data at the resolved path: a datum array, an object with a `data`
/// array (and possibly `forms`), or a bare number
fn extract_inline(field: &Value) -> Option<Vec<Datum>> {
    match field {
        Value::Array(_) => serde_json::from_value(field.clone()).ok(),
        Value::Object(map) => match map.get("data") {
            Some(inline) => serde_json::from_value(inline.clone()).ok(),
            None if map.contains_key("forms") => Some(Vec::new()),
            None => None,
        },
        Value::Number(n) => {
            let v = n.as_f64()?;
            Some(vec![Datum {
                data: v,
                start: 0.0,
                end: 0.0,
            }])
        }
        _ => None,
    }
}

/// Fetch remote form segments that overlap the requested window.
/// A form that fails to fetch or parse is skipped.
async fn fetch_forms(client: &PeerClient, forms: &Value, range: TimeRange, data: &mut Vec<Datum>) {
    let forms: Vec<RemoteForm> = match serde_json::from_value(forms.clone()) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };
    let lo = range.start.unwrap_or(f64::NEG_INFINITY);
    let hi = range.end.unwrap_or(f64::INFINITY);
    for form in forms {
        if form.end < lo || form.start > hi {
            continue;
        }
        match client.get_json(&form.url).await {
            Ok(body) => match serde_json::from_value::<Vec<Datum>>(body) {
                Ok(remote) => data.extend(remote),
                Err(e) => warn!(url = %form.url, error = %e, "remote form returned malformed data"),
            },
            Err(e) => warn!(url = %form.url, error = %e, "remote form fetch failed, skipping"),
        }
    }
}

/// Final reduction over the merged compressed list.
///
/// COUNT ignores values. MIN/MAX take the unweighted extremum. SUM is
/// time-weighted: each datum contributes `value * (end - start)`. AVG divides
/// the weighted sum by `record count * (max end - min start)`; a degenerate
/// merged span yields "unknown" instead of a division error.
pub fn reduce(things: &[CompressedThing], operation: Operation) -> Value {
    if operation == Operation::Count {
        return json!({"operation": "COUNT", "result": things.len()});
    }

    let data: Vec<Datum> = things
        .iter()
        .filter_map(|t| t.data.as_deref())
        .flatten()
        .copied()
        .collect();
    if data.is_empty() {
        return unknown(operation);
    }

    let result = match operation {
        Operation::Count => unreachable!(),
        Operation::Min => data.iter().map(|d| d.data).fold(f64::INFINITY, f64::min),
        Operation::Max => data.iter().map(|d| d.data).fold(f64::NEG_INFINITY, f64::max),
        Operation::Sum => weighted_sum(&data),
        Operation::Avg => {
            let span = data.iter().map(|d| d.end).fold(f64::NEG_INFINITY, f64::max)
                - data.iter().map(|d| d.start).fold(f64::INFINITY, f64::min);
            let denominator = things.len() as f64 * span;
            if denominator <= 0.0 {
                return unknown(operation);
            }
            weighted_sum(&data) / denominator
        }
    };
    json!({"operation": operation.as_str(), "result": result})
}

fn weighted_sum(data: &[Datum]) -> f64 {
    data.iter().map(|d| d.data * (d.end - d.start)).sum()
}

fn unknown(operation: Operation) -> Value {
    json!({"operation": operation.as_str(), "result": "unknown"})
}
