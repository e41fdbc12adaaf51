//! Custom aggregation query scripts
//!
//! The `/custom_query` wire format is a small JSON script. It is parsed into
//! typed values here at the boundary; the engine never handles raw maps.

use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::abac::providers::point_in_polygon;
use crate::types::{DirectoryError, Result};

/// Aggregation operation of a custom query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }
}

impl TryFrom<String> for Operation {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        match raw.to_uppercase().as_str() {
            "SUM" => Ok(Self::Sum),
            "AVG" => Ok(Self::Avg),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "COUNT" => Ok(Self::Count),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

/// Requested time window, both bounds optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

/// Structured filter predicate: an optional geographic polygon plus
/// dotted-path equality conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    /// Polygon vertices; matched against `properties.geo.coordinates`
    pub polygon: Option<Vec<[f64; 2]>>,
    /// Dotted field path -> expected value
    pub equals: Vec<(String, Value)>,
}

impl QueryFilter {
    fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let mut filter = QueryFilter::default();
        for (key, value) in map {
            if key == "polygon" {
                filter.polygon = Some(parse_polygon(value)?);
            } else {
                filter.equals.push((key.clone(), value.clone()));
            }
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.polygon.is_none() && self.equals.is_empty()
    }

    /// Whether a flat thing document satisfies every condition
    pub fn matches(&self, document: &Value) -> bool {
        for (path, expected) in &self.equals {
            if lookup_path(document, path) != Some(expected) {
                return false;
            }
        }
        if let Some(polygon) = &self.polygon {
            let Some(point) = coordinates_of(document) else {
                return false;
            };
            if !point_in_polygon(point, polygon) {
                return false;
            }
        }
        true
    }
}

fn parse_polygon(value: &Value) -> Result<Vec<[f64; 2]>> {
    let vertices: Vec<[f64; 2]> = value
        .as_array()
        .map(|points| {
            points
                .iter()
                .filter_map(|p| {
                    let pair = p.as_array()?;
                    Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
                })
                .collect()
        })
        .unwrap_or_default();
    if vertices.len() < 3 || vertices.len() != value.as_array().map(|a| a.len()).unwrap_or(0) {
        return Err(DirectoryError::BadRequest(
            "filter condition error: polygon must be a list of at least 3 [x, y] points"
                .to_string(),
        ));
    }
    Ok(vertices)
}

fn coordinates_of(document: &Value) -> Option<[f64; 2]> {
    let coords = lookup_path(document, "properties.geo.coordinates")?.as_array()?;
    Some([coords.first()?.as_f64()?, coords.get(1)?.as_f64()?])
}

impl Serialize for QueryFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.equals.len() + usize::from(self.polygon.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(polygon) = &self.polygon {
            map.serialize_entry("polygon", polygon)?;
        }
        for (path, value) in &self.equals {
            map.serialize_entry(path, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for QueryFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::deserialize(deserializer)?;
        Self::from_map(&map).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// A parsed `/custom_query` script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryScript {
    pub operation: Operation,
    #[serde(rename = "type")]
    pub thing_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryFilter>,
    /// Dotted path to the datum field (required for everything but COUNT)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    /// Set on every hop below the query origin; such nodes return the
    /// compressed intermediate list instead of a final reduction
    #[serde(rename = "_sub_dir", default, skip_serializing_if = "std::ops::Not::not")]
    pub sub_dir: bool,
}

impl QueryScript {
    /// Parse and validate the raw `data=` query parameter
    pub fn parse(raw: &str) -> Result<Self> {
        let script: QueryScript = serde_json::from_str(raw)
            .map_err(|e| DirectoryError::BadRequest(format!("invalid query script: {}", e)))?;
        if script.thing_type.trim().is_empty() {
            return Err(DirectoryError::BadRequest("query script requires a type".to_string()));
        }
        if script.operation != Operation::Count && script.data.is_none() {
            return Err(DirectoryError::BadRequest(format!(
                "{} requires a data field path",
                script.operation.as_str()
            )));
        }
        Ok(script)
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }

    /// The script to fan out to children: `_sub_dir` set, `location` removed
    /// so each child treats itself as the target.
    pub fn for_children(&self) -> Self {
        let mut script = self.clone();
        script.sub_dir = true;
        script.location = None;
        script
    }
}

/// Walk a dotted field path through a JSON document
pub fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_lowercases_operation_and_requires_data() {
        let script = QueryScript::parse(r#"{"operation": "avg", "type": "sensor", "data": "properties.temp"}"#)
            .unwrap();
        assert_eq!(script.operation, Operation::Avg);

        assert!(QueryScript::parse(r#"{"operation": "SUM", "type": "sensor"}"#).is_err());
        assert!(QueryScript::parse(r#"{"operation": "COUNT", "type": "sensor"}"#).is_ok());
        assert!(QueryScript::parse(r#"{"operation": "MEDIAN", "type": "sensor", "data": "x"}"#).is_err());
    }

    #[test]
    fn test_for_children_marks_sub_dir_and_drops_location() {
        let script = QueryScript::parse(
            r#"{"operation": "COUNT", "type": "sensor", "location": "level1"}"#,
        )
        .unwrap();
        let child = script.for_children();
        assert!(child.sub_dir);
        assert!(child.location.is_none());

        let wire = serde_json::to_value(&child).unwrap();
        assert_eq!(wire["_sub_dir"], json!(true));
        assert!(wire.get("location").is_none());
    }

    #[test]
    fn test_filter_equality_on_dotted_path() {
        let filter: QueryFilter =
            serde_json::from_value(json!({"properties.room": "kitchen"})).unwrap();
        assert!(filter.matches(&json!({"properties": {"room": "kitchen"}})));
        assert!(!filter.matches(&json!({"properties": {"room": "attic"}})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn test_filter_polygon_against_geo_coordinates() {
        let filter: QueryFilter = serde_json::from_value(
            json!({"polygon": [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]}),
        )
        .unwrap();
        let inside = json!({"properties": {"geo": {"coordinates": [5.0, 5.0]}}});
        let outside = json!({"properties": {"geo": {"coordinates": [15.0, 5.0]}}});
        assert!(filter.matches(&inside));
        assert!(!filter.matches(&outside));
        // no coordinates at all -> filtered out
        assert!(!filter.matches(&json!({"properties": {}})));
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let result: std::result::Result<QueryFilter, _> =
            serde_json::from_value(json!({"polygon": [[0.0, 0.0], [1.0, 1.0]]}));
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_round_trips_for_forwarding() {
        let original = json!({"polygon": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]], "properties.room": "kitchen"});
        let filter: QueryFilter = serde_json::from_value(original).unwrap();
        let wire = serde_json::to_value(&filter).unwrap();
        let reparsed: QueryFilter = serde_json::from_value(wire).unwrap();
        assert_eq!(filter, reparsed);
    }
}
