//! Response normalization: provider-specific payloads to canonical records.

use crate::providers::{FieldKind, FieldMapping};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Pulls the record list out of a response.
///
/// With an `items_path` pointer the array found there is returned; without one
/// an array body is the list and an object body is a single record. Missing or
/// null yields no records.
pub fn extract_records(raw: &Value, items_path: Option<&str>) -> Vec<Value> {
    let target = match items_path {
        Some(pointer) => raw.pointer(pointer),
        None => Some(raw),
    };

    match target {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

/// Applies a canonical field mapping to one record.
///
/// Canonical fields are added next to the provider's own fields; a canonical
/// field with no present source is set to `null` so consumers can rely on it.
pub fn normalize_record(record: &Value, fields: &BTreeMap<String, FieldMapping>) -> Value {
    if fields.is_empty() {
        return record.clone();
    }

    let mut out = match record {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };

    for (canonical, mapping) in fields {
        let found = mapping
            .sources()
            .iter()
            .filter_map(|source| lookup(record, source))
            .find(|v| !v.is_null());

        let value = found
            .and_then(|v| coerce(v, mapping.kind()))
            .unwrap_or(Value::Null);
        out.insert(canonical.clone(), value);
    }

    Value::Object(out)
}

/// `source` is a top-level key, a dotted path (`stock.available`) or a JSON pointer.
fn lookup<'a>(record: &'a Value, source: &str) -> Option<&'a Value> {
    if source.starts_with('/') {
        return record.pointer(source);
    }
    source
        .split('.')
        .try_fold(record, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn coerce(value: &Value, kind: FieldKind) -> Option<Value> {
    match kind {
        FieldKind::Any => Some(value.clone()),
        FieldKind::String => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        FieldKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        FieldKind::Decimal => match value {
            Value::Number(n) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            _ => None,
        },
    }
}
