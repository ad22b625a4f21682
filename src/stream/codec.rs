//! Reply parsing for Redis Streams commands
//!
//! redis-rs hands stream replies back as nested [`redis::Value`] trees whose
//! shape varies by server version and by whether a blocking read timed out.
//! Typed `FromRedisValue` conversions reject several of those shapes, so the
//! consumer queries raw values and parses them here. Malformed elements are
//! skipped rather than failing the whole batch.

use redis::Value;
use std::collections::HashMap;

/// One stream entry: its ID plus its flat field/value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(status) => Some(status.clone()),
        _ => None,
    }
}

/// Parse a single `[id, [field, value, ...]]` entry
pub fn parse_entry(value: &Value) -> Option<StreamEntry> {
    let Value::Bulk(parts) = value else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }

    let id = value_to_string(&parts[0])?;
    let Value::Bulk(raw_fields) = &parts[1] else {
        return None;
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [key, val] = chunk {
            if let (Some(key), Some(val)) = (value_to_string(key), value_to_string(val)) {
                fields.insert(key, val);
            }
        }
    }

    Some(StreamEntry { id, fields })
}

/// Parse a flat entry list, as returned by XRANGE
pub fn parse_entries(value: &Value) -> Vec<StreamEntry> {
    match value {
        Value::Bulk(items) => items.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// Parse an XREADGROUP reply, returning the entries for `stream_key`
///
/// Reply shape is `[[stream_key, [entry, ...]], ...]`, or `Nil` when the
/// blocking read timed out with nothing to deliver.
pub fn parse_xreadgroup_reply(value: &Value, stream_key: &str) -> Vec<StreamEntry> {
    let Value::Bulk(streams) = value else {
        return Vec::new();
    };

    for stream in streams {
        let Value::Bulk(parts) = stream else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        match value_to_string(&parts[0]) {
            Some(key) if key == stream_key => return parse_entries(&parts[1]),
            _ => {}
        }
    }

    Vec::new()
}

/// Parse an XAUTOCLAIM reply into `(next_cursor, claimed_entries)`
///
/// Redis 6.2 replies `[cursor, entries]`; 7.0 appends a third element listing
/// IDs deleted from the stream, which is ignored here. A `0-0` cursor means
/// the scan wrapped around.
pub fn parse_xautoclaim_reply(value: &Value) -> (String, Vec<StreamEntry>) {
    let Value::Bulk(parts) = value else {
        return ("0-0".to_string(), Vec::new());
    };
    if parts.len() < 2 {
        return ("0-0".to_string(), Vec::new());
    }

    let cursor = value_to_string(&parts[0]).unwrap_or_else(|| "0-0".to_string());
    (cursor, parse_entries(&parts[1]))
}

/// Parse a detailed XPENDING reply into message ID -> delivery count
///
/// Each element is `[id, consumer, idle_ms, delivery_count]`.
pub fn parse_pending_counts(value: &Value) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    let Value::Bulk(rows) = value else {
        return counts;
    };

    for row in rows {
        let Value::Bulk(parts) = row else {
            continue;
        };
        if parts.len() < 4 {
            continue;
        }
        let Some(id) = value_to_string(&parts[0]) else {
            continue;
        };
        if let Value::Int(delivery_count) = parts[3] {
            counts.insert(id, delivery_count.max(0) as u64);
        }
    }

    counts
}
