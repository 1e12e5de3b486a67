//! Conversion between runtime values and the wire's JSON form.
//!
//! Outbound dates and arbitrary-precision decimals travel as tagged strings
//! (`[__QOOXDOO_SERVER_OBJECTS__[Date(...)]]`); inbound they arrive either
//! tagged or as `{"$date": ...}` / `{"$numberDecimal": ...}` objects. Server
//! objects arrive as `{serverId, clazz, values, ...}` and are resolved
//! through the object store, creating proxies on first sight.

use std::collections::BTreeMap;

use log::{error, warn};
use serde::Deserialize;
use serde_json::{Map, Number, Value as Json};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::data::session::SessionInner;
use crate::data::{ClassRef, ContainerKind, Decimal, ProxyList, ProxyMap, ProxyObject, Timestamp};
use crate::protocol::{SERVER_OBJECTS_PREFIX, SERVER_OBJECTS_SUFFIX};
use crate::{Error, Result, Value};

/// `yyyy-MM-ddTHH:mm:ss.SSSZ` in UTC
pub fn format_date(date: &Timestamp) -> String {
    let utc = date.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}

pub fn parse_date(text: &str) -> Result<Timestamp> {
    OffsetDateTime::parse(text.trim(), &Rfc3339).map_err(|e| Error::Decode(format!("Invalid date {:?}: {}", text, e)))
}

fn date_from_millis(millis: i64) -> Result<Timestamp> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| Error::Decode(format!("Invalid date {}: {}", millis, e)))
}

fn tag(body: String) -> String {
    format!("{}{}{}", SERVER_OBJECTS_PREFIX, body, SERVER_OBJECTS_SUFFIX)
}

pub fn encode_date(date: &Timestamp) -> String {
    tag(format!("Date({})", format_date(date)))
}

pub fn encode_decimal(decimal: &Decimal) -> String {
    tag(format!("BigNumber({})", decimal.as_str()))
}

/// Recognizes a tagged string; anything else is returned as plain text.
fn decode_tagged(text: &str) -> Result<Value> {
    let inner = match text
        .strip_prefix(SERVER_OBJECTS_PREFIX)
        .and_then(|rest| rest.strip_suffix(SERVER_OBJECTS_SUFFIX))
    {
        Some(inner) => inner,
        None => return Ok(Value::from_string(text)),
    };
    if let Some(date) = inner.strip_prefix("Date(").and_then(|r| r.strip_suffix(')')) {
        return Ok(Value::Date(parse_date(date)?));
    }
    if let Some(number) = inner.strip_prefix("BigNumber(").and_then(|r| r.strip_suffix(')')) {
        return Ok(Value::Decimal(Decimal::parse(number)?));
    }
    Err(Error::Decode(format!("Unrecognized tagged value {:?}", text)))
}

fn decode_number(n: &Number) -> Value {
    match n.as_i64() {
        Some(i) => Value::Int(i),
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

/// Decodes a value that cannot contain server objects.
pub fn decode_scalar(wire: &Json) -> Result<Option<Value>> {
    Ok(Some(match wire {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => decode_number(n),
        Json::String(s) => decode_tagged(s)?,
        _ => return Ok(None),
    }))
}

fn is_flat(items: &[Json]) -> bool {
    items.iter().all(|i| !matches!(i, Json::Array(_) | Json::Object(_)))
}

/// Encodes a value for the wire. Pending objects not yet announced get their
/// `new` command queued ahead of whatever refers to them.
pub(crate) fn encode_value(session: &SessionInner, value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => match Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            None => {
                warn!("Cannot encode non-finite number {}; sending null", f);
                Json::Null
            }
        },
        Value::String(s) => Json::String(s.as_str().to_string()),
        Value::Date(d) => Json::String(encode_date(d)),
        Value::Decimal(d) => Json::String(encode_decimal(d)),
        Value::Array(items) => Json::Array(items.iter().map(|v| encode_value(session, v)).collect()),
        Value::Record(fields) => Json::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), encode_value(session, v)))
                .collect(),
        ),
        Value::List(list) => {
            if session.is_building() {
                session.queue.borrow_mut().clear_dirty(list.id());
            }
            Json::Array(list.to_vec().iter().map(|v| encode_value(session, v)).collect())
        }
        Value::Map(map) => {
            if session.is_building() {
                session.queue.borrow_mut().clear_dirty(map.id());
            }
            encode_map_entries(session, &map.entries())
        }
        Value::Object(obj) => encode_object(session, obj),
        Value::Notify(_) => {
            error!("Completion handles cannot be sent to the server; sending null");
            Json::Null
        }
    }
}

/// An object when every key is a string, `[{key, value}]` otherwise
pub(crate) fn encode_map_entries(session: &SessionInner, entries: &[(Value, Value)]) -> Json {
    if entries.iter().all(|(k, _)| k.is_string()) {
        let mut out = Map::new();
        for (k, v) in entries {
            if let Some(key) = k.as_string() {
                out.insert(key.to_string(), encode_value(session, v));
            }
        }
        Json::Object(out)
    } else {
        Json::Array(
            entries
                .iter()
                .map(|(k, v)| {
                    let mut entry = Map::new();
                    entry.insert("key".to_string(), encode_value(session, k));
                    entry.insert("value".to_string(), encode_value(session, v));
                    Json::Object(entry)
                })
                .collect(),
        )
    }
}

fn encode_object(session: &SessionInner, obj: &ProxyObject) -> Json {
    if obj.is_disposed() {
        error!("Cannot send disposed {:?}; sending null", obj);
        return Json::Null;
    }
    if obj.is_pending() && !obj.is_sent() {
        session.announce(obj);
    }
    Json::from(obj.id())
}

/// Decodes a wire value, resolving and creating server objects as needed.
pub(crate) fn decode_value(session: &SessionInner, wire: &Json) -> Result<Value> {
    if let Some(v) = decode_scalar(wire)? {
        return Ok(v);
    }
    match wire {
        Json::Array(items) if is_flat(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_scalar(item)?.unwrap_or(Value::Null));
            }
            Ok(Value::Array(out))
        }
        Json::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|i| decode_value(session, i))
                .collect::<Result<Vec<_>>>()?,
        )),
        Json::Object(fields) => {
            if fields.contains_key("serverId") {
                return read_server_object(session, fields).map(Value::Object);
            }
            if let Some(date) = fields.get("$date") {
                return Ok(Value::Date(match date {
                    Json::String(s) => parse_date(s)?,
                    Json::Number(n) => date_from_millis(n.as_i64().unwrap_or_default())?,
                    other => return Err(Error::Decode(format!("Invalid $date {}", other))),
                }));
            }
            if let Some(decimal) = fields.get("$numberDecimal") {
                return match decimal {
                    Json::String(s) => Ok(Value::Decimal(Decimal::parse(s)?)),
                    Json::Number(n) => Ok(Value::Decimal(Decimal::parse(&n.to_string())?)),
                    other => Err(Error::Decode(format!("Invalid $numberDecimal {}", other))),
                };
            }
            let mut record = BTreeMap::new();
            for (k, v) in fields {
                record.insert(k.clone(), decode_value(session, v)?);
            }
            Ok(Value::Record(record))
        }
        other => Ok(decode_scalar(other)?.unwrap_or(Value::Null)),
    }
}

/// Wraps a decoded array or record in the container a method or property
/// declares.
pub(crate) fn wrap_container(value: Value, container: ContainerKind) -> Result<Value> {
    match (container, value) {
        (ContainerKind::WrappedList, Value::Array(items)) => Ok(Value::List(ProxyList::from_vec(items))),
        (ContainerKind::WrappedMap, Value::Record(fields)) => Ok(Value::Map(ProxyMap::from_entries(
            fields.into_iter().map(|(k, v)| (Value::from_string(k), v)).collect(),
        ))),
        (ContainerKind::WrappedMap, Value::Array(items)) => {
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Record(mut entry) => entries.push((
                        entry.remove("key").unwrap_or(Value::Null),
                        entry.remove("value").unwrap_or(Value::Null),
                    )),
                    other => {
                        return Err(Error::Decode(format!("Expected a map entry, got {}", other.type_name())));
                    }
                }
            }
            Ok(Value::Map(ProxyMap::from_entries(entries)))
        }
        (_, value) => Ok(value),
    }
}

fn read_server_object(session: &SessionInner, fields: &Map<String, Json>) -> Result<ProxyObject> {
    let id = fields
        .get("serverId")
        .and_then(Json::as_i64)
        .ok_or_else(|| Error::Decode(format!("Invalid serverId {:?}", fields.get("serverId"))))?;

    let existing = session.store.borrow().get_or_null(id)?;
    let obj = match existing {
        Some(obj) => obj,
        None => {
            let clazz = fields
                .get("clazz")
                .filter(|c| !c.is_null())
                .ok_or(Error::UnresolvedReference(id))?;
            let class_ref = ClassRef::deserialize(clazz)?;
            let class = session
                .registry
                .borrow_mut()
                .resolve_or_create(&class_ref)?
                .ok_or_else(|| {
                    Error::Protocol(format!(
                        "Object {} is an instance of {} which is still being defined",
                        id,
                        class_ref.name()
                    ))
                })?;
            let constructor_args = match fields.get("constructorArgs") {
                Some(Json::Array(args)) => args
                    .iter()
                    .map(|a| decode_value(session, a))
                    .collect::<Result<Vec<_>>>()?,
                _ => Vec::new(),
            };
            let obj = ProxyObject::new(class, session.weak(), constructor_args);
            obj.assign_id(id);
            obj.mark_sent();
            session.store.borrow_mut().register_server(id, &obj)?;
            obj.init_defaults();
            session.stats.borrow_mut().objects_created += 1;
            obj
        }
    };

    if let Some(Json::Object(values)) = fields.get("values") {
        for name in value_order(fields.get("order"), values) {
            let Some(wire) = values.get(&name) else {
                continue;
            };
            let value = decode_value(session, wire)?;
            match obj.apply_server_value(&name, value) {
                Ok(_) => {}
                Err(e @ Error::UnknownProperty { .. }) => warn!("Ignoring value for {:?}: {}", obj, e),
                Err(e) => return Err(e),
            }
        }
    }

    if let Some(Json::Object(prefetch)) = fields.get("prefetch") {
        for (method, wire) in prefetch {
            let value = decode_value(session, wire)?;
            let container = obj
                .class()
                .method(method)
                .map_or(ContainerKind::None, |m| m.return_container);
            obj.cache_result(method, wrap_container(value, container)?);
        }
    }

    Ok(obj)
}

/// `uuid` first, then the server's `order`, then anything else present
pub(crate) fn value_order(order: Option<&Json>, values: &Map<String, Json>) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(values.len());
    if values.contains_key("uuid") {
        names.push("uuid".to_string());
    }
    if let Some(Json::Array(order)) = order {
        for name in order.iter().filter_map(Json::as_str) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    for name in values.keys() {
        if !names.iter().any(|n| n == name) {
            names.push(name.clone());
        }
    }
    names
}
