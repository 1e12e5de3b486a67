use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::data::{Notify, ProxyList, ProxyMap, ProxyObject, Timestamp};
use crate::{Error, Result};

/// Wrapper around Arc<String> that implements Serialize/Deserialize
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArcString(Arc<String>);

impl ArcString {
    pub fn new(s: String) -> Self {
        ArcString(Arc::new(s))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_inner(self) -> Arc<String> {
        self.0
    }
}

impl std::fmt::Display for ArcString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ArcString {
    fn from(s: String) -> Self {
        ArcString::new(s)
    }
}

impl From<&str> for ArcString {
    fn from(s: &str) -> Self {
        ArcString::new(s.to_string())
    }
}

impl Serialize for ArcString {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArcString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(ArcString(Arc::new(s)))
    }
}

impl Hash for ArcString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_str().hash(state);
    }
}

/// Arbitrary-precision decimal, carried as its canonical text so no digits
/// are lost between the two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal(ArcString);

impl Decimal {
    /// Accepts an optional sign, digits, an optional fraction and an optional exponent.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if !is_decimal_literal(trimmed) {
            return Err(Error::Decode(format!("Not a decimal number: {:?}", text)));
        }
        Ok(Decimal(ArcString::from(trimmed)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

fn is_decimal_literal(text: &str) -> bool {
    let body = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if int_part.is_empty() && frac_part.map_or(true, str::is_empty) {
        return false;
    }
    if !digits(int_part) || !frac_part.map_or(true, digits) {
        return false;
    }
    match exponent {
        Some(exp) => {
            let exp = exp.strip_prefix(['-', '+']).unwrap_or(exp);
            !exp.is_empty() && digits(exp)
        }
        None => true,
    }
}

/// A value as seen by application code.
///
/// Handle variants (`Object`, `List`, `Map`, `Notify`) compare by identity;
/// everything else compares structurally.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(ArcString),
    Date(Timestamp),
    Decimal(Decimal),
    /// Plain array, not observed
    Array(Vec<Value>),
    /// Plain object, not observed
    Record(BTreeMap<String, Value>),
    Object(ProxyObject),
    List(ProxyList),
    Map(ProxyMap),
    /// Completion target passed as a method argument
    Notify(Notify),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            (Value::Notify(a), Value::Notify(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::String(s) => write!(f, "String({:?})", s.as_str()),
            Value::Date(t) => write!(f, "Date({})", t),
            Value::Decimal(d) => write!(f, "Decimal({})", d),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Record(fields) => f.debug_tuple("Record").field(fields).finish(),
            Value::Object(obj) => write!(f, "Object({}#{:?})", obj.class_name(), obj.server_id()),
            Value::List(list) => f.debug_tuple("List").field(&list.to_vec()).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(&map.entries()).finish(),
            Value::Notify(_) => write!(f, "Notify"),
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Date(_) => "Date",
            Value::Decimal(_) => "Decimal",
            Value::Array(_) => "Array",
            Value::Record(_) => "Record",
            Value::Object(_) => "Object",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Notify(_) => "Notify",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_notify(&self) -> bool {
        matches!(self, Value::Notify(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    pub fn as_date(&self) -> Option<Timestamp> {
        if let Value::Date(t) = self {
            Some(*t)
        } else {
            None
        }
    }

    pub fn as_object(&self) -> Option<&ProxyObject> {
        if let Value::Object(o) = self {
            Some(o)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&ProxyList> {
        if let Value::List(l) = self {
            Some(l)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&ProxyMap> {
        if let Value::Map(m) = self {
            Some(m)
        } else {
            None
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        if let Value::Array(items) = self {
            Some(items)
        } else {
            None
        }
    }

    pub fn from_bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn from_int(i: i64) -> Self {
        Value::Int(i)
    }

    pub fn from_float(f: f64) -> Self {
        Value::Float(f)
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Value::String(ArcString::new(s.into()))
    }

    pub fn from_date(t: Timestamp) -> Self {
        Value::Date(t)
    }

    pub fn expect_bool(&self) -> Result<bool> {
        self.as_bool().ok_or_else(|| self.bad_cast("Bool"))
    }

    pub fn expect_int(&self) -> Result<i64> {
        self.as_int().ok_or_else(|| self.bad_cast("Int"))
    }

    pub fn expect_float(&self) -> Result<f64> {
        self.as_float().ok_or_else(|| self.bad_cast("Float"))
    }

    pub fn expect_string(&self) -> Result<&str> {
        self.as_string().ok_or_else(|| self.bad_cast("String"))
    }

    pub fn expect_date(&self) -> Result<Timestamp> {
        self.as_date().ok_or_else(|| self.bad_cast("Date"))
    }

    pub fn expect_object(&self) -> Result<&ProxyObject> {
        self.as_object().ok_or_else(|| self.bad_cast("Object"))
    }

    pub fn expect_list(&self) -> Result<&ProxyList> {
        self.as_list().ok_or_else(|| self.bad_cast("List"))
    }

    pub fn expect_map(&self) -> Result<&ProxyMap> {
        self.as_map().ok_or_else(|| self.bad_cast("Map"))
    }

    fn bad_cast(&self, target: &str) -> Error {
        Error::BadValueCast(self.type_name().to_string(), target.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::from_string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::from_string(s)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Date(t)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<ProxyObject> for Value {
    fn from(o: ProxyObject) -> Self {
        Value::Object(o)
    }
}

impl From<ProxyList> for Value {
    fn from(l: ProxyList) -> Self {
        Value::List(l)
    }
}

impl From<ProxyMap> for Value {
    fn from(m: ProxyMap) -> Self {
        Value::Map(m)
    }
}

impl From<Notify> for Value {
    fn from(n: Notify) -> Self {
        Value::Notify(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
