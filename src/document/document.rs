use std::fmt::{Debug, Formatter};

/// sender client id, required on every document
pub const SRC_KEY: &str = "_src";
/// destination client id - documents without it are identification / control documents for
///  the peer itself
pub const DST_KEY: &str = "_dst";
/// shared secret, required if the receiver is configured with one
pub const SEC_KEY: &str = "_sec";
/// marks a control document
pub const CTL_KEY: &str = "_ctl";
/// requests the receiver to report the sender's address as observed by the receiver
pub const ECHO_ADDRESS_KEY: &str = "echoaddress";
/// opt-in flag for queuing documents to offline destinations, see
///  [crate::router::router_config::QueuePolicy]
pub const QUEUE_KEY: &str = "_que";

/// liveness check
pub const CTL_ECHO: &str = "echo";
/// liveness check as sent by older clients
pub const CTL_KEEPALIVE: &str = "keepalive";
/// acknowledgement of a liveness check
pub const CTL_ECHO_REPLY: &str = "echoreply";


/// The value types of BSON. The common types have their own variants, and the remaining ones are
///  kept in their wire representation so documents pass through unchanged.
#[derive(Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Value>),
    /// subtype 0 is generic binary data
    Binary { subtype: u8, data: Vec<u8> },
    Undefined,
    ObjectId([u8; 12]),
    Bool(bool),
    /// milliseconds since the Unix epoch
    DateTime(i64),
    Null,
    Regex { pattern: String, options: String },
    DbPointer { namespace: String, id: [u8; 12] },
    JavaScript(String),
    Symbol(String),
    JavaScriptWithScope { code: String, scope: Document },
    Int32(i32),
    Timestamp(u64),
    Int64(i64),
    Decimal128([u8; 16]),
    MinKey,
    MaxKey,
}

/// binary subtype for generic binary data
pub const BINARY_SUBTYPE_GENERIC: u8 = 0x00;
pub const BINARY_SUBTYPE_UUID: u8 = 0x04;

fn hex(bytes: &[u8]) -> String {
    bytes.iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{:?}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Document(v) => write!(f, "{:?}", v),
            Value::Array(v) => f.debug_list().entries(v.iter()).finish(),
            Value::Binary { subtype, data } => write!(f, "<{} bytes, subtype {:#04x}>", data.len(), subtype),
            Value::Undefined => write!(f, "undefined"),
            Value::ObjectId(id) => write!(f, "ObjectId({})", hex(id)),
            Value::Bool(v) => write!(f, "{}", v),
            Value::DateTime(millis) => write!(f, "DateTime({})", millis),
            Value::Null => write!(f, "null"),
            Value::Regex { pattern, options } => write!(f, "/{}/{}", pattern, options),
            Value::DbPointer { namespace, id } => write!(f, "DbPointer({:?}, {})", namespace, hex(id)),
            Value::JavaScript(code) => write!(f, "JavaScript({:?})", code),
            Value::Symbol(v) => write!(f, "Symbol({:?})", v),
            Value::JavaScriptWithScope { code, scope } => write!(f, "JavaScript({:?}, {:?})", code, scope),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "Timestamp({})", v),
            Value::Int64(v) => write!(f, "{}L", v),
            Value::Decimal128(v) => write!(f, "Decimal128({})", hex(v)),
            Value::MinKey => write!(f, "MinKey"),
            Value::MaxKey => write!(f, "MaxKey"),
        }
    }
}

impl Value {
    /// `false`, `null`, `undefined`, zero and empty strings are falsy, everything else is truthy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null | Value::Undefined => false,
            Value::Int32(v) => *v != 0,
            Value::Int64(v) => *v != 0,
            Value::Double(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::String(value.clone())
    }
}
impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
impl From<Document> for Value {
    fn from(value: Document) -> Self {
        Value::Document(value)
    }
}
impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}
impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary { subtype: BINARY_SUBTYPE_GENERIC, data: value }
    }
}


/// A document is an ordered list of key / value pairs with unique keys. Order is preserved
///  on the wire and is significant for equality.
#[derive(Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Debug for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl Document {
    pub fn new() -> Document {
        Document::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter()
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// returns the value for a key if it is present *and* a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Inserts a value, replacing an existing value for the same key in place (i.e. keeping its
    ///  position). New keys are appended. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();

        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(idx) => Some(std::mem::replace(&mut self.entries[idx].1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub(crate) fn push_unchecked(&mut self, key: String, value: Value) {
        self.entries.push((key, value));
    }

    pub fn src(&self) -> Option<&str> {
        self.get_str(SRC_KEY)
    }

    pub fn dst(&self) -> Option<&str> {
        self.get_str(DST_KEY)
    }

    pub fn ctl(&self) -> Option<&str> {
        self.get_str(CTL_KEY)
    }
}

impl <K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<T: IntoIterator<Item=(K, V)>>(iter: T) -> Self {
        let mut result = Document::new();
        for (k, v) in iter {
            result.insert(k, v);
        }
        result
    }
}

/// Convenience for building documents: `doc!{"_src" => "A", "herp" => "derp"}`
#[macro_export]
macro_rules! doc {
    () => { $crate::document::document::Document::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut doc = $crate::document::document::Document::new();
        $(
            doc.insert($key, $value);
        )+
        doc
    }};
}


#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::bool_true(Value::Bool(true), true)]
    #[case::bool_false(Value::Bool(false), false)]
    #[case::null(Value::Null, false)]
    #[case::undefined(Value::Undefined, false)]
    #[case::zero(Value::Int32(0), false)]
    #[case::one(Value::Int64(1), true)]
    #[case::empty_string(Value::from(""), false)]
    #[case::string(Value::from("yes"), true)]
    #[case::document(Value::Document(Document::new()), true)]
    #[case::object_id(Value::ObjectId([0; 12]), true)]
    fn test_is_truthy(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(value.is_truthy(), expected);
    }

    #[test]
    fn test_insert_keeps_position() {
        let mut d = doc!{"a" => 1, "b" => 2, "c" => 3};
        assert_eq!(d.insert("b", "x"), Some(Value::Int32(2)));
        assert_eq!(d.insert("d", true), None);

        let keys = d.iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert_eq!(d.get_str("b"), Some("x"));
        assert_eq!(d.get_bool("d"), Some(true));
    }

    #[test]
    fn test_order_is_significant_for_equality() {
        assert_ne!(doc!{"a" => 1, "b" => 2}, doc!{"b" => 2, "a" => 1});
        assert_eq!(doc!{"a" => 1, "b" => 2}, doc!{"a" => 1, "b" => 2});
    }

    #[test]
    fn test_routing_accessors() {
        let d = doc!{SRC_KEY => "A", DST_KEY => "B", CTL_KEY => CTL_ECHO};
        assert_eq!(d.src(), Some("A"));
        assert_eq!(d.dst(), Some("B"));
        assert_eq!(d.ctl(), Some(CTL_ECHO));

        let d = doc!{SRC_KEY => 5};
        assert_eq!(d.src(), None);
        assert!(d.contains_key(SRC_KEY));
        assert_eq!(d.dst(), None);
    }

    #[test]
    fn test_remove() {
        let mut d = doc!{"a" => 1, "b" => 2};
        assert_eq!(d.remove("a"), Some(Value::Int32(1)));
        assert_eq!(d.remove("a"), None);
        assert_eq!(d.len(), 1);
    }
}
