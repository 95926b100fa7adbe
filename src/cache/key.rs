//! Structural query keys.
//!
//! A key is an ordered list of segments, e.g. `["rules", "list", {"page": 1}]`.
//! Equality and prefix matching are structural. Filter objects are stored in a
//! canonical form (object keys sorted at every depth) so that two filters that
//! differ only in key order compare equal.

use serde_json::Value;
use std::fmt;

/// A single segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
  Str(String),
  Int(i64),
  /// Structured filter, kept as canonical JSON text
  Filter(String),
}

impl Segment {
  /// Build a segment from an arbitrary JSON value.
  ///
  /// Strings and integers become plain segments; everything else (objects,
  /// arrays, floats, booleans, null) is canonicalized into a filter segment.
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::String(s) => Segment::Str(s.clone()),
      Value::Number(n) if n.is_i64() => Segment::Int(n.as_i64().unwrap_or_default()),
      other => Segment::Filter(canonical_json(other)),
    }
  }

  /// The JSON value this segment represents.
  pub fn to_json(&self) -> Value {
    match self {
      Segment::Str(s) => Value::String(s.clone()),
      Segment::Int(n) => Value::from(*n),
      Segment::Filter(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Segment::Str(s) => Some(s),
      _ => None,
    }
  }
}

impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Str(s.to_string())
  }
}

impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Str(s)
  }
}

impl From<&String> for Segment {
  fn from(s: &String) -> Self {
    Segment::Str(s.clone())
  }
}

impl From<i64> for Segment {
  fn from(n: i64) -> Self {
    Segment::Int(n)
  }
}

impl From<i32> for Segment {
  fn from(n: i32) -> Self {
    Segment::Int(n.into())
  }
}

impl From<u32> for Segment {
  fn from(n: u32) -> Self {
    Segment::Int(n.into())
  }
}

impl From<Value> for Segment {
  fn from(value: Value) -> Self {
    Segment::from_json(&value)
  }
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Str(s) => write!(f, "{}", Value::String(s.clone())),
      Segment::Int(n) => write!(f, "{}", n),
      Segment::Filter(raw) => f.write_str(raw),
    }
  }
}

/// Ordered, structurally comparable identifier for a cacheable resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<Segment>);

impl QueryKey {
  pub fn new(segments: Vec<Segment>) -> Self {
    Self(segments)
  }

  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Return a new key with `segment` appended.
  pub fn with(mut self, segment: impl Into<Segment>) -> Self {
    self.0.push(segment.into());
    self
  }

  /// True if `prefix` is a leading subsequence of this key.
  ///
  /// Every key starts with itself and with the empty key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Build a key from a JSON array, as found in configuration files.
  pub fn from_json_array(values: &[Value]) -> Self {
    Self(values.iter().map(Segment::from_json).collect())
  }
}

impl FromIterator<Segment> for QueryKey {
  fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(",")?;
      }
      write!(f, "{}", segment)?;
    }
    f.write_str("]")
  }
}

/// Build a [`QueryKey`] from heterogeneous segments.
///
/// ```ignore
/// let key = query_key!["rules", "list", json!({"page": 1})];
/// ```
#[macro_export]
macro_rules! query_key {
  () => { $crate::cache::QueryKey::default() };
  ($($segment:expr),+ $(,)?) => {
    $crate::cache::QueryKey::new(vec![$($crate::cache::Segment::from($segment)),+])
  };
}

/// Serialize a JSON value with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      out.push('{');
      for (i, (k, v)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(k.clone()).to_string());
        out.push(':');
        write_canonical(v, out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    other => out.push_str(&other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_structural_equality() {
    let a = query_key!["rules", "list", json!({"page": 1, "category": "irdai"})];
    let b = query_key!["rules", "list", json!({"category": "irdai", "page": 1})];
    assert_eq!(a, b);
    assert_eq!(a.to_string(), b.to_string());
  }

  #[test]
  fn test_nested_filter_order_is_ignored() {
    let a = Segment::from(json!({"outer": {"b": 2, "a": [ {"y": 1, "x": 0} ]}}));
    let b = Segment::from(json!({"outer": {"a": [ {"x": 0, "y": 1} ], "b": 2}}));
    assert_eq!(a, b);
  }

  #[test]
  fn test_segment_kinds_are_distinct() {
    assert_ne!(query_key!["1"], query_key![1]);
    assert_ne!(query_key![json!({"page": 1})], query_key![json!({"page": "1"})]);
  }

  #[test]
  fn test_prefix_matching() {
    let key = query_key!["a", "b", 1];
    assert!(key.starts_with(&query_key!["a", "b"]));
    assert!(key.starts_with(&key));
    assert!(key.starts_with(&QueryKey::default()));
    assert!(!key.starts_with(&query_key!["a", "c"]));
    assert!(!query_key!["a"].starts_with(&query_key!["a", "b"]));
  }

  #[test]
  fn test_prefix_with_filter_segment() {
    let key = query_key!["rules", "list", json!({"page": 2})];
    assert!(key.starts_with(&query_key!["rules", "list"]));
    assert!(!key.starts_with(&query_key!["rules", "list", json!({"page": 1})]));
  }

  #[test]
  fn test_display_is_canonical() {
    let key = query_key!["rules", 3, json!({"z": true, "a": null})];
    assert_eq!(key.to_string(), r#"["rules",3,{"a":null,"z":true}]"#);
  }

  #[test]
  fn test_from_json_array() {
    let key = QueryKey::from_json_array(&[json!("projects"), json!(7), json!({"q": "x"})]);
    assert_eq!(key, query_key!["projects", 7, json!({"q": "x"})]);
    assert_eq!(key.segments()[2].to_json(), json!({"q": "x"}));
  }
}
