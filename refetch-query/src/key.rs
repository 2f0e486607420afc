// Copyright 2026 refetch Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::Display,
    hash::{Hash, Hasher},
    sync::Arc,
};

use refetch_common::error::{Error, ErrorKind, Result};
use serde::{Serialize, Serializer};

/// A finite floating point segment.
///
/// Integral values never become a [`Float`]: they are canonicalized to [`Segment::Int`], so `1.0` and `1` name the
/// same key. Negative zero is canonicalized to zero.
#[derive(Debug, Clone, Copy)]
pub struct Float(f64);

impl Float {
    /// The wrapped value.
    pub fn get(&self) -> f64 {
        self.0
    }
}

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Float {}

impl Hash for Float {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for Float {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Float {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Serialize for Float {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.0)
    }
}

/// A single segment of a [`QueryKey`].
///
/// Segments are JSON-like values. Maps are ordered by key, so two maps with the same entries are the same segment
/// no matter how they were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Segment {
    /// `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer. Wide enough for every `i64` and `u64`.
    Int(i128),
    /// A finite, non-integral number.
    Float(Float),
    /// A string.
    Str(String),
    /// A nested list of segments.
    List(Vec<Segment>),
    /// A string-keyed map of segments.
    Map(BTreeMap<String, Segment>),
}

impl Segment {
    /// Build a segment from a float.
    ///
    /// Integral values within the `i128` range become [`Segment::Int`]. Non-finite values are rejected.
    pub fn float(v: f64) -> Result<Self> {
        if !v.is_finite() {
            return Err(Error::new(ErrorKind::Parse, "query key segments must be finite numbers")
                .with_context("value", v));
        }
        if v.fract() == 0.0 && v >= i128::MIN as f64 && v < i128::MAX as f64 {
            return Ok(Segment::Int(v as i128));
        }
        Ok(Segment::Float(Float(v)))
    }
}

macro_rules! impl_segment_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Segment {
                fn from(v: $ty) -> Self {
                    Segment::Int(v as i128)
                }
            }
        )*
    };
}

impl_segment_from_int! { i8, i16, i32, i64, isize, u8, u16, u32, u64, usize }

impl From<i128> for Segment {
    fn from(v: i128) -> Self {
        Segment::Int(v)
    }
}

impl From<bool> for Segment {
    fn from(v: bool) -> Self {
        Segment::Bool(v)
    }
}

impl From<&str> for Segment {
    fn from(v: &str) -> Self {
        Segment::Str(v.to_string())
    }
}

impl From<String> for Segment {
    fn from(v: String) -> Self {
        Segment::Str(v)
    }
}

impl From<&String> for Segment {
    fn from(v: &String) -> Self {
        Segment::Str(v.clone())
    }
}

impl<T> From<Option<T>> for Segment
where
    T: Into<Segment>,
{
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Segment::Null)
    }
}

impl From<Vec<Segment>> for Segment {
    fn from(v: Vec<Segment>) -> Self {
        Segment::List(v)
    }
}

impl From<BTreeMap<String, Segment>> for Segment {
    fn from(v: BTreeMap<String, Segment>) -> Self {
        Segment::Map(v)
    }
}

impl TryFrom<f64> for Segment {
    type Error = Error;

    fn try_from(v: f64) -> Result<Self> {
        Segment::float(v)
    }
}

impl TryFrom<serde_json::Value> for Segment {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(Segment::Null),
            Value::Bool(v) => Ok(Segment::Bool(v)),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(v), _) => Ok(Segment::Int(v as i128)),
                (None, Some(v)) => Ok(Segment::Int(v as i128)),
                (None, None) => Segment::float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(v) => Ok(Segment::Str(v)),
            Value::Array(vs) => vs.into_iter().map(Segment::try_from).collect::<Result<_>>().map(Segment::List),
            Value::Object(kvs) => kvs
                .into_iter()
                .map(|(k, v)| Segment::try_from(v).map(|v| (k, v)))
                .collect::<Result<_>>()
                .map(Segment::Map),
        }
    }
}

/// The identity of a cache entry: an ordered sequence of segments.
///
/// Two keys are the same cache identity iff their normalized forms are equal. Segments are canonical by
/// construction, so this is plain structural, order-sensitive equality. A single-segment key such as `"sw-people"`
/// is a list of length one and compares like any other key.
///
/// Cloning a key is cheap, the segments are shared.
///
/// ```rust
/// # use refetch_query::{query_key, QueryKey};
/// let a = query_key!["posts", 1];
/// let b = QueryKey::from_json(serde_json::json!(["posts", 1.0])).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.normalize(), r#"["posts",1]"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    segments: Arc<[Segment]>,
}

impl QueryKey {
    /// Build a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Segment>,
    {
        Self::from_segments(segments.into_iter().map(Into::into).collect())
    }

    /// Build a key from already converted segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    /// Build a key from a JSON value.
    ///
    /// An array becomes the segment list, any other value becomes a single-segment key.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Array(vs) => vs
                .into_iter()
                .map(Segment::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Self::from_segments),
            v => Segment::try_from(v).map(|s| Self::from_segments(vec![s])),
        }
    }

    /// The segments of the key.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Count of the segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// If the key has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Build a new key with one more trailing segment.
    pub fn join(&self, segment: impl Into<Segment>) -> Self {
        let mut segments = self.segments.to_vec();
        segments.push(segment.into());
        Self::from_segments(segments)
    }

    /// If `prefix` is a leading sub-sequence of the key. Every key starts with the empty key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// The canonical form of the key: compact JSON with map keys sorted.
    pub fn normalize(&self) -> String {
        // Segments hold string-keyed maps and finite numbers only, which always serialize.
        serde_json::to_string(&*self.segments).expect("query key segments always serialize")
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.normalize())
    }
}

impl From<&str> for QueryKey {
    fn from(v: &str) -> Self {
        Self::new([v])
    }
}

impl From<String> for QueryKey {
    fn from(v: String) -> Self {
        Self::new([v])
    }
}

impl From<Vec<Segment>> for QueryKey {
    fn from(v: Vec<Segment>) -> Self {
        Self::from_segments(v)
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(v: &QueryKey) -> Self {
        v.clone()
    }
}

/// Build a [`QueryKey`] from segments.
///
/// ```rust
/// # use refetch_query::query_key;
/// let page = 3;
/// let key = query_key!["posts", page];
/// assert_eq!(key.len(), 2);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::key::QueryKey::from_segments(vec![$($crate::key::Segment::from($segment)),*])
    };
}

/// Selects cache entries by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Every entry.
    All,
    /// The entry with exactly the given key.
    Exact(QueryKey),
    /// Every entry whose key starts with the given key.
    Prefix(QueryKey),
}

impl KeyFilter {
    /// If the filter selects the key.
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

/// A bare key selects by prefix: `["posts"]` selects `["posts", 1]`, `["posts", 2]`, ...
impl From<QueryKey> for KeyFilter {
    fn from(key: QueryKey) -> Self {
        KeyFilter::Prefix(key)
    }
}

impl From<&QueryKey> for KeyFilter {
    fn from(key: &QueryKey) -> Self {
        KeyFilter::Prefix(key.clone())
    }
}
