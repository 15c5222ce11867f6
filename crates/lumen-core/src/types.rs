use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Metadata key that names the file a chunk came from.
pub const SOURCE_KEY: &str = "source";

/// Placeholder used when a result carries no `source` metadata.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// A scalar metadata value attached to an embedded chunk.
///
/// Serialized untagged, so `{"source": "a.rs", "lines": 40}` round-trips
/// through JSON as-is.
///
/// # Examples
///
/// ```
/// use lumen_core::MetadataValue;
///
/// let v: MetadataValue = serde_json::from_str("42").unwrap();
/// assert_eq!(v, MetadataValue::Int(42));
/// assert_eq!(MetadataValue::parse_scalar("rust"), MetadataValue::from("rust"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free text.
    Text(String),
}

impl MetadataValue {
    /// Parse a command-line scalar: booleans, then integers, then floats,
    /// falling back to text.
    pub fn parse_scalar(raw: &str) -> Self {
        match raw {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Self::Float(f);
        }
        Self::Text(raw.to_string())
    }

    /// Equality used by filters. Integers and floats compare numerically.
    pub fn loosely_eq(&self, other: &MetadataValue) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            _ => self == other,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Metadata attached to a chunk. Ordered so hashing and persistence are stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Build a [`Metadata`] map holding only a `source` entry.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, SOURCE_KEY};
///
/// let md = source_metadata("src/lib.rs");
/// assert_eq!(md[SOURCE_KEY].to_string(), "src/lib.rs");
/// ```
pub fn source_metadata(source: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(SOURCE_KEY.to_string(), MetadataValue::from(source));
    metadata
}

/// An embedding vector together with the chunk it was computed from.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, EmbeddingVector};
///
/// let v = EmbeddingVector {
///     id: "abc".into(),
///     vector: vec![0.1, 0.2, 0.3],
///     metadata: source_metadata("src/main.rs"),
///     text: Some("fn main() {}".into()),
/// };
/// assert_eq!(v.dimension(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EmbeddingVector {
    /// Unique id within a store.
    pub id: String,
    /// The embedding itself.
    pub vector: Vec<f32>,
    /// Scalar metadata; carries `source` for corpus chunks.
    #[serde(default)]
    pub metadata: Metadata,
    /// The chunk text, when the caller kept it.
    #[serde(default)]
    pub text: Option<String>,
}

impl EmbeddingVector {
    /// Length of the vector.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// A ranked hit returned by a vector store query.
///
/// `score` is always "higher = more relevant", whatever the backend's
/// native metric.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, SearchResult};
///
/// let hit = SearchResult::new("id-1", "fn connect() {}", 0.92, source_metadata("src/db.rs"));
/// assert_eq!(hit.source_file, "src/db.rs");
///
/// let orphan = SearchResult::new("id-2", "x", 0.1, Default::default());
/// assert_eq!(orphan.source_file, "unknown");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Id of the matched entry.
    pub id: String,
    /// Chunk text (empty when the entry was stored without text).
    pub text: String,
    /// Normalized relevance score.
    pub score: f64,
    /// Metadata stored with the entry.
    pub metadata: Metadata,
    /// Value of the `source` metadata key, or `"unknown"`.
    pub source_file: String,
}

impl SearchResult {
    /// Build a result, deriving `source_file` from the metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>, score: f64, metadata: Metadata) -> Self {
        let source_file = metadata
            .get(SOURCE_KEY)
            .map(|v| v.to_string())
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());
        Self {
            id: id.into(),
            text: text.into(),
            score,
            metadata,
            source_file,
        }
    }
}

/// Sort results descending by score, breaking ties by id.
///
/// NaN scores sort last.
pub fn rank_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or_else(|| a.score.is_nan().cmp(&b.score.is_nan()))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// One condition of a [`MetadataFilter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    /// The value must equal this one.
    Eq(MetadataValue),
    /// The value must equal one of these.
    In(Vec<MetadataValue>),
}

impl FilterCondition {
    fn accepts(&self, value: &MetadataValue) -> bool {
        match self {
            Self::Eq(expected) => expected.loosely_eq(value),
            Self::In(options) => options.iter().any(|o| o.loosely_eq(value)),
        }
    }
}

/// Conjunction of per-key metadata conditions.
///
/// A key that is absent from the metadata never matches.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, MetadataFilter, MetadataValue};
///
/// let filter = MetadataFilter::new().eq("source", "src/db.rs");
/// assert!(filter.matches(&source_metadata("src/db.rs")));
/// assert!(!filter.matches(&source_metadata("src/api.rs")));
///
/// let either = MetadataFilter::new().one_of(
///     "source",
///     vec![MetadataValue::from("a.rs"), MetadataValue::from("b.rs")],
/// );
/// assert!(either.matches(&source_metadata("b.rs")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    conditions: BTreeMap<String, FilterCondition>,
}

impl MetadataFilter {
    /// An empty filter, which matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.conditions
            .insert(key.into(), FilterCondition::Eq(value.into()));
        self
    }

    /// Require `key` to equal one of `values`.
    pub fn one_of(mut self, key: impl Into<String>, values: Vec<MetadataValue>) -> Self {
        self.conditions.insert(key.into(), FilterCondition::In(values));
        self
    }

    /// Parse `key=value` pairs as given on the command line.
    ///
    /// Repeating a key turns it into a one-of condition.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first pair without `=`.
    ///
    /// # Examples
    ///
    /// ```
    /// use lumen_core::{source_metadata, MetadataFilter};
    ///
    /// let pairs = vec!["source=a.rs".to_string(), "source=b.rs".to_string()];
    /// let filter = MetadataFilter::from_pairs(&pairs).unwrap();
    /// assert!(filter.matches(&source_metadata("a.rs")));
    /// assert!(MetadataFilter::from_pairs(&["nope".to_string()]).is_err());
    /// ```
    pub fn from_pairs(pairs: &[String]) -> Result<Self, String> {
        let mut filter = Self::new();
        for pair in pairs {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| format!("filter '{pair}' is not of the form key=value"))?;
            let value = MetadataValue::parse_scalar(raw.trim());
            let key = key.trim().to_string();
            let condition = match filter.conditions.remove(&key) {
                None => FilterCondition::Eq(value),
                Some(FilterCondition::Eq(prev)) => FilterCondition::In(vec![prev, value]),
                Some(FilterCondition::In(mut prev)) => {
                    prev.push(value);
                    FilterCondition::In(prev)
                }
            };
            filter.conditions.insert(key, condition);
        }
        Ok(filter)
    }

    /// True when there are no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether `metadata` satisfies every condition.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions.iter().all(|(key, condition)| {
            metadata
                .get(key)
                .is_some_and(|value| condition.accepts(value))
        })
    }
}

/// Which backend a vector store uses.
///
/// # Examples
///
/// ```
/// use lumen_core::StoreType;
///
/// let t: StoreType = "in-memory-index".parse().unwrap();
/// assert_eq!(t, StoreType::InMemoryIndex);
/// assert_eq!("sqlite".parse::<StoreType>().unwrap(), StoreType::RelationalVector);
/// assert_eq!(t.to_string(), "in-memory-index");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreType {
    /// Flat in-process index with L2 distance, persisted as a binary file.
    #[default]
    #[serde(alias = "memory", alias = "faiss")]
    InMemoryIndex,
    /// Embedded JSON document collection with cosine distance.
    #[serde(alias = "document", alias = "chroma")]
    EmbeddedDocStore,
    /// SQLite table with embedding BLOBs and cosine similarity.
    #[serde(alias = "sqlite", alias = "pgvector")]
    RelationalVector,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::InMemoryIndex => write!(f, "in-memory-index"),
            StoreType::EmbeddedDocStore => write!(f, "embedded-doc-store"),
            StoreType::RelationalVector => write!(f, "relational-vector"),
        }
    }
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-memory-index" | "memory" | "faiss" => Ok(StoreType::InMemoryIndex),
            "embedded-doc-store" | "document" | "chroma" => Ok(StoreType::EmbeddedDocStore),
            "relational-vector" | "sqlite" | "pgvector" => Ok(StoreType::RelationalVector),
            other => Err(format!("unknown store type: {other}")),
        }
    }
}

/// Granularity of prompts built from a batch of results.
///
/// # Examples
///
/// ```
/// use lumen_core::PromptType;
///
/// assert_eq!("file-wise".parse::<PromptType>().unwrap(), PromptType::FileWise);
/// assert_eq!(PromptType::default(), PromptType::Aggregate);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    /// One prompt per distinct source file in the batch.
    FileWise,
    /// One prompt for the whole batch.
    #[default]
    Aggregate,
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptType::FileWise => write!(f, "file_wise"),
            PromptType::Aggregate => write!(f, "aggregate"),
        }
    }
}

impl FromStr for PromptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "file_wise" | "file" => Ok(PromptType::FileWise),
            "aggregate" | "batch" => Ok(PromptType::Aggregate),
            other => Err(format!("unknown prompt type: {other}")),
        }
    }
}

/// Phrasing strategy used to render prompts.
///
/// # Examples
///
/// ```
/// use lumen_core::PromptProviderType;
///
/// let p: PromptProviderType = "code-pattern".parse().unwrap();
/// assert_eq!(p, PromptProviderType::CodePattern);
/// assert_eq!(p.to_string(), "code_pattern");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptProviderType {
    /// Explain what the code does and why it matters.
    #[default]
    Semantic,
    /// Focus on implementation patterns, interfaces and error handling.
    CodePattern,
}

impl fmt::Display for PromptProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptProviderType::Semantic => write!(f, "semantic"),
            PromptProviderType::CodePattern => write!(f, "code_pattern"),
        }
    }
}

impl FromStr for PromptProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "semantic" => Ok(PromptProviderType::Semantic),
            "code_pattern" | "pattern" => Ok(PromptProviderType::CodePattern),
            other => Err(format!("unknown prompt provider: {other}")),
        }
    }
}

/// The LLM analysis of one rendered prompt (batch mode).
///
/// # Examples
///
/// ```
/// use lumen_core::AnalysisResult;
///
/// let r = AnalysisResult {
///     batch_index: 0,
///     content: "The auth module validates tokens.".into(),
///     source_files: vec!["src/auth.rs".into()],
/// };
/// assert_eq!(r.batch_index, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Zero-based index of the batch in ranking order.
    pub batch_index: usize,
    /// Full completion text.
    pub content: String,
    /// Source files covered by the prompt.
    pub source_files: Vec<String>,
}

/// One incremental text fragment (stream mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFragment {
    /// Zero-based index of the batch the fragment belongs to.
    pub batch_index: usize,
    /// Fragment text as received.
    pub text: String,
}

/// Summary of a vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Backend in use.
    pub store_type: StoreType,
    /// Number of stored vectors.
    pub count: usize,
    /// Vector dimension.
    pub dimension: usize,
    /// Persisted file, when any.
    pub location: Option<PathBuf>,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Store: {}", self.store_type)?;
        writeln!(f, "Vectors: {}", self.count)?;
        writeln!(f, "Dimension: {}", self.dimension)?;
        match &self.location {
            Some(path) => writeln!(f, "Location: {}", path.display()),
            None => writeln!(f, "Location: (memory only)"),
        }
    }
}

/// Output format for CLI subcommands.
///
/// Implements [`FromStr`] so it can be used directly with `clap` argument parsing.
///
/// # Examples
///
/// ```
/// use lumen_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text (default).
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f64) -> SearchResult {
        SearchResult::new(id, "", score, Metadata::new())
    }

    #[test]
    fn metadata_values_deserialize_untagged() {
        let md: Metadata =
            serde_json::from_str(r#"{"source":"a.rs","lines":12,"ratio":0.5,"test":true}"#)
                .unwrap();
        assert_eq!(md["source"], MetadataValue::Text("a.rs".into()));
        assert_eq!(md["lines"], MetadataValue::Int(12));
        assert_eq!(md["ratio"], MetadataValue::Float(0.5));
        assert_eq!(md["test"], MetadataValue::Bool(true));
    }

    #[test]
    fn parse_scalar_prefers_narrowest_type() {
        assert_eq!(MetadataValue::parse_scalar("true"), MetadataValue::Bool(true));
        assert_eq!(MetadataValue::parse_scalar("-3"), MetadataValue::Int(-3));
        assert_eq!(MetadataValue::parse_scalar("2.5"), MetadataValue::Float(2.5));
        assert_eq!(
            MetadataValue::parse_scalar("src/main.rs"),
            MetadataValue::Text("src/main.rs".into())
        );
    }

    #[test]
    fn filter_requires_every_condition() {
        let mut md = source_metadata("src/db.rs");
        md.insert("lang".into(), "rust".into());

        let filter = MetadataFilter::new().eq("source", "src/db.rs").eq("lang", "rust");
        assert!(filter.matches(&md));

        let filter = MetadataFilter::new().eq("source", "src/db.rs").eq("lang", "go");
        assert!(!filter.matches(&md));
    }

    #[test]
    fn filter_missing_key_never_matches() {
        let filter = MetadataFilter::new().eq("lang", "rust");
        assert!(!filter.matches(&source_metadata("a.rs")));
    }

    #[test]
    fn filter_compares_numbers_loosely() {
        let mut md = Metadata::new();
        md.insert("lines".into(), MetadataValue::Float(10.0));
        assert!(MetadataFilter::new().eq("lines", 10i64).matches(&md));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(MetadataFilter::new().is_empty());
        assert!(MetadataFilter::new().matches(&Metadata::new()));
    }

    #[test]
    fn from_pairs_repeated_key_becomes_one_of() {
        let pairs = vec![
            "source=a.rs".to_string(),
            "source=b.rs".to_string(),
            "source=c.rs".to_string(),
        ];
        let filter = MetadataFilter::from_pairs(&pairs).unwrap();
        assert!(filter.matches(&source_metadata("c.rs")));
        assert!(!filter.matches(&source_metadata("d.rs")));
    }

    #[test]
    fn rank_results_sorts_descending_with_id_tiebreak() {
        let mut results = vec![
            result("b", 0.5),
            result("c", 0.9),
            result("a", 0.5),
            result("d", f64::NAN),
        ];
        rank_results(&mut results);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn enum_round_trips_through_serde() {
        let t: StoreType = serde_json::from_str("\"relational-vector\"").unwrap();
        assert_eq!(t, StoreType::RelationalVector);
        let t: StoreType = serde_json::from_str("\"chroma\"").unwrap();
        assert_eq!(t, StoreType::EmbeddedDocStore);

        let p: PromptType = serde_json::from_str("\"file_wise\"").unwrap();
        assert_eq!(p, PromptType::FileWise);
        assert_eq!(
            serde_json::to_string(&PromptProviderType::CodePattern).unwrap(),
            "\"code_pattern\""
        );
    }

    #[test]
    fn unknown_enum_strings_are_rejected() {
        assert!("redis".parse::<StoreType>().is_err());
        assert!("paragraph".parse::<PromptType>().is_err());
        assert!("security".parse::<PromptProviderType>().is_err());
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn store_stats_display() {
        let stats = StoreStats {
            store_type: StoreType::EmbeddedDocStore,
            count: 3,
            dimension: 8,
            location: None,
        };
        let text = stats.to_string();
        assert!(text.contains("embedded-doc-store"));
        assert!(text.contains("Vectors: 3"));
        assert!(text.contains("memory only"));
    }
}
