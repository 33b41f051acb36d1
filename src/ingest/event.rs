use std::fmt;

/// SQL statement category used as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse an already lower-cased statement keyword
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "select" => Some(Self::Select),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed query record
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub database: String,
    pub query_kind: QueryKind,
    pub duration_ms: f64,
}

/// A completed error record (`error`, `fatal`, `panic`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub database: String,
    pub error_kind: String,
}

/// A query record whose duration was present but not a valid number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedQuery {
    pub database: String,
    pub query_kind: QueryKind,
    pub raw_duration: String,
}

/// Output of the parser for one line
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Query(QueryEvent),
    Error(ErrorEvent),
    Malformed(MalformedQuery),
}
