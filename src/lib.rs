pub mod changelog;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod field;
pub mod models;
pub mod sink;
pub mod special;
pub mod table;
pub mod timestamp;
pub mod typecast;

pub use client::{Auth, JiraClient, JiraConfig, SearchSource};
pub use error::{Error, Result};
pub use models::*;

// Changelog engine re-exports
pub use changelog::{ChangelogEngine, Diff};

// Collector re-exports
pub use collector::{Collector, IssueSource};

// Config re-export
pub use config::ExtractProfile;

// Field specification re-exports
pub use field::{Field, FieldSpec, Resolved, TableSpec, TypeChain};

// Table store re-exports
pub use table::{DedupPolicy, Row, Table, TableStore};

// Sink re-exports
pub use sink::{JsonDirSink, MemorySink, TableSink};

// Special parser re-export
pub use special::SpecialParser;

// Timestamp re-exports
pub use timestamp::{Watermark, parse_jira_datetime, to_canonical};

// Type cast re-exports
pub use typecast::{ChangeValue, EMPTY, TypeCast, TypeCastRegistry};
