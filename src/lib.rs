// Tally Sync - Core Library
// Exposes all modules for use in the CLI, the edge-function server, and tests

pub mod coerce;
pub mod config;
pub mod data_quality;
pub mod db;
pub mod deduplication;
pub mod entities;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod parser;
pub mod reconciliation;
pub mod request;
pub mod retry;
pub mod source;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::SyncConfig;
pub use data_quality::{DataQualityEngine, QualityIssue, QualityReport, Severity};
pub use db::{setup_database, Schema, TallyTable, Tenant};
pub use deduplication::{DedupOutcome, DeduplicationEngine, DuplicateMatch, MatchStrategy};
pub use entities::{
    AccountingEntry, Collection, CostCentre, Group, InventoryEntry, Ledger, Records, Row,
    StockItem, TallyRecord, Voucher, VoucherType,
};
pub use error::{ImportError, SinkError, TransportError};
pub use import::{
    BatchImporter, BulkImportRequest, BulkImportResponse, EdgeFunctionSink, ImportOperation,
    ImportStats, Sink, SqliteSink,
};
pub use parser::{
    detect_format, get_parser, parse_payload, JsonParser, ParseOutcome, Payload, PayloadFormat,
    RecordParser, SkippedRecord, XmlParser,
};
pub use reconciliation::{ApplyStats, ReconciliationEngine, ReconciliationResult, TableDiff, TrialBalance};
pub use request::ExportRequest;
pub use retry::{RetryPolicy, Retryable};
pub use source::{DirectorySource, ProxySource, TallyServerSource, TallySource};
pub use sync::{SyncOptions, SyncReport, SyncRunner, TableResult};
pub use transport::{HttpTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
