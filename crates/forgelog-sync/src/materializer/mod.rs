//! Archive files to property-graph upserts.

mod batch;
mod parse;
mod pipeline;

pub use batch::{GraphBatch, GraphExport};
pub use parse::{apply_line, parse_file, parse_reader, LineError, ParseStats};
pub use pipeline::{CommitReport, CommitTicket, GraphMaterializer};
