//! HTTP fetch utilities, the request executor, and the columnar/graph store gateways.

pub mod columnar;
pub mod download;
pub mod executor;
pub mod fetch;
pub mod graph_store;

pub use columnar::{ClickHouseConfig, ClickHouseGateway, ColumnarGateway, GatewayError, Row};
pub use download::{ArchiveDownloader, DownloadError, DownloadJob, DownloadReport, DownloadStatus};
pub use executor::{ExecutorOptions, ExecutorStats, FetchTask, RequestExecutor, ResponseHandler, TaskQueue};
pub use fetch::{
    is_retryable_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimit, RateLimiter,
    RetryPolicy, Transport,
};
pub use graph_store::{EdgeUpsert, GraphGateway, GraphStoreError, Neo4jConfig, Neo4jGraphStore, NodeUpsert};
