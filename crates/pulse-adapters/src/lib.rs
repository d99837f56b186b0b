//! Source contracts for Pulse: the page aggregator and the declarative API source kinds.

mod paginate;
mod sources;

pub use paginate::{drain_nested, fetch_all, PageSource, PaginationStyle};
pub use sources::{
    ApiSource, EnrichSpec, LinkApiSource, LinkSpec, OffsetApiSource, OffsetSpec, RequestSpec, SourceSpec,
    TokenApiSource, TokenSpec,
};

pub const CRATE_NAME: &str = "pulse-adapters";
