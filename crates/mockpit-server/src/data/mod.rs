//! Data buckets and the resource actions that mutate them.

pub mod bucket;
pub mod crud;

pub use bucket::{parse_rendered, BucketState, BucketStore};
pub use crud::{apply as apply_resource_action, ResourceOutcome, ResourceRequest};
