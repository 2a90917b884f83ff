//! Feed decoding and record normalization for the PhishTank CSV dump.

mod feed;
mod transform;

pub use feed::{FeedHeader, FeedReader, RowDecodeError, REQUIRED_COLUMNS};
pub use transform::{
    is_verified, parse_submission_time, transform, transform_at, DiscardReason, Transformed,
    TRUTHY_TOKENS,
};

pub const CRATE_NAME: &str = "phishload-adapters";
