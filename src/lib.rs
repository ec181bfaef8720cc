//! Trade room lifecycle and trust scoring for a peer-to-peer card marketplace.

pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod machine;
pub mod matching;
pub mod notify;
pub mod offer;
pub mod service;
pub mod stats;
pub mod storage;
pub mod trade;
pub mod trust;
pub mod utils;

pub use error::{ErrorCode, Result, TradeError};
pub use service::TradeService;
pub use trade::{NewTrade, TimeStamp, Trade, TradeStatus};
