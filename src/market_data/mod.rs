pub mod feed;
pub mod kline;
pub mod router;
pub mod series_store;

// Re-exports for convenient access (e.g. `use crate::market_data::SeriesStore`).
pub use feed::{BinanceTransport, FeedTransport};
pub use router::{ActiveView, RouterConfig, RouterHandle, SubscriptionRouter};
pub use series_store::SeriesStore;
