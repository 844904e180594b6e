pub mod provider;
pub mod types;

pub use provider::{HttpMarketDataProvider, MarketDataProvider};
pub use types::{Dataset, PricePoint};
