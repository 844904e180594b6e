pub mod accuracy;
pub mod analysis;
pub mod classification;
pub mod contract;
pub mod model;
pub mod recommendation;
pub mod valuation;
