pub mod candle_store;
pub mod merge;
pub mod storage;
pub mod timeframe;

// Re-exports for convenient access (e.g. `use crate::market_data::CandleStore`).
pub use candle_store::{CandleStore, SeriesIndex, Since};
pub use merge::MergeReport;
pub use storage::{FileStorage, MemoryStorage, SeriesStorage};
pub use timeframe::Timeframe;
