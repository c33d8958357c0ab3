pub mod dexscreener;

pub use dexscreener::DexScreenerPriceSource;
