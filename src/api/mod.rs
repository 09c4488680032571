pub mod price;
pub mod venue;
pub mod wallet;

pub use price::{DexPriceClient, PriceSource};
pub use venue::{SellOutcome, SwapClient, SwapVenue};
pub use wallet::{BalanceSource, RpcWalletClient};
