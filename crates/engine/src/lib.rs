pub mod alpaca;
pub mod coinbase;
pub mod config;
pub mod executor;
pub mod lifecycle;
pub mod state;

pub use alpaca::AlpacaBroker;
pub use coinbase::CoinbaseBroker;
pub use config::{BotConfig, BotSettings, BrokerKind, UniverseSettings};
pub use executor::{CycleSummary, ExecutionReport, TradingBot};
pub use lifecycle::shutdown_channel;
pub use state::{BotState, PendingEntry, PositionTag, StateStore};
