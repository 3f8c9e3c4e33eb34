pub mod config;
pub mod manager;

pub use config::{default_sectors, RiskConfig, RiskLimits};
pub use manager::{CircuitBreakerCheck, PortfolioSnapshot, RiskManager};
