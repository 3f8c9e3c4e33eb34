mod models;
mod rest;

pub use rest::{sign, CoinbaseBroker};
