mod models;
mod rest;

pub use rest::AlpacaBroker;
