pub mod adapter;
pub mod config;
pub mod diff;
pub mod error;
pub mod harvester;
pub mod store;
pub mod tokens;
pub mod types;

#[cfg(test)]
mod testing;
