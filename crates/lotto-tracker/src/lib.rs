pub mod backend;
pub mod config;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;
