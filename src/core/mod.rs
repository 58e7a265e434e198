pub mod aggregate;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod formatter;
pub mod models;
pub mod points;

#[cfg(test)]
mod test_support;
