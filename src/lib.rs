pub mod config;
pub mod container;
pub mod docker;
pub mod fleet;
pub mod replica;
pub mod retry;
pub mod rotation;
pub mod runner;
pub mod security;
pub mod server;
pub mod telemetry;

#[cfg(test)]
mod test_support;
