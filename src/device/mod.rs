pub mod backend;
pub mod btle;
pub mod connection;
pub mod constants;
pub mod intent;
pub mod machine;
pub mod payload;
pub mod scan;
pub mod types;

#[cfg(test)]
pub mod fake;
