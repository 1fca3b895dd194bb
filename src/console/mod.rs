pub mod application;
pub mod input;
pub mod presenter;
pub mod types;
