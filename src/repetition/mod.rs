pub mod list;
pub mod record;
pub mod sink;
pub mod store;
