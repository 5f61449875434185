pub mod claim;
pub mod composer;
pub mod memory;
pub mod pg_store;
pub mod processor;
pub mod resolver;
pub mod store;
