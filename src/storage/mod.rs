pub mod arena;
pub mod csr;
pub mod extent;
pub mod indexer;
pub mod snapshot;
pub mod table;
