pub mod backend;
pub mod documents;
pub mod keyspace;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
