pub mod assembly;
pub mod blacklist;
pub mod common;
pub mod dllmap;
pub mod inventory;
pub mod ldd;
pub mod lookup_path;
pub mod metadata;
pub mod pe;
pub mod query;
pub mod report;
pub mod runner;
pub mod system;

pub use common::LookupError;
pub use inventory::{Category, Inventory};
pub use lookup_path::LookupPath;
pub use query::LookupQuery;
pub use report::Manifest;
pub use runner::Runner;

/// Inventory the roots of the query, with the search path deduced from its system
pub fn lookup(query: &LookupQuery) -> Result<Inventory, LookupError> {
    Runner::new(query)?.run()
}
