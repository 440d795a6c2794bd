pub mod database;
pub mod error_handling;
pub mod tenancy;

pub use database::*;
pub use tenancy::WorkspaceStoreRouter;
