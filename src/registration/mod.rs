//! Registration records and their stores, plus the thin administrative
//! surface exposed to the host's management tooling.

pub mod admin;
pub mod models;
pub mod store;

pub use admin::AdminService;
pub use models::Registration;
pub use store::{MemoryRegistrationStore, RegistrationStore, SqlRegistrationStore};
