pub mod service;
pub mod store;

pub use service::{HubConfig, TabHub};
pub use store::{StoreError, TabStore};
