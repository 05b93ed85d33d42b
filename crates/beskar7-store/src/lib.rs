pub mod error;
pub mod memory;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use store::{ObjectStore, Secret};
