pub mod cache;
pub mod client;
pub mod error;
pub mod fake;
pub mod http;
mod model;

pub use cache::ClientCache;
pub use client::{
    BootSourceOverride, PowerAction, RedfishClient, RedfishClientFactory, RedfishConnection,
    SystemInfo, VirtualMediaStatus,
};
pub use error::RedfishError;
pub use fake::{FakeRedfish, FakeRedfishFactory};
pub use http::{HttpRedfishClient, HttpRedfishFactory};
