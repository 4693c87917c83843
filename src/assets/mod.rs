//! Offline asset layer: a versioned cache of the app shell plus per-request
//! caching strategies.

mod classify;
mod network;
mod storage;
mod worker;

pub use network::{AssetNetwork, AssetRequest, HttpAssetNetwork};
pub use storage::CacheStorage;
pub use worker::{AssetWorker, ClientMessage, WorkerMessage, WorkerState};
