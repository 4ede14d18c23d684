//! A live, filterable, paginated view over a growing list of deals.
//!
//! Start a [`SyncController`] inside a `tokio::task::LocalSet`, render from its
//! [`FeedSnapshot`]s, and feed it scroll and filter input. Everything runs on one
//! thread; cache mutations are never concurrent.

pub mod backend;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod price_history;
pub mod sse;
pub mod subscription;
pub mod sync;

use std::sync::LazyLock;

pub use backend::{DealSource, HttpDealSource, PageQuery};
pub use backoff::{Backoff, next_delay};
pub use cache::{FetchKind, PageRequest, PagedCache};
pub use config::FeedConfig;
pub use error::{EventError, FetchError, TransportError};
pub use sse::{ServerEvent, SseTransport};
pub use subscription::{ConnectionState, EventHandler, EventStream, EventTransport, StreamSubscription};
pub use sync::{FeedSnapshot, SyncController};

// putting this inside LOGGER prevents us from initializing the logger more than once
static LOGGER: LazyLock<()> = LazyLock::new(|| {
    let initialized = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
    if initialized.is_ok() {
        log::info!("Logging initialized");
    }
});

/// Install `env_logger` (honouring `RUST_LOG`). Safe to call any number of times.
pub fn init_logging() {
    LazyLock::force(&LOGGER);
}
