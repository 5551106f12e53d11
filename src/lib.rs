//! An embedded, durable work queue on top of SQLite.
//!
//! Handlers are registered per topic in a [`Registry`], each with its own
//! concurrency limit and lease expiry. The [`Broker`] validates and stores
//! published messages, then a background poller claims eligible messages and
//! runs them on their topic's handler. Handlers can ask for a retry at a later
//! time with [`HandlerError::RetryAfter`]; successful messages publish their
//! `on_success` follow-ups and, like permanent failures, end up in the archive.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use sluice::{Broker, ConsumerOptions, Context, HandlerError, Registry, Store};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Resize {
//!     hash: String,
//! }
//!
//! async fn resize(_ctx: Context, image: Resize) -> Result<(), HandlerError> {
//!     println!("resizing {}", image.hash);
//!     Ok(())
//! }
//!
//! # async fn example() -> Result<(), sluice::Error> {
//! let mut registry = Registry::new();
//! registry.add_consumer(
//!     "resize",
//!     resize,
//!     ConsumerOptions::builder().concurrency(4).build(),
//! )?;
//!
//! let broker = Broker::builder()
//!     .store(Store::connect().await?)
//!     .registry(registry)
//!     .start();
//!
//! broker
//!     .publish("resize", &Resize { hash: "abc123".to_owned() })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod message;
pub mod registry;
pub mod store;

#[cfg(test)]
mod test_tools;

pub use broker::Broker;
pub use config::Config;
pub use consumer::{ConsumerOptions, Context, Handler, HandlerError};
pub use error::Error;
pub use message::{Message, UnixTime};
pub use registry::Registry;
pub use store::Store;

/// Installs the global tracing subscriber, filtered by `SLUICE_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("SLUICE_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
