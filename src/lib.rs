//! Reconciles time-stamped weather polygon feeds into an ordered, foldered
//! feature store.
//!
//! A [`session::FeedSession`] fetches snapshots through a [`feed::Fetcher`],
//! filters them to a validity window, plans folder and feature changes with
//! [`reconcile::reconcile`] and applies them atomically to a
//! [`storage::CollectionStore`].

pub mod config;
pub mod feed;
pub mod reconcile;
pub mod session;
pub mod storage;
pub mod util;
