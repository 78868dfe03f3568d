//! Boot-resource mirroring for region controllers.
//!
//! This library implements the two halves of the region's boot-image
//! plumbing: periodically synchronizing OS image catalogs from upstream
//! simple-streams mirrors into a content-addressed large-object store, and
//! republishing the materialized images to subordinate rack controllers over
//! the same catalog protocol.
//!
//! The relational store, the signed-catalog parser, and the rack RPC layer
//! are external collaborators reached through the trait seams in [`db`],
//! [`streams`] and [`rack`].

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

mod config;
pub use config::Config;

pub mod db;
pub mod import;
pub mod model;
pub mod rack;
pub mod server;
pub mod services;
pub mod streams;

pub mod test_util;
