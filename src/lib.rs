//! A single-process, non-blocking HTTP streaming relay.
//!
//! spillway ingests live audio/video streams over HTTP (`PUT`/`SOURCE`/
//! `POST`), pulls them from remote servers or UDP/multicast groups, and
//! fans each mount out to any number of HTTP listeners with bounded
//! memory. One readiness loop drives everything; there are no threads and
//! no locks.

#![warn(
    anonymous_parameters,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

pub mod auth;
pub mod buffer;
pub mod clients;
pub mod config;
pub mod format;
pub mod http;
pub mod reactor;
pub mod relay;
pub mod server;
pub mod sources;
pub mod stats;
pub mod status;
pub mod timer;
