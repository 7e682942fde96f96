//! # Physics Prediction
//!
//! Client-side prediction with server reconciliation for physically simulated
//! models. The workspace is split the way the roles are:
//!
//! - `shared`: tick loop, snapshots, history, wire formats and the model trait
//! - `server`: authoritative drivers, input buffering and replication
//! - `client`: autonomous (predicted) and simulated (displayed) proxies
//!
//! This crate ties them together into an in-process [`session::Session`] that
//! runs an authority and a client over simulated links.

pub mod session;
