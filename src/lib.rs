#![forbid(unsafe_code)]

//! Shared library for the clipgate binaries.
//!
//! The `backend` binary wires these modules into the HTTP service; the
//! `purge_tokens` binary reuses the config and store layers for the expired
//! token sweep.

pub mod browser;
pub mod config;
pub mod security;
pub mod store;
pub mod tokens;
