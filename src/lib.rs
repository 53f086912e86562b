#![forbid(unsafe_code)]

//! Catalog backend for the MLWIO media site.
//!
//! Content records live in SQLite. Links are stored in a normalised form and
//! rewritten into directly playable URLs on every read: Google Drive share
//! links become direct-download links and Alist paths are signed on demand.

pub mod alist;
pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod enrich;
pub mod links;

#[cfg(test)]
mod test_support;
