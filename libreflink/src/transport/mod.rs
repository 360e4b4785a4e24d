//! HTTP surface between workers and the aggregator.
//!
//! | Side | Module | Role |
//! |------|--------|------|
//! | server | [`server`] | report ingestion and catalog read endpoints |
//! | client | [`client`] | per-pass report delivery from workers |

pub mod client;
pub mod server;

pub use client::ReportClient;
pub use server::CatalogServer;
