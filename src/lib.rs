//! Object Store Sync Core Library
//!
//! This library provides the client core for ingesting and retrieving large
//! binary objects against a fleet of object-storage service endpoints:
//! host-pool selection with failure isolation, cached endpoint discovery,
//! a retrying request pipeline with telemetry, metadata operations, resuming
//! downloads and concurrent multipart uploads.
//!
//! # Architecture
//!
//! - [`config`] - immutable client configuration
//! - [`host`] - per-class host selection with punishment and refresh
//! - [`discovery`] - cached `v4/query` endpoint resolution
//! - [`dot`] - telemetry buffer with lock-protected log and async upload
//! - [`list`] - stat/batch-stat/copy/move/delete/list-prefix
//! - [`download`] - file, byte, range and streaming-reader downloads
//! - [`upload`] - single-request and multipart uploads
//!
//! The HTTP transport ([`client::HttpClient`]) and the credential scheme
//! ([`auth::Signer`]) are injected; the crate never signs or reads config
//! files itself.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod dot;
pub mod download;
mod encode;
pub mod error;
pub mod host;
pub mod list;
mod retry;
pub mod upload;

// Re-export commonly used types
pub use auth::{Signer, UploadPolicy};
pub use client::HttpClient;
pub use config::Config;
pub use discovery::{set_cache_directory_and_load, Queryer};
pub use dot::{disable_dot_uploading, disable_dotting, enable_dot_uploading, enable_dotting, Dotter};
pub use download::{DownloadReader, Downloader, RangePart};
pub use error::ApiError;
pub use host::{HostSelector, HostSelectorOptions, HostsProvider};
pub use list::{BatchStats, FileStat, ListedPage, Lister};
pub use upload::{
    BytesPartSource, CompletePartsRet, FilePartSource, Part, PartCallback, PartSource,
    UploadExtra, Uploader,
};
