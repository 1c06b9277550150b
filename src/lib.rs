//! Refstore Client Library
//!
//! This library provides a typed client for the Refstore reference-library
//! web API: a REST/JSON service for bibliographic items and collections,
//! backed by a separate signed-URL binary store for attachment content.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`transport`] - Shared request layer with replay-safe rate-limit
//!   backoff and status classification
//! - [`paginate`] - Link-header pagination over collection responses
//! - [`library`] - The [`Client`] facade with the read and write API
//! - [`upload`] - The multi-step attachment upload flow with zero-copy
//!   body assembly
//! - [`error`] - The error taxonomy shared by all of the above
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use refstore::{Client, LibraryKind, Params};
//!
//! # async fn example() -> Result<(), refstore::Error> {
//! let client = Client::new("12345", LibraryKind::User, Some("api-key".into()))?;
//!
//! // stream every item in the library, 100 per request
//! let first = client.items(&Params::new().limit(100)).await?;
//! let everything = client.everything(first).await?;
//!
//! // attach a file to an existing item
//! let outcome = client
//!     .attach_files(&[PathBuf::from("paper.pdf")], Some("ABC123"), None)
//!     .await?;
//! assert!(outcome.fully_succeeded());
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod library;
pub mod paginate;
pub mod transport;
pub mod upload;

// Re-export commonly used types
pub use error::{Error, ResponseContext};
pub use library::{Client, DEFAULT_ENDPOINT, LibraryKind, Params};
pub use paginate::{LinkSet, Page, Paginator};
pub use transport::{ApiResponse, Backoff, RequestSpec, Transport};
pub use upload::{
    Authorization, BatchOutcome, MAX_BATCH_ITEMS, RegistrationResult, UploadAuthorization,
    UploadBody, UploadOutcome, UploadStage,
};
