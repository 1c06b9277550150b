//! Multi-step attachment upload.
//!
//! Attaching files is the one place in the client with real protocol
//! state: four server round-trips per batch, with per-item failure
//! isolation. The flow is an explicit staged machine rather than nested
//! callbacks:
//!
//! 1. Client-side preconditions: the batch fits the 50-item ceiling and
//!    every file opens readably. Both checks run before any network call.
//! 2. Register: the batch of attachment templates is POSTed with a fresh
//!    write-token, producing a [`RegistrationResult`]. Failure here is
//!    fatal to the whole batch, since no items exist server-side yet.
//! 3. Per registered item, in submission order: authorize (digest and
//!    metadata, may short-circuit with "already exists"), transmit (the
//!    assembled body goes to the storage URL, outside the API trust
//!    domain, without the API credential), confirm (the upload key is
//!    posted back). Each item runs to its own terminal
//!    [`UploadOutcome`]; one item's failure never aborts the rest.
//!
//! Re-submitting a batch after a partial failure is safe but not
//! idempotent: registration mints a fresh write-token each time, so
//! duplicate preliminary item shells can be created. Deduplicating
//! across unrelated tokens would need a server-side identity check, so
//! this is documented behavior rather than silently repaired.

mod body;
mod digest;

pub use body::UploadBody;
pub use digest::{FileMeta, content_type_for, inspect, md5_hex};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::Error;
use crate::transport::{RequestSpec, Transport, WRITE_TOKEN_HEADER, write_token};

/// Hard ceiling on items per registration call, enforced client-side.
pub const MAX_BATCH_ITEMS: usize = 50;

/// Error detail for one item whose registration the server rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationFailure {
    /// Server error code, when supplied.
    #[serde(default)]
    pub code: Option<i64>,
    /// Server error message.
    #[serde(default)]
    pub message: String,
}

/// Outcome of the registration step, keyed by submission index.
///
/// Indices are positions in the submitted batch, not item identifiers;
/// only the `success` partition resolves them to server item keys. The
/// maps are ordered so downstream steps pair each index with its key
/// explicitly instead of relying on any value-iteration order.
#[derive(Debug, Clone, Default)]
pub struct RegistrationResult {
    /// Submission index to the created item's server key.
    pub success: BTreeMap<usize, String>,
    /// Submission index to the key of an item the server left untouched.
    pub unchanged: BTreeMap<usize, String>,
    /// Submission index to the server's error detail.
    pub failed: BTreeMap<usize, RegistrationFailure>,
}

#[derive(Debug, Deserialize)]
struct RawRegistration {
    #[serde(default)]
    success: HashMap<String, String>,
    #[serde(default)]
    unchanged: HashMap<String, String>,
    #[serde(default)]
    failed: HashMap<String, RegistrationFailure>,
}

impl RegistrationResult {
    /// Parses the server's registration response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedResponse`] when the shape is wrong,
    /// an index is not numeric, or an index appears in more than one
    /// partition.
    pub fn parse(value: Value, url: &str) -> Result<Self, Error> {
        let raw: RawRegistration = serde_json::from_value(value).map_err(|e| {
            Error::unexpected_response(url, format!("malformed registration result: {e}"))
        })?;
        let result = Self {
            success: indexed(raw.success, url)?,
            unchanged: indexed(raw.unchanged, url)?,
            failed: indexed(raw.failed, url)?,
        };
        for idx in result.success.keys() {
            if result.unchanged.contains_key(idx) || result.failed.contains_key(idx) {
                return Err(Error::unexpected_response(
                    url,
                    format!("batch index {idx} reported in more than one partition"),
                ));
            }
        }
        for idx in result.unchanged.keys() {
            if result.failed.contains_key(idx) {
                return Err(Error::unexpected_response(
                    url,
                    format!("batch index {idx} reported in more than one partition"),
                ));
            }
        }
        Ok(result)
    }
}

fn indexed<T>(raw: HashMap<String, T>, url: &str) -> Result<BTreeMap<usize, T>, Error> {
    raw.into_iter()
        .map(|(key, value)| {
            key.parse::<usize>().map(|idx| (idx, value)).map_err(|_| {
                Error::unexpected_response(url, format!("non-numeric batch index {key:?}"))
            })
        })
        .collect()
}

/// A full upload authorization for a file not yet on the server.
///
/// Single-use: produced by the authorize step, consumed by transmit and
/// confirm, then discarded.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadAuthorization {
    /// Storage URL the body must be POSTed to.
    pub url: String,
    /// Content type for the storage request.
    #[serde(rename = "contentType")]
    pub content_type: String,
    /// Multipart framing to prepend to the file content.
    pub prefix: String,
    /// Multipart framing to append to the file content.
    pub suffix: String,
    /// Key identifying this upload in the confirmation step.
    #[serde(rename = "uploadKey")]
    pub upload_key: String,
}

/// Authorize-step response: either the file already exists server-side
/// or the server issues a full [`UploadAuthorization`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Authorization {
    /// The server already holds identical content for this item.
    Exists {
        /// Always 1 on the wire.
        exists: u8,
    },
    /// The file must be transmitted.
    Upload(UploadAuthorization),
}

/// The stage an item's upload was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// Requesting upload authorization.
    Authorizing,
    /// Transferring the assembled body to storage.
    Transmitting,
    /// Confirming the completed transfer.
    Confirming,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authorizing => "authorizing",
            Self::Transmitting => "transmitting",
            Self::Confirming => "confirming",
        };
        f.write_str(name)
    }
}

/// Terminal state of one item's upload.
#[derive(Debug)]
pub enum UploadOutcome {
    /// Identical content was already on the server; nothing transmitted.
    AlreadyExists,
    /// The file was transmitted and confirmed.
    Uploaded,
    /// The item failed at the given stage; other items were unaffected.
    Failed {
        /// Stage that failed.
        stage: UploadStage,
        /// The failure itself.
        error: Error,
    },
}

impl UploadOutcome {
    /// Whether this item reached a successful terminal state.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::AlreadyExists | Self::Uploaded)
    }
}

/// Result of one attachment batch: the registration partitions plus the
/// per-item terminal states for every successfully registered item,
/// keyed by submission index.
#[derive(Debug)]
pub struct BatchOutcome {
    /// The registration step's partitions.
    pub registration: RegistrationResult,
    /// Terminal upload state per registered submission index.
    pub outcomes: BTreeMap<usize, UploadOutcome>,
}

impl BatchOutcome {
    /// Whether registration rejected nothing and every item's upload
    /// reached a successful terminal state.
    #[must_use]
    pub fn fully_succeeded(&self) -> bool {
        self.registration.failed.is_empty()
            && self.outcomes.values().all(UploadOutcome::succeeded)
    }
}

/// Fails fast when a batch exceeds the per-call ceiling.
///
/// # Errors
///
/// Returns [`Error::TooManyItems`]; no I/O has happened yet.
pub fn ensure_batch_size(files: &[PathBuf]) -> Result<(), Error> {
    if files.len() > MAX_BATCH_ITEMS {
        return Err(Error::too_many_items(files.len(), MAX_BATCH_ITEMS));
    }
    Ok(())
}

/// Confirms every file in the batch currently opens for reading.
///
/// Opening beats an existence check: it also catches unreadable and
/// locked files before the batch spends any network round-trips.
///
/// # Errors
///
/// Returns [`Error::FileDoesNotExist`] naming the first offending path.
pub async fn verify_readable(files: &[PathBuf]) -> Result<(), Error> {
    for path in files {
        if tokio::fs::File::open(path).await.is_err() {
            return Err(Error::file_does_not_exist(path));
        }
    }
    Ok(())
}

/// One batch's upload orchestrator.
///
/// Borrows the client's transport and library prefix; constructed fresh
/// per call to [`Client::attach_files`](crate::Client::attach_files).
#[derive(Debug)]
pub(crate) struct Uploader<'a> {
    transport: &'a Transport,
    library_prefix: &'a str,
}

impl<'a> Uploader<'a> {
    pub(crate) fn new(transport: &'a Transport, library_prefix: &'a str) -> Self {
        Self {
            transport,
            library_prefix,
        }
    }

    /// Runs registration and the per-item machines for one batch.
    ///
    /// `templates` and `files` are parallel: `templates[i]` registers the
    /// attachment whose content lives at `files[i]`. Preconditions
    /// (batch size, file readability) are assumed to have been checked.
    #[instrument(skip_all, fields(batch = files.len(), parent = parent.unwrap_or("none")))]
    pub(crate) async fn upload_batch(
        &self,
        mut templates: Vec<Value>,
        files: &[PathBuf],
        parent: Option<&str>,
    ) -> Result<BatchOutcome, Error> {
        if let Some(parent_key) = parent {
            for template in &mut templates {
                if let Some(object) = template.as_object_mut() {
                    object.insert(
                        "parentItem".to_string(),
                        Value::String(parent_key.to_string()),
                    );
                }
            }
        }

        let registration = self.register(templates).await?;
        info!(
            registered = registration.success.len(),
            unchanged = registration.unchanged.len(),
            failed = registration.failed.len(),
            "attachment batch registered"
        );
        if registration.success.is_empty() {
            warn!("no attachment items were registered; nothing to upload");
        }

        let mut outcomes = BTreeMap::new();
        for (&idx, key) in &registration.success {
            let outcome = match files.get(idx) {
                Some(path) => self.upload_one(path, key).await,
                None => UploadOutcome::Failed {
                    stage: UploadStage::Authorizing,
                    error: Error::unexpected_response(
                        self.transport.endpoint(),
                        format!("registration index {idx} is outside the submitted batch"),
                    ),
                },
            };
            match &outcome {
                UploadOutcome::AlreadyExists => {
                    info!(index = idx, key = %key, "file already exists on server");
                }
                UploadOutcome::Uploaded => {
                    info!(index = idx, key = %key, "file uploaded and confirmed");
                }
                UploadOutcome::Failed { stage, error } => warn!(
                    index = idx,
                    key = %key,
                    stage = %stage,
                    error = %error,
                    "item upload failed; continuing with remaining items"
                ),
            }
            outcomes.insert(idx, outcome);
        }

        Ok(BatchOutcome {
            registration,
            outcomes,
        })
    }

    /// Registers the batch of attachment templates with a fresh
    /// write-token. Fatal to the batch on failure.
    async fn register(&self, templates: Vec<Value>) -> Result<RegistrationResult, Error> {
        let spec = RequestSpec::post(
            self.transport
                .api_url(&format!("{}/items", self.library_prefix)),
        )
        .header(WRITE_TOKEN_HEADER, write_token())
        .json(Value::Array(templates));
        let response = self.transport.execute(spec).await?;
        let url = response.url.clone();
        RegistrationResult::parse(response.json()?, &url)
    }

    /// Drives one registered item to its terminal state.
    async fn upload_one(&self, path: &Path, key: &str) -> UploadOutcome {
        let authorization = match self.authorize(path, key).await {
            Ok(authorization) => authorization,
            Err(error) => {
                return UploadOutcome::Failed {
                    stage: UploadStage::Authorizing,
                    error,
                };
            }
        };

        let authorization = match authorization {
            // terminal success: no body is built and no transfer happens
            Authorization::Exists { .. } => return UploadOutcome::AlreadyExists,
            Authorization::Upload(authorization) => authorization,
        };

        if let Err(error) = self.transmit(path, &authorization).await {
            return UploadOutcome::Failed {
                stage: UploadStage::Transmitting,
                error,
            };
        }

        if let Err(error) = self.confirm(key, &authorization).await {
            return UploadOutcome::Failed {
                stage: UploadStage::Confirming,
                error,
            };
        }

        UploadOutcome::Uploaded
    }

    /// Requests upload authorization for one file.
    async fn authorize(&self, path: &Path, key: &str) -> Result<Authorization, Error> {
        let meta = digest::inspect(path).await?;
        let form = vec![
            ("md5".to_string(), meta.md5),
            ("filename".to_string(), meta.filename),
            ("filesize".to_string(), meta.size.to_string()),
            ("mtime".to_string(), meta.mtime_ms.to_string()),
            ("contentType".to_string(), meta.content_type.to_string()),
        ];
        let spec = RequestSpec::post(self.file_url(key))
            .header("If-None-Match", "*")
            .form(form);
        let response = self.transport.execute(spec).await?;
        let url = response.url.clone();
        serde_json::from_value(response.json()?).map_err(|e| {
            Error::unexpected_response(&url, format!("malformed upload authorization: {e}"))
        })
    }

    /// Transfers the assembled body to the storage endpoint.
    ///
    /// The storage endpoint is a different trust domain: the request
    /// carries only the authorization's content type and a plain
    /// User-Agent, never the API bearer credential.
    async fn transmit(
        &self,
        path: &Path,
        authorization: &UploadAuthorization,
    ) -> Result<(), Error> {
        let mut body = UploadBody::new(
            authorization.prefix.clone().into_bytes(),
            path,
            authorization.suffix.clone().into_bytes(),
        );
        let bytes = body.read().await?;
        let spec = RequestSpec::post(&authorization.url)
            .unauthenticated()
            .header("Content-Type", &authorization.content_type)
            .bytes(bytes);
        // success is 201; anything else classifies as an error
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Notifies the service that the transfer completed.
    async fn confirm(&self, key: &str, authorization: &UploadAuthorization) -> Result<(), Error> {
        let spec = RequestSpec::post(self.file_url(key))
            .header("If-None-Match", "*")
            .form(vec![(
                "upload".to_string(),
                authorization.upload_key.clone(),
            )]);
        // success is 204, no body
        self.transport.execute(spec).await?;
        Ok(())
    }

    fn file_url(&self, key: &str) -> String {
        self.transport
            .api_url(&format!("{}/items/{}/file", self.library_prefix, key))
    }
}
