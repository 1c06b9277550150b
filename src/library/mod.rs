//! Client facade over the reference-library API.
//!
//! A [`Client`] is bound to one library (user or group), holds the shared
//! [`Transport`], and exposes the read and write operations as thin
//! request/response mappings. The stateful orchestrators sit next door:
//! pagination in [`crate::paginate`], attachment uploads in
//! [`crate::upload`]; this module wires them to the transport.
//!
//! # Example
//!
//! ```no_run
//! use refstore::{Client, LibraryKind, Params};
//!
//! # async fn example() -> Result<(), refstore::Error> {
//! let client = Client::new("12345", LibraryKind::User, Some("api-key".into()))?;
//! let first_page = client.items(&Params::new().limit(50)).await?;
//! let all_items = client.everything(first_page).await?;
//! println!("{} items in the library", all_items.len());
//! # Ok(())
//! # }
//! ```

mod params;

pub use params::Params;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{info, instrument};

use crate::error::Error;
use crate::paginate::{Page, Paginator};
use crate::transport::{RequestSpec, Transport, WRITE_TOKEN_HEADER, write_token};
use crate::upload::{self, BatchOutcome, MAX_BATCH_ITEMS, Uploader};

/// Production API endpoint root.
pub const DEFAULT_ENDPOINT: &str = "https://api.refstore.org";

/// Response header carrying the library's current version.
pub const LAST_MODIFIED_VERSION_HEADER: &str = "Last-Modified-Version";

/// Request header for optimistic-concurrency writes.
const VERSION_HEADER: &str = "If-Unmodified-Since-Version";

/// Whether the library belongs to a single user or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    /// A personal library, addressed under `/users`.
    User,
    /// A shared group library, addressed under `/groups`.
    Group,
}

impl LibraryKind {
    fn path_segment(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Group => "groups",
        }
    }
}

/// Client for one reference library.
///
/// Cheap to keep around: the underlying HTTP client pools connections,
/// and the backoff counter damping the client's aggregate request rate
/// lives on the shared transport.
#[derive(Debug)]
pub struct Client {
    transport: Transport,
    library_id: String,
    kind: LibraryKind,
    templates: Mutex<HashMap<String, Value>>,
}

impl Client {
    /// Creates a client for the production endpoint.
    ///
    /// The API key is optional; public libraries can be read without one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredentials`] when `library_id` is empty.
    pub fn new(
        library_id: impl Into<String>,
        kind: LibraryKind,
        api_key: Option<String>,
    ) -> Result<Self, Error> {
        Self::with_endpoint(DEFAULT_ENDPOINT, library_id, kind, api_key)
    }

    /// Creates a client against an explicit endpoint root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredentials`] when `library_id` is empty.
    pub fn with_endpoint(
        endpoint: impl Into<String>,
        library_id: impl Into<String>,
        kind: LibraryKind,
        api_key: Option<String>,
    ) -> Result<Self, Error> {
        let library_id = library_id.into();
        if library_id.is_empty() {
            return Err(Error::missing_credentials("a library ID is required"));
        }
        Ok(Self {
            transport: Transport::new(endpoint, api_key),
            library_id,
            kind,
            templates: Mutex::new(HashMap::new()),
        })
    }

    /// Overrides the wall-clock length of one backoff delay unit.
    ///
    /// See [`Transport::with_backoff_unit`].
    #[must_use]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.transport = self.transport.with_backoff_unit(unit);
        self
    }

    /// The library's path prefix, e.g. `/users/12345`.
    #[must_use]
    pub fn library_prefix(&self) -> String {
        format!("/{}/{}", self.kind.path_segment(), self.library_id)
    }

    fn library_url(&self, suffix: &str) -> String {
        self.transport
            .api_url(&format!("{}{}", self.library_prefix(), suffix))
    }

    // ==================== Read API ====================

    async fn read_page(&self, suffix: &str, params: &Params) -> Result<Page, Error> {
        let spec = RequestSpec::get(self.library_url(suffix)).query(params.to_query());
        let response = self.transport.execute(spec).await?;
        Page::from_response(&response)
    }

    async fn read_single(&self, suffix: &str, params: &Params) -> Result<Value, Error> {
        let spec = RequestSpec::get(self.library_url(suffix)).query(params.to_query());
        self.transport.execute(spec).await?.json()
    }

    /// Lists items in the library.
    pub async fn items(&self, params: &Params) -> Result<Page, Error> {
        self.read_page("/items", params).await
    }

    /// Lists top-level items.
    pub async fn top(&self, params: &Params) -> Result<Page, Error> {
        self.read_page("/items/top", params).await
    }

    /// Lists items in the trash.
    pub async fn trash(&self, params: &Params) -> Result<Page, Error> {
        self.read_page("/items/trash", params).await
    }

    /// Retrieves a single item by key.
    pub async fn item(&self, key: &str, params: &Params) -> Result<Value, Error> {
        self.read_single(&format!("/items/{key}"), params).await
    }

    /// Lists the child items of an item.
    pub async fn children(&self, key: &str, params: &Params) -> Result<Page, Error> {
        self.read_page(&format!("/items/{key}/children"), params)
            .await
    }

    /// Lists the library's collections.
    pub async fn collections(&self, params: &Params) -> Result<Page, Error> {
        self.read_page("/collections", params).await
    }

    /// Lists the subcollections of a collection.
    pub async fn collections_sub(&self, key: &str, params: &Params) -> Result<Page, Error> {
        self.read_page(&format!("/collections/{key}/collections"), params)
            .await
    }

    /// Retrieves a single collection by key.
    pub async fn collection(&self, key: &str, params: &Params) -> Result<Value, Error> {
        self.read_single(&format!("/collections/{key}"), params)
            .await
    }

    /// Lists the items in a collection.
    pub async fn collection_items(&self, key: &str, params: &Params) -> Result<Page, Error> {
        self.read_page(&format!("/collections/{key}/items"), params)
            .await
    }

    /// Lists the library's tags as plain strings.
    pub async fn tags(&self, params: &Params) -> Result<Vec<String>, Error> {
        let page = self.read_page("/tags", params).await?;
        Ok(tag_names(page))
    }

    /// Lists the tags on one item as plain strings.
    pub async fn item_tags(&self, key: &str, params: &Params) -> Result<Vec<String>, Error> {
        let page = self.read_page(&format!("/items/{key}/tags"), params).await?;
        Ok(tag_names(page))
    }

    /// Retrieves an attachment item's binary content.
    pub async fn file(&self, key: &str) -> Result<Bytes, Error> {
        let spec = RequestSpec::get(self.library_url(&format!("/items/{key}/file")));
        Ok(self.transport.execute(spec).await?.into_body())
    }

    /// Retrieves a library path with the caller's parameters and returns
    /// the raw response body.
    ///
    /// Escape hatch for export formats the JSON page parser does not
    /// handle, e.g. `Params::new().format("bibtex")`.
    pub async fn retrieve_raw(&self, suffix: &str, params: &Params) -> Result<Bytes, Error> {
        let spec = RequestSpec::get(self.library_url(suffix)).query(params.to_query());
        Ok(self.transport.execute(spec).await?.into_body())
    }

    /// Counts the top-level items in the library.
    pub async fn num_items(&self) -> Result<u64, Error> {
        self.total_results("/items/top").await
    }

    /// Counts the items in a collection.
    pub async fn num_collection_items(&self, collection_key: &str) -> Result<u64, Error> {
        self.total_results(&format!("/collections/{collection_key}/items"))
            .await
    }

    /// Counts the items carrying a tag.
    pub async fn num_tag_items(&self, tag: &str) -> Result<u64, Error> {
        let spec = RequestSpec::get(self.library_url("/items"))
            .query(Params::new().tag(tag).format("keys").limit(1).to_query());
        let response = self.transport.execute(spec).await?;
        Ok(total_from(&response))
    }

    async fn total_results(&self, suffix: &str) -> Result<u64, Error> {
        // format=keys keeps the body to one line; only the header matters
        let spec = RequestSpec::get(self.library_url(suffix))
            .query(Params::new().format("keys").limit(1).to_query());
        let response = self.transport.execute(spec).await?;
        Ok(total_from(&response))
    }

    /// The library's current version from the server's version header.
    pub async fn last_modified_version(&self) -> Result<u64, Error> {
        let spec =
            RequestSpec::get(self.library_url("/items")).query(Params::new().limit(1).to_query());
        let response = self.transport.execute(spec).await?;
        Ok(response
            .header(LAST_MODIFIED_VERSION_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Retrieves up to 50 items by key, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyItems`] before any request when more than
    /// 50 keys are passed.
    pub async fn get_subset(&self, keys: &[&str], params: &Params) -> Result<Vec<Value>, Error> {
        if keys.len() > MAX_BATCH_ITEMS {
            return Err(Error::too_many_items(keys.len(), MAX_BATCH_ITEMS));
        }
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            items.push(self.item(key, params).await?);
        }
        Ok(items)
    }

    // ==================== Pagination ====================

    /// A cursor positioned after the given page, for lazy traversal.
    #[must_use]
    pub fn paginator(&self, page: &Page) -> Paginator<'_> {
        Paginator::from_page(&self.transport, page)
    }

    /// Drains every page reachable from an already-fetched first page
    /// into one ordered item list.
    ///
    /// # Errors
    ///
    /// Propagates the first failed page request.
    pub async fn everything(&self, first_page: Page) -> Result<Vec<Value>, Error> {
        let mut pager = Paginator::new(&self.transport, None);
        pager.collect_all(first_page).await
    }

    // ==================== Write API ====================

    /// Creates up to 50 items from template objects.
    ///
    /// Returns the server's per-index result document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyItems`] before any request when the batch
    /// exceeds 50 items.
    pub async fn create_items(&self, items: Vec<Value>) -> Result<Value, Error> {
        if items.len() > MAX_BATCH_ITEMS {
            return Err(Error::too_many_items(items.len(), MAX_BATCH_ITEMS));
        }
        let spec = RequestSpec::post(self.library_url("/items"))
            .header(WRITE_TOKEN_HEADER, write_token())
            .json(Value::Array(items));
        self.transport.execute(spec).await?.json()
    }

    /// Updates an existing item.
    ///
    /// The payload must carry the item's `key` and `version`; the version
    /// rides the `If-Unmodified-Since-Version` header so a concurrent
    /// edit fails with [`Error::PreConditionFailed`] instead of clobbering.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when `key` or `version` is absent.
    pub async fn update_item(&self, item: &Value) -> Result<(), Error> {
        let (key, version) = key_and_version(item)?;
        let body = item.get("data").cloned().unwrap_or_else(|| item.clone());
        let spec = RequestSpec::put(self.library_url(&format!("/items/{key}")))
            .header(VERSION_HEADER, version.to_string())
            .json(body);
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Deletes one item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when `key` or `version` is absent.
    pub async fn delete_item(&self, item: &Value) -> Result<(), Error> {
        let (key, version) = key_and_version(item)?;
        let spec = RequestSpec::delete(self.library_url(&format!("/items/{key}")))
            .header(VERSION_HEADER, version.to_string());
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Deletes up to 50 items in one call.
    ///
    /// The version of the first item rides the concurrency header, which
    /// assumes the batch was read at one library version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] for an empty batch and
    /// [`Error::TooManyItems`] past the 50-item ceiling, both before any
    /// request.
    pub async fn delete_items(&self, items: &[Value]) -> Result<(), Error> {
        if items.is_empty() {
            return Err(Error::param_not_passed("items"));
        }
        if items.len() > MAX_BATCH_ITEMS {
            return Err(Error::too_many_items(items.len(), MAX_BATCH_ITEMS));
        }
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            keys.push(key_and_version(item)?.0);
        }
        let (_, version) = key_and_version(&items[0])?;
        let spec = RequestSpec::delete(self.library_url("/items"))
            .query(vec![("itemKey".to_string(), keys.join(","))])
            .header(VERSION_HEADER, version.to_string());
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Creates collections from `{"name": ...}` payloads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyItems`] past the 50-item ceiling.
    pub async fn create_collections(&self, collections: Vec<Value>) -> Result<Value, Error> {
        if collections.len() > MAX_BATCH_ITEMS {
            return Err(Error::too_many_items(collections.len(), MAX_BATCH_ITEMS));
        }
        let spec = RequestSpec::post(self.library_url("/collections"))
            .header(WRITE_TOKEN_HEADER, write_token())
            .json(Value::Array(collections));
        self.transport.execute(spec).await?.json()
    }

    /// Updates an existing collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when `key` or `version` is absent.
    pub async fn update_collection(&self, collection: &Value) -> Result<(), Error> {
        let (key, version) = key_and_version(collection)?;
        let body = collection
            .get("data")
            .cloned()
            .unwrap_or_else(|| collection.clone());
        let spec = RequestSpec::put(self.library_url(&format!("/collections/{key}")))
            .header(VERSION_HEADER, version.to_string())
            .json(body);
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Deletes one collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when `key` or `version` is absent.
    pub async fn delete_collection(&self, collection: &Value) -> Result<(), Error> {
        let (key, version) = key_and_version(collection)?;
        let spec = RequestSpec::delete(self.library_url(&format!("/collections/{key}")))
            .header(VERSION_HEADER, version.to_string());
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Adds an item to a collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when the item lacks `key` or
    /// `version`.
    pub async fn add_to_collection(&self, collection_key: &str, item: &Value) -> Result<(), Error> {
        let mut memberships = collection_memberships(item);
        if !memberships.iter().any(|c| c == collection_key) {
            memberships.push(collection_key.to_string());
        }
        self.patch_collections(item, memberships).await
    }

    /// Removes an item from a collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when the item lacks `key` or
    /// `version`.
    pub async fn remove_from_collection(
        &self,
        collection_key: &str,
        item: &Value,
    ) -> Result<(), Error> {
        let memberships = collection_memberships(item)
            .into_iter()
            .filter(|c| c != collection_key)
            .collect();
        self.patch_collections(item, memberships).await
    }

    async fn patch_collections(&self, item: &Value, memberships: Vec<String>) -> Result<(), Error> {
        let (key, version) = key_and_version(item)?;
        let spec = RequestSpec::patch(self.library_url(&format!("/items/{key}")))
            .header(VERSION_HEADER, version.to_string())
            .json(serde_json::json!({ "collections": memberships }));
        self.transport.execute(spec).await?;
        Ok(())
    }

    /// Adds tags to a retrieved item and writes it back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamNotPassed`] when the item lacks `key` or
    /// `version`.
    pub async fn add_tags(&self, item: &mut Value, tags: &[&str]) -> Result<(), Error> {
        if let Some(data) = item.get_mut("data").and_then(Value::as_object_mut) {
            let existing = data
                .entry("tags".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(array) = existing.as_array_mut() {
                for tag in tags {
                    array.push(serde_json::json!({ "tag": tag }));
                }
            }
        }
        self.update_item(item).await
    }

    // ==================== Templates ====================

    /// Fetches (and caches in memory) a blank template for an item type.
    pub async fn item_template(&self, item_type: &str) -> Result<Value, Error> {
        self.cached_template(
            item_type,
            vec![("itemType".to_string(), item_type.to_string())],
        )
        .await
    }

    async fn attachment_template(&self, link_mode: &str) -> Result<Value, Error> {
        self.cached_template(
            &format!("attachment-{link_mode}"),
            vec![
                ("itemType".to_string(), "attachment".to_string()),
                ("linkMode".to_string(), link_mode.to_string()),
            ],
        )
        .await
    }

    async fn cached_template(
        &self,
        cache_key: &str,
        query: Vec<(String, String)>,
    ) -> Result<Value, Error> {
        if let Some(template) = self
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cache_key)
        {
            return Ok(template.clone());
        }
        // the template endpoint is not library-scoped
        let spec = RequestSpec::get(self.transport.api_url("/items/new")).query(query);
        let template = self.transport.execute(spec).await?.json()?;
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key.to_string(), template.clone());
        Ok(template)
    }

    // ==================== Attachments ====================

    /// Uploads files as `imported_file` attachments.
    ///
    /// When `parent` is given the attachments are created as children of
    /// that item. Titles default to file basenames. Uploads are processed
    /// sequentially; one file's failure is reported in the returned
    /// [`BatchOutcome`] without aborting the rest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyItems`] past the 50-file ceiling and
    /// [`Error::FileDoesNotExist`] for an unreadable file, both before
    /// any network call. A registration failure is fatal to the batch
    /// and propagates as its typed error.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn attach_files(
        &self,
        files: &[PathBuf],
        parent: Option<&str>,
        titles: Option<&[String]>,
    ) -> Result<BatchOutcome, Error> {
        upload::ensure_batch_size(files)?;
        upload::verify_readable(files).await?;

        let template = self.attachment_template("imported_file").await?;
        let mut templates = Vec::with_capacity(files.len());
        for (idx, path) in files.iter().enumerate() {
            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let title = titles
                .and_then(|t| t.get(idx))
                .cloned()
                .unwrap_or_else(|| basename.clone());
            let mut entry = template.clone();
            if let Some(object) = entry.as_object_mut() {
                object.insert("title".to_string(), Value::String(title));
                object.insert("filename".to_string(), Value::String(basename));
            }
            templates.push(entry);
        }

        info!(batch = files.len(), "starting attachment upload");
        let prefix = self.library_prefix();
        Uploader::new(&self.transport, &prefix)
            .upload_batch(templates, files, parent)
            .await
    }
}

/// Extracts the `key` and `version` a write operation requires.
fn key_and_version(payload: &Value) -> Result<(&str, u64), Error> {
    let key = payload
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::param_not_passed("key"))?;
    let version = payload
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::param_not_passed("version"))?;
    Ok((key, version))
}

fn collection_memberships(item: &Value) -> Vec<String> {
    item.get("data")
        .and_then(|d| d.get("collections"))
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn tag_names(page: Page) -> Vec<String> {
    page.into_items()
        .into_iter()
        .filter_map(|entry| {
            entry
                .get("tag")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

fn total_from(response: &crate::transport::ApiResponse) -> u64 {
    response
        .header(crate::paginate::TOTAL_RESULTS_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
