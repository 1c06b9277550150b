//! Link-following pagination over collection responses.
//!
//! The server paginates collection endpoints by `Link` response headers
//! carrying `self`, `first`, `next`, `last` and `alternate` relations. A
//! [`LinkSet`] is derived once per response and replaced wholesale by each
//! newer response; a single-resource response carries no links and leaves
//! the paginator in its terminal state, where following is a no-op rather
//! than an error.
//!
//! [`Paginator::follow`] walks one `next` link, [`Paginator::into_stream`]
//! exposes the walk as a lazy finite stream, and
//! [`Paginator::collect_all`] eagerly drains everything into one ordered
//! item list ("give me everything" semantics, following `next` links
//! regardless of the page size the caller asked for).

use std::collections::HashMap;
use std::sync::LazyLock;

use futures_util::Stream;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::{ApiResponse, RequestSpec, Transport};

/// Response header carrying the total size of the matched set.
pub const TOTAL_RESULTS_HEADER: &str = "Total-Results";

/// Matches one `<url>; rel="relation"` entry inside a Link header.
#[allow(clippy::expect_used)]
static LINK_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]+)>\s*;\s*rel="([^"]+)""#).expect("link regex is valid") // Static pattern, safe to panic
});

/// Link relations extracted from one response.
///
/// Maps relation names to path+query fragments relative to the API
/// endpoint root. Immutable once built, except for
/// [`LinkSet::restart_from_self`], which rewinds the cursor by writing the
/// `self` fragment into the `next` slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSet {
    relations: HashMap<String, String>,
}

impl LinkSet {
    /// Extracts link relations from response headers.
    ///
    /// Returns `None` when no `Link` header is present, which is the
    /// normal shape for a single-resource response.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut relations = HashMap::new();
        for value in headers.get_all(reqwest::header::LINK) {
            let Ok(text) = value.to_str() else { continue };
            for capture in LINK_ENTRY.captures_iter(text) {
                if let Some(fragment) = to_fragment(&capture[1]) {
                    relations.insert(capture[2].to_string(), fragment);
                }
            }
        }
        if relations.is_empty() {
            None
        } else {
            Some(Self { relations })
        }
    }

    /// The fragment for an arbitrary relation name.
    #[must_use]
    pub fn get(&self, relation: &str) -> Option<&str> {
        self.relations.get(relation).map(String::as_str)
    }

    /// The continuation fragment, if the server supplied one.
    #[must_use]
    pub fn next(&self) -> Option<&str> {
        self.get("next")
    }

    /// The fragment of the page this set was extracted from.
    #[must_use]
    pub fn self_link(&self) -> Option<&str> {
        self.get("self")
    }

    /// Writes the `self` fragment into the `next` slot so a fresh
    /// traversal starts again at the first page of the original query.
    pub fn restart_from_self(&mut self) {
        if let Some(own) = self.relations.get("self").cloned() {
            self.relations.insert("next".to_string(), own);
        }
    }
}

/// Reduces an absolute link URL to its path+query fragment.
fn to_fragment(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    Some(match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    })
}

/// One page of a collection response.
#[derive(Debug, Clone)]
pub struct Page {
    items: Vec<Value>,
    links: Option<LinkSet>,
    total_results: Option<u64>,
}

impl Page {
    /// Builds a page from a classified response.
    ///
    /// A JSON array becomes the page's items; any other JSON document is
    /// treated as a single-element page (single-resource responses flow
    /// through the same path and simply carry no links).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedResponse`] when the body is not JSON.
    pub fn from_response(response: &ApiResponse) -> Result<Self, Error> {
        let links = LinkSet::from_headers(response.headers());
        let total_results = response
            .header(TOTAL_RESULTS_HEADER)
            .and_then(|v| v.parse().ok());
        let items = match response.json()? {
            Value::Array(entries) => entries,
            other => vec![other],
        };
        Ok(Self {
            items,
            links,
            total_results,
        })
    }

    /// The page's items, in server order.
    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Consumes the page, returning its items.
    #[must_use]
    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    /// The link relations this page arrived with, if any.
    #[must_use]
    pub fn links(&self) -> Option<&LinkSet> {
        self.links.as_ref()
    }

    /// Total size of the matched set as reported by the server.
    #[must_use]
    pub fn total_results(&self) -> Option<u64> {
        self.total_results
    }

    /// Number of items on this page.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the page holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Cursor over a chain of pages connected by `next` relations.
///
/// Holds the freshest response's [`LinkSet`]; each completed request
/// replaces it (or clears it when the newest response carries no links).
/// Exhaustion is terminal unless [`Paginator::restart_from_self`] rewinds
/// the cursor to the original query's first page.
#[derive(Debug)]
pub struct Paginator<'a> {
    transport: &'a Transport,
    links: Option<LinkSet>,
    origin: Option<LinkSet>,
}

impl<'a> Paginator<'a> {
    /// Creates a cursor from an already-extracted link set.
    #[must_use]
    pub fn new(transport: &'a Transport, links: Option<LinkSet>) -> Self {
        Self {
            transport,
            origin: links.clone(),
            links,
        }
    }

    /// Creates a cursor positioned after the given page.
    #[must_use]
    pub fn from_page(transport: &'a Transport, page: &Page) -> Self {
        Self::new(transport, page.links().cloned())
    }

    /// Whether no continuation link remains.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.links.as_ref().and_then(LinkSet::next).is_none()
    }

    /// Requests the page behind the current `next` relation.
    ///
    /// Returns `Ok(None)` when the cursor is terminal. On success the
    /// cursor's link set is replaced from the fresh response.
    ///
    /// # Errors
    ///
    /// Propagates the transport's classified error when the request fails.
    pub async fn follow(&mut self) -> Result<Option<Page>, Error> {
        let Some(fragment) = self
            .links
            .as_ref()
            .and_then(LinkSet::next)
            .map(str::to_string)
        else {
            return Ok(None);
        };
        debug!(fragment = fragment.as_str(), "following continuation link");
        let response = self
            .transport
            .execute(RequestSpec::get(self.transport.api_url(&fragment)))
            .await?;
        let page = Page::from_response(&response)?;
        self.links = page.links().cloned();
        Ok(Some(page))
    }

    /// A lazy, finite, non-restartable stream of the remaining pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page, Error>> + 'a {
        futures_util::stream::try_unfold(self, |mut pager| async move {
            let next = pager.follow().await?;
            Ok::<_, Error>(next.map(|page| (page, pager)))
        })
    }

    /// Eagerly drains every remaining page starting from an
    /// already-fetched first page, concatenating all items in order.
    ///
    /// The cursor adopts the first page's links before draining, so the
    /// traversal continues exactly where that page left off. Page-size
    /// limits on the original query only shape how many requests this
    /// takes, not how much is returned.
    ///
    /// # Errors
    ///
    /// Propagates the first request failure; items already drained are
    /// dropped with it.
    pub async fn collect_all(&mut self, first_page: Page) -> Result<Vec<Value>, Error> {
        self.links = first_page.links().cloned();
        self.origin = self.links.clone();
        let mut items = first_page.into_items();
        while let Some(page) = self.follow().await? {
            items.extend(page.into_items());
        }
        Ok(items)
    }

    /// Rewinds the cursor to the first page of the original query by
    /// restoring the link set the cursor was created with and
    /// substituting its `self` fragment into the `next` slot.
    ///
    /// Costs one extra request for the page the cursor already saw, but
    /// lets a second full traversal start over after the cursor has been
    /// exhausted.
    pub fn restart_from_self(&mut self) {
        self.links = self.origin.clone();
        if let Some(links) = &mut self.links {
            links.restart_from_self();
        }
    }
}
