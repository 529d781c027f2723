//! Paginated trade history
//!
//! History is pulled newest-first in fixed-size pages. Each page's oldest
//! timestamp is the exclusive cursor for the next one; a short page ends the
//! sequence. [`PageSequence`] is the lazy, forward-only page cache for one
//! scope and is thrown away whole when the scope changes.

use async_trait::async_trait;
use tracing::debug;

use crate::models::{Page, TokenInfo};

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Errors from the pull side (history or metadata).
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Non-success HTTP status
    Status { status: u16, body: String },
    /// Connection / timeout / TLS failure
    Transport(String),
    /// Body was not the expected JSON
    Decode(String),
    /// Decoded fine but unusable
    InvalidResponse(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Status { status, body } if body.is_empty() => {
                write!(f, "request failed with status {}", status)
            }
            FetchError::Status { status, body } => {
                write!(f, "request failed with status {}: {}", status, body)
            }
            FetchError::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchError::Decode(msg) => write!(f, "failed to decode response: {}", msg),
            FetchError::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// One history request: token, optional pool filter, page size, cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub token: String,
    pub pools: Vec<String>,
    pub limit: usize,
    /// Exclusive upper bound on trade timestamp (epoch ms)
    pub cursor: Option<i64>,
}

/// Pull-side data source: trade history pages and token metadata.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_page(&self, query: &HistoryQuery) -> Result<Page, FetchError>;

    async fn fetch_token_info(&self, address: &str) -> Result<TokenInfo, FetchError>;
}

/// A fetch handed out by [`PageSequence::next_request`], tagged with the
/// scope generation it was issued under.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub generation: u64,
    pub query: HistoryQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// Issued for a superseded scope; result discarded
    Stale,
    Failed(FetchError),
}

#[derive(Debug)]
pub struct PageSequence {
    pages: Vec<Page>,
    generation: u64,
    token: Option<String>,
    pool_filter: Vec<String>,
    page_size: usize,
    in_flight: Option<u64>,
    last_error: Option<FetchError>,
}

impl Default for PageSequence {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl PageSequence {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            generation: 0,
            token: None,
            pool_filter: Vec::new(),
            page_size: page_size.max(1),
            in_flight: None,
            last_error: None,
        }
    }

    /// Drop every fetched page and start over for `token`. An empty
    /// `pool_filter` pulls the token's trades across all pools. Any request
    /// still in flight becomes stale. Returns the new generation.
    pub fn restart(&mut self, token: Option<String>, pool_filter: Vec<String>) -> u64 {
        self.generation += 1;
        self.pages.clear();
        self.token = token;
        self.pool_filter = pool_filter;
        self.in_flight = None;
        self.last_error = None;
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether another page may exist. True before the first page lands.
    pub fn has_more(&self) -> bool {
        if self.token.is_none() {
            return false;
        }
        match self.pages.last() {
            None => true,
            Some(last) => last.has_more && last.cursor_timestamp.is_some(),
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    /// Next page to fetch, marking it in flight. None while a fetch is
    /// outstanding, without a token, or once the terminal page arrived.
    pub fn next_request(&mut self) -> Option<PageRequest> {
        if self.in_flight.is_some() || !self.has_more() {
            return None;
        }
        let token = self.token.clone()?;
        let cursor = self.pages.last().and_then(|p| p.cursor_timestamp);

        self.in_flight = Some(self.generation);
        Some(PageRequest {
            generation: self.generation,
            query: HistoryQuery {
                token,
                pools: self.pool_filter.clone(),
                limit: self.page_size,
                cursor,
            },
        })
    }

    /// Apply a completed fetch. Results from an older generation are ignored.
    pub fn apply(&mut self, generation: u64, result: Result<Page, FetchError>) -> ApplyOutcome {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "discarding history page for superseded scope"
            );
            return ApplyOutcome::Stale;
        }

        self.in_flight = None;
        match result {
            Ok(page) => {
                self.last_error = None;
                self.pages.push(page);
                ApplyOutcome::Applied
            }
            Err(e) => {
                self.last_error = Some(e.clone());
                ApplyOutcome::Failed(e)
            }
        }
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Mutable access to the newest page, where live trades are spliced.
    pub fn first_page_mut(&mut self) -> Option<&mut Page> {
        self.pages.first_mut()
    }
}
