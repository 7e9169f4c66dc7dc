//! RFC 2696 paged search as a lazy, single-use, non-restartable sequence (§4.4, §9).
//!
//! The cursor owns both the server cookie and the pooled session for the duration of
//! the enumeration; callers must drain it to completion or call [`PagedSearch::close`]
//! to abandon the cookie on early exit.

use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::{Scope, SearchEntry};
use tracing::warn;

use crate::net::PooledSession;

/// Recommended implementation maximum for a single page's size.
pub const MAX_PAGE_SIZE: i32 = 1000;

/// One page of a paged search.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<SearchEntry>,
    pub page_index: usize,
    pub has_more: bool,
}

/// A single-use, finite sequence of [`Page`]s produced by RFC 2696 paged results.
pub struct PagedSearch {
    session: Option<PooledSession>,
    base_dn: String,
    scope: Scope,
    filter: String,
    attributes: Vec<String>,
    page_size: i32,
    max_pages: usize,
    cookie: Vec<u8>,
    page_index: usize,
    finished: bool,
}

impl PagedSearch {
    #[must_use]
    pub fn new(
        session: PooledSession,
        base_dn: impl Into<String>,
        scope: Scope,
        filter: impl Into<String>,
        attributes: Vec<String>,
        page_size: i32,
        max_pages: usize,
    ) -> Self {
        Self {
            session: Some(session),
            base_dn: base_dn.into(),
            scope,
            filter: filter.into(),
            attributes,
            page_size: page_size.min(MAX_PAGE_SIZE).max(1),
            max_pages,
            cookie: Vec::new(),
            page_index: 0,
            finished: false,
        }
    }

    /// Advances to the next page, or `Ok(None)` once the cursor is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page>, super::GatewayError> {
        if self.finished || self.page_index >= self.max_pages {
            return Ok(None);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        let control = RawControl::from(PagedResults {
            size: self.page_size,
            cookie: self.cookie.clone(),
        });
        let (raw_entries, result) = session
            .ldap()
            .with_controls(control)
            .search(&self.base_dn, self.scope, &self.filter, self.attributes.clone())
            .await
            .map_err(|e| super::GatewayError::Search(e.to_string()))?
            .success()
            .map_err(|e| super::GatewayError::Search(e.to_string()))?;

        let entries = raw_entries.into_iter().map(SearchEntry::construct).collect();

        let next_cookie = result.ctrls.iter().find_map(|ctrl| match ctrl {
            Control(Some(ControlType::PagedResults), raw) => Some(raw.parse::<PagedResults>()),
            Control(None, raw) if raw.ctype == "1.2.840.113556.1.4.319" => {
                Some(raw.parse::<PagedResults>())
            }
            _ => None,
        });

        let has_more = match next_cookie {
            Some(pr) if !pr.cookie.is_empty() => {
                self.cookie = pr.cookie;
                true
            }
            Some(_) => {
                self.finished = true;
                false
            }
            None => {
                warn!("server returned no paged-results control; terminating cursor");
                self.finished = true;
                false
            }
        };

        let page = Page {
            entries,
            page_index: self.page_index,
            has_more,
        };
        self.page_index += 1;
        if !has_more {
            self.finished = true;
        }
        Ok(Some(page))
    }

    /// Abandons the pagination cookie (best-effort) and drops the borrowed session.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            if !self.cookie.is_empty() {
                let abandon = RawControl::from(PagedResults {
                    size: 0,
                    cookie: self.cookie.clone(),
                });
                let mut session = session;
                let _ = session
                    .ldap()
                    .with_controls(abandon)
                    .search(&self.base_dn, self.scope, &self.filter, Vec::<String>::new())
                    .await;
            }
        }
    }
}
