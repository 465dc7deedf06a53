//! Queries over a replica's documents.
//!
//! A [`Query`] describes which documents to return and in what order.
//! [`clean_up_query`] canonicalises a query and classifies how much it can
//! possibly match, so impossible queries short-circuit before touching a
//! driver. [`doc_matches_filter`] is the reference predicate semantics;
//! drivers share [`execute_query`] for whatever part of a query they cannot
//! push into their indexes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::{
    check_author_is_valid, check_path_is_valid, check_share_is_valid, path_is_ephemeral,
    PATH_PUNCTUATION,
};
use crate::document::{cmp_newest_first, Document, Timestamp};
use crate::error::ValidationError;

/// Whether to return every stored version of a path or only the winner.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// Only the latest document per path, picked by the history comparator.
    #[default]
    Latest,
    /// Every stored document, including superseded ones.
    All,
}

/// Result ordering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderBy {
    /// Path ascending; within a path, newest first.
    #[default]
    #[serde(rename = "path ASC")]
    PathAsc,
    /// Path descending; within a path, newest first.
    #[serde(rename = "path DESC")]
    PathDesc,
    /// Ingest order, oldest first.
    #[serde(rename = "localIndex ASC")]
    LocalIndexAsc,
    /// Ingest order, newest first.
    #[serde(rename = "localIndex DESC")]
    LocalIndexDesc,
}

/// Per-document predicates of a [`Query`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryFilter {
    /// Exact path match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Path prefix match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_starts_with: Option<String>,
    /// Path suffix match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_ends_with: Option<String>,
    /// Path glob match: `*` matches within a path segment, `**` across
    /// segments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    /// Exact timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Timestamp strictly greater than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_gt: Option<Timestamp>,
    /// Timestamp strictly less than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_lt: Option<Timestamp>,
    /// Exact content length, in bytes of the UTF-8 encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// Content length strictly greater than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length_gt: Option<u64>,
    /// Content length strictly less than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length_lt: Option<u64>,
    /// Exact author address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Exact share address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,
}

impl QueryFilter {
    fn is_empty(&self) -> bool {
        self == &QueryFilter::default()
    }
}

/// A description of which documents to fetch.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Query {
    /// All versions or only the winner per path. Defaults to the winner.
    pub history_mode: HistoryMode,
    /// Result ordering. Defaults to path ascending.
    pub order_by: OrderBy,
    /// Maximum number of documents to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Per-document predicates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryFilter>,
    /// Only return documents of these formats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formats: Option<Vec<String>>,
}

impl Query {
    /// A query for every version of every document.
    pub fn all() -> Self {
        Query {
            history_mode: HistoryMode::All,
            ..Default::default()
        }
    }

    /// A query for the latest document per path.
    pub fn latest() -> Self {
        Query::default()
    }

    /// Set the filter.
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the ordering.
    pub fn with_order(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// How much of a replica a canonicalised query can possibly match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WillMatch {
    /// Every stored document matches.
    All,
    /// Some documents may match.
    Some,
    /// Nothing can match; skip the driver entirely.
    Nothing,
}

fn is_glob_char(c: char) -> bool {
    c == '*' || c.is_ascii_alphanumeric() || PATH_PUNCTUATION.contains(c)
}

fn filter_is_impossible(filter: &QueryFilter) -> bool {
    if let Some(author) = &filter.author {
        if check_author_is_valid(author).is_err() {
            return true;
        }
    }
    if let Some(share) = &filter.share {
        if check_share_is_valid(share).is_err() {
            return true;
        }
    }
    if let Some(path) = &filter.path {
        if check_path_is_valid(path, path_is_ephemeral(path)).is_err() {
            return true;
        }
    }
    if let Some(glob) = &filter.path_glob {
        if !glob.chars().all(is_glob_char) {
            return true;
        }
    }
    if let (Some(eq), Some(gt)) = (filter.timestamp, filter.timestamp_gt) {
        if eq <= gt {
            return true;
        }
    }
    if let (Some(eq), Some(lt)) = (filter.timestamp, filter.timestamp_lt) {
        if eq >= lt {
            return true;
        }
    }
    if let (Some(gt), Some(lt)) = (filter.timestamp_gt, filter.timestamp_lt) {
        if lt <= gt + 1 {
            return true;
        }
    }
    if let (Some(eq), Some(gt)) = (filter.content_length, filter.content_length_gt) {
        if eq <= gt {
            return true;
        }
    }
    if let (Some(eq), Some(lt)) = (filter.content_length, filter.content_length_lt) {
        if eq >= lt {
            return true;
        }
    }
    if let (Some(gt), Some(lt)) = (filter.content_length_gt, filter.content_length_lt) {
        if lt <= gt + 1 {
            return true;
        }
    }
    false
}

/// Canonicalise a query and classify how much it can match.
///
/// A query that cannot possibly match anything (a zero limit, an author
/// filter that is not a valid address, contradictory bounds) collapses to
/// [`WillMatch::Nothing`] so callers can short-circuit.
pub fn clean_up_query(query: &Query) -> (Query, WillMatch) {
    let mut query = query.clone();
    if let Some(filter) = &query.filter {
        if filter.is_empty() {
            query.filter = None;
        }
    }

    if query.limit == Some(0) {
        return (query, WillMatch::Nothing);
    }
    if matches!(&query.formats, Some(f) if f.is_empty()) {
        return (query, WillMatch::Nothing);
    }
    if let Some(filter) = &query.filter {
        if filter_is_impossible(filter) {
            return (query, WillMatch::Nothing);
        }
    }

    let unrestricted = query.filter.is_none()
        && query.formats.is_none()
        && query.limit.is_none()
        && query.history_mode == HistoryMode::All;
    let will_match = if unrestricted {
        WillMatch::All
    } else {
        WillMatch::Some
    };
    (query, will_match)
}

/// Translate a path glob into an anchored regex: `**` matches any
/// characters, `*` any characters except `/`.
pub(crate) fn glob_to_regex(glob: &str) -> Result<regex::Regex, ValidationError> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            if chars.peek() == Some(&'*') {
                chars.next();
                pattern.push_str(".*");
            } else {
                pattern.push_str("[^/]*");
            }
        } else {
            pattern.push_str(&regex::escape(&c.to_string()));
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern)
        .map_err(|err| ValidationError::new(format!("invalid path glob: {err}")))
}

/// A [`QueryFilter`] with its glob pre-compiled, for matching many docs.
#[derive(Debug)]
pub(crate) struct PreparedFilter<'a> {
    filter: &'a QueryFilter,
    glob: Option<regex::Regex>,
}

impl<'a> PreparedFilter<'a> {
    pub(crate) fn new(filter: &'a QueryFilter) -> Result<Self, ValidationError> {
        let glob = filter
            .path_glob
            .as_deref()
            .map(glob_to_regex)
            .transpose()?;
        Ok(PreparedFilter { filter, glob })
    }

    pub(crate) fn matches(&self, doc: &Document) -> bool {
        let f = self.filter;
        if matches!(&f.path, Some(path) if &doc.path != path) {
            return false;
        }
        if matches!(&f.path_starts_with, Some(prefix) if !doc.path.starts_with(prefix.as_str())) {
            return false;
        }
        if matches!(&f.path_ends_with, Some(suffix) if !doc.path.ends_with(suffix.as_str())) {
            return false;
        }
        if matches!(&self.glob, Some(re) if !re.is_match(&doc.path)) {
            return false;
        }
        if matches!(f.timestamp, Some(t) if doc.timestamp != t) {
            return false;
        }
        if matches!(f.timestamp_gt, Some(t) if doc.timestamp <= t) {
            return false;
        }
        if matches!(f.timestamp_lt, Some(t) if doc.timestamp >= t) {
            return false;
        }
        let len = doc.content_length();
        if matches!(f.content_length, Some(l) if len != l) {
            return false;
        }
        if matches!(f.content_length_gt, Some(l) if len <= l) {
            return false;
        }
        if matches!(f.content_length_lt, Some(l) if len >= l) {
            return false;
        }
        if matches!(&f.author, Some(author) if &doc.author != author) {
            return false;
        }
        if matches!(&f.share, Some(share) if &doc.share != share) {
            return false;
        }
        true
    }
}

/// Does `doc` satisfy `filter`? Content length is measured in bytes of the
/// UTF-8 encoding.
///
/// For matching many documents against one filter, drivers use the
/// pre-compiled form inside [`execute_query`] instead.
pub fn doc_matches_filter(doc: &Document, filter: &QueryFilter) -> bool {
    match PreparedFilter::new(filter) {
        Ok(prepared) => prepared.matches(doc),
        Err(_) => false,
    }
}

/// Run the reference query semantics over an iterator of documents.
///
/// Expired documents are filtered lazily against `now`; history reduction,
/// ordering and the limit are applied in that order.
pub(crate) fn execute_query(
    docs: impl IntoIterator<Item = Document>,
    query: &Query,
    now: Timestamp,
) -> Result<Vec<Document>, ValidationError> {
    let (query, will_match) = clean_up_query(query);
    if will_match == WillMatch::Nothing {
        return Ok(Vec::new());
    }

    let empty_filter = QueryFilter::default();
    let prepared = PreparedFilter::new(query.filter.as_ref().unwrap_or(&empty_filter))?;

    let mut matching: Vec<Document> = docs
        .into_iter()
        .filter(|doc| !doc.is_expired(now))
        .filter(|doc| match &query.formats {
            Some(formats) => formats.iter().any(|f| f == &doc.format),
            None => true,
        })
        .filter(|doc| prepared.matches(doc))
        .collect();

    if query.history_mode == HistoryMode::Latest {
        // winner per path among the docs that survived filtering
        let mut latest: BTreeMap<String, Document> = BTreeMap::new();
        for doc in matching.drain(..) {
            match latest.get(&doc.path) {
                Some(winner) if cmp_newest_first(winner, &doc).is_le() => {}
                _ => {
                    latest.insert(doc.path.clone(), doc);
                }
            }
        }
        matching = latest.into_values().collect();
    }

    match query.order_by {
        OrderBy::PathAsc => matching.sort_by(|a, b| {
            a.path.cmp(&b.path).then_with(|| cmp_newest_first(a, b))
        }),
        OrderBy::PathDesc => matching.sort_by(|a, b| {
            b.path.cmp(&a.path).then_with(|| cmp_newest_first(a, b))
        }),
        OrderBy::LocalIndexAsc => {
            matching.sort_by_key(|doc| doc.local_index.unwrap_or(0));
        }
        OrderBy::LocalIndexDesc => {
            matching.sort_by_key(|doc| std::cmp::Reverse(doc.local_index.unwrap_or(0)));
        }
    }

    if let Some(limit) = query.limit {
        matching.truncate(limit as usize);
    }
    Ok(matching)
}
