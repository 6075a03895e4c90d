use crate::address::AuthorAddress;
use crate::doc::{cmp_newest_first, Doc};
use crate::path::Path;
use std::collections::BTreeMap;

/// Whether a query sees every version of a path or only the winner.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HistoryMode {
    /// One document per path: the newest across all authors.
    #[default]
    Latest,
    /// One document per (path, author): the full retained history.
    All,
}

/// Result ordering.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OrderBy {
    /// Path ascending, newest first within a path.
    #[default]
    PathAsc,
    /// Path descending, oldest first within a path.
    PathDesc,
    /// Ingest order, oldest first.
    LocalIndexAsc,
    /// Ingest order, newest first.
    LocalIndexDesc,
}

/// Predicates a query applies to individual documents.
///
/// Every populated field must hold for a document to match. Text lengths
/// are measured in bytes of the UTF-8 encoding, not characters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryFilter {
    /// Exact path.
    pub path: Option<Path>,
    /// Path prefix.
    pub path_starts_with: Option<String>,
    /// Path suffix.
    pub path_ends_with: Option<String>,
    /// Path glob: `*` matches within a segment, `**` across segments.
    pub path_glob: Option<String>,
    /// Exact author.
    pub author: Option<AuthorAddress>,
    /// Exact timestamp.
    pub timestamp: Option<u64>,
    /// Timestamp strictly greater than.
    pub timestamp_gt: Option<u64>,
    /// Timestamp strictly less than.
    pub timestamp_lt: Option<u64>,
    /// Exact text byte length.
    pub text_length: Option<u64>,
    /// Text byte length strictly greater than.
    pub text_length_gt: Option<u64>,
    /// Text byte length strictly less than.
    pub text_length_lt: Option<u64>,
}

/// A replica query.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Query {
    /// History mode; defaults to [`HistoryMode::Latest`].
    pub history: HistoryMode,
    /// Ordering; defaults to [`OrderBy::PathAsc`].
    pub order: OrderBy,
    /// Maximum number of documents returned.
    pub limit: Option<usize>,
    /// Per-document predicates.
    pub filter: Option<QueryFilter>,
    /// Format tags to admit; `None` admits every format.
    pub formats: Option<Vec<String>>,
}

/// What a canonicalised query can possibly return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WillMatch {
    /// No predicate at all: every live document matches.
    All,
    /// Some subset may match.
    Some,
    /// The query is self-contradictory and matches nothing.
    Nothing,
}

/// Canonicalises a query and judges what it can match. Queries that cannot
/// match anything short-circuit: callers skip the driver entirely.
pub fn clean_up_query(query: &Query) -> (Query, WillMatch) {
    let mut query = query.clone();

    if query.limit == Some(0) {
        return (query, WillMatch::Nothing);
    }
    if matches!(&query.formats, Some(formats) if formats.is_empty()) {
        return (query, WillMatch::Nothing);
    }
    if let Some(filter) = &mut query.filter {
        // A glob without a wildcard is an exact path; a glob that is not
        // even a legal path can never match a stored document.
        if let Some(glob) = &filter.glob_without_wildcards() {
            match Path::parse(glob) {
                Ok(path) => {
                    filter.path_glob = None;
                    filter.path = Some(path);
                }
                Err(_) => return (query, WillMatch::Nothing),
            }
        }
        let contradictory = matches!(
            (filter.timestamp, filter.timestamp_lt),
            (Some(eq), Some(lt)) if eq >= lt
        ) || matches!(
            (filter.timestamp, filter.timestamp_gt),
            (Some(eq), Some(gt)) if eq <= gt
        ) || matches!(
            (filter.timestamp_gt, filter.timestamp_lt),
            (Some(gt), Some(lt)) if gt.checked_add(1).map_or(true, |g| g >= lt)
        ) || matches!(
            (filter.text_length, filter.text_length_lt),
            (Some(eq), Some(lt)) if eq >= lt
        ) || matches!(
            (filter.text_length, filter.text_length_gt),
            (Some(eq), Some(gt)) if eq <= gt
        );
        if contradictory {
            return (query, WillMatch::Nothing);
        }
        if *filter == QueryFilter::default() {
            query.filter = None;
        }
    }

    let unbounded = query.filter.is_none() && query.formats.is_none() && query.limit.is_none();
    if unbounded {
        (query, WillMatch::All)
    } else {
        (query, WillMatch::Some)
    }
}

impl QueryFilter {
    fn glob_without_wildcards(&self) -> Option<String> {
        match &self.path_glob {
            Some(glob) if !glob.contains('*') => Some(glob.clone()),
            _ => None,
        }
    }
}

/// Whether `doc` satisfies every populated predicate of `filter`.
pub fn doc_matches_filter(doc: &Doc, filter: &QueryFilter) -> bool {
    let path = doc.path.as_str();
    let text_len = doc.text.len() as u64;
    if matches!(&filter.path, Some(p) if *p != doc.path) {
        return false;
    }
    if matches!(&filter.path_starts_with, Some(p) if !path.starts_with(p.as_str())) {
        return false;
    }
    if matches!(&filter.path_ends_with, Some(p) if !path.ends_with(p.as_str())) {
        return false;
    }
    if matches!(&filter.path_glob, Some(g) if !glob_matches(g.as_bytes(), path.as_bytes())) {
        return false;
    }
    if matches!(&filter.author, Some(a) if *a != doc.author) {
        return false;
    }
    if matches!(filter.timestamp, Some(t) if doc.timestamp != t) {
        return false;
    }
    if matches!(filter.timestamp_gt, Some(t) if doc.timestamp <= t) {
        return false;
    }
    if matches!(filter.timestamp_lt, Some(t) if doc.timestamp >= t) {
        return false;
    }
    if matches!(filter.text_length, Some(l) if text_len != l) {
        return false;
    }
    if matches!(filter.text_length_gt, Some(l) if text_len <= l) {
        return false;
    }
    if matches!(filter.text_length_lt, Some(l) if text_len >= l) {
        return false;
    }
    true
}

fn glob_matches(pattern: &[u8], text: &[u8]) -> bool {
    if pattern.is_empty() {
        return text.is_empty();
    }
    if pattern[0] == b'*' {
        let crosses = pattern.get(1) == Some(&b'*');
        let rest = if crosses { &pattern[2..] } else { &pattern[1..] };
        let mut i = 0;
        loop {
            if glob_matches(rest, &text[i..]) {
                return true;
            }
            if i >= text.len() || (!crosses && text[i] == b'/') {
                return false;
            }
            i += 1;
        }
    }
    !text.is_empty() && pattern[0] == text[0] && glob_matches(&pattern[1..], &text[1..])
}

/// Runs a canonicalised query over a full document set. Drivers that can
/// only scan delegate here; drivers with richer storage push down what they
/// can and post-filter the rest through the same predicates.
pub fn execute(query: &Query, docs: Vec<Doc>, now: u64) -> Vec<Doc> {
    let (query, will_match) = clean_up_query(query);
    if will_match == WillMatch::Nothing {
        return Vec::new();
    }

    let mut docs: Vec<Doc> = docs
        .into_iter()
        .filter(|doc| !doc.is_expired(now))
        .filter(|doc| match &query.formats {
            Some(formats) => formats.iter().any(|f| *f == doc.format),
            None => true,
        })
        .filter(|doc| match &query.filter {
            Some(filter) => doc_matches_filter(doc, filter),
            None => true,
        })
        .collect();

    if query.history == HistoryMode::Latest {
        let mut latest: BTreeMap<Path, Doc> = BTreeMap::new();
        for doc in docs {
            match latest.get(&doc.path) {
                Some(winner) if cmp_newest_first(winner, &doc).is_le() => {}
                _ => {
                    latest.insert(doc.path.clone(), doc);
                }
            }
        }
        docs = latest.into_values().collect();
    }

    match query.order {
        OrderBy::PathAsc => {
            docs.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| cmp_newest_first(a, b)));
        }
        OrderBy::PathDesc => {
            docs.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| cmp_newest_first(a, b)));
            docs.reverse();
        }
        OrderBy::LocalIndexAsc => {
            docs.sort_by_key(|doc| doc.local_index.unwrap_or(0));
        }
        OrderBy::LocalIndexDesc => {
            docs.sort_by_key(|doc| std::cmp::Reverse(doc.local_index.unwrap_or(0)));
        }
    }

    if let Some(limit) = query.limit {
        docs.truncate(limit);
    }
    docs
}
