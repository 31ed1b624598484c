//! Pagination Controller
//!
//! Links are absolute URLs derived from the request URL with `offset` and
//! `limit` recomputed; every other query parameter is kept. Columnar-backed
//! lists never report a total count, so "more" is inferred from a full page.

use crate::error::{ResolverError, Result};
use reqwest::Url;
use serde::Serialize;

/// A full page means there may be more.
pub fn has_more(count: usize, limit: u32) -> bool {
    count as i64 > limit as i64 - 1
}

/// `None` on a partial page, or when the next offset would not fit a `u32`.
pub fn next_offset(count: usize, offset: u32, limit: u32) -> Option<u32> {
    if has_more(count, limit) {
        offset.checked_add(limit)
    } else {
        None
    }
}

pub fn previous_offset(offset: u32, limit: u32) -> Option<u32> {
    offset.checked_sub(limit)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageLinks {
    pub next: Option<String>,
    pub previous: Option<String>,
}

/// Links for a columnar-backed list page holding `count` rows.
pub fn page_links(url: &str, offset: u32, limit: u32, count: usize) -> Result<PageLinks> {
    let next = next_offset(count, offset, limit)
        .map(|o| offset_url(url, o, limit))
        .transpose()?;
    let previous = previous_offset(offset, limit)
        .map(|o| offset_url(url, o, limit))
        .transpose()?;
    Ok(PageLinks { next, previous })
}

/// The first page of the same request.
pub fn initial_url(url: &str, limit: u32) -> Result<String> {
    offset_url(url, 0, limit)
}

pub fn offset_url(url: &str, offset: u32, limit: u32) -> Result<String> {
    rewrite_query(
        url,
        &["offset", "limit"],
        &[("limit", limit.to_string()), ("offset", offset.to_string())],
    )
}

/// Property catalog pages skip the count query. `next` is offered whenever
/// the page had rows; `previous` loses its offset at the first page.
pub fn catalog_links(url: &str, offset: u32, limit: u32, count: usize) -> Result<PageLinks> {
    let next = match offset.checked_add(limit) {
        Some(next) if count > 0 => Some(offset_url(url, next, limit)?),
        _ => None,
    };
    let previous = if offset == 0 {
        None
    } else if offset <= limit {
        Some(rewrite_query(url, &["offset"], &[])?)
    } else {
        Some(offset_url(url, offset - limit, limit)?)
    };
    Ok(PageLinks { next, previous })
}

/// Links for 1-based `page`/`limit` activity pages.
pub fn activity_links(
    url: &str,
    page: u32,
    limit: u32,
    has_next: bool,
    has_previous: bool,
) -> Result<PageLinks> {
    let link = |page: u32| {
        rewrite_query(
            url,
            &["page", "limit"],
            &[("limit", limit.to_string()), ("page", page.to_string())],
        )
    };
    Ok(PageLinks {
        next: page
            .checked_add(1)
            .filter(|_| has_next)
            .map(&link)
            .transpose()?,
        previous: page
            .checked_sub(1)
            .filter(|_| has_previous)
            .map(&link)
            .transpose()?,
    })
}

fn rewrite_query(url: &str, remove: &[&str], set: &[(&str, String)]) -> Result<String> {
    let mut parsed = Url::parse(url)
        .map_err(|e| ResolverError::validation("Invalid request URL", e.to_string()))?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !remove.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() && set.is_empty() {
        parsed.set_query(None);
    } else {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (key, value) in &kept {
            query.append_pair(key, value);
        }
        for (key, value) in set {
            query.append_pair(key, value);
        }
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://testserver/api/person/?properties=%5B%5D&limit=100";

    #[test]
    fn test_full_first_page() {
        let links = page_links(URL, 0, 100, 100).unwrap();
        assert_eq!(
            links.next.as_deref(),
            Some("http://testserver/api/person/?properties=%5B%5D&limit=100&offset=100")
        );
        assert_eq!(links.previous, None);
    }

    #[test]
    fn test_partial_page_has_no_next() {
        let links = page_links(URL, 0, 100, 99).unwrap();
        assert_eq!(links.next, None);
    }

    #[test]
    fn test_previous_offsets() {
        assert_eq!(previous_offset(50, 100), None);
        assert_eq!(previous_offset(150, 100), Some(50));
        assert_eq!(previous_offset(100, 100), Some(0));

        let links = page_links(URL, 150, 100, 10).unwrap();
        assert!(links.previous.unwrap().ends_with("limit=100&offset=50"));
    }

    #[test]
    fn test_initial_url_resets_offset() {
        let url = "http://testserver/api/person/funnel/?offset=300&insight=FUNNELS";
        assert_eq!(
            initial_url(url, 100).unwrap(),
            "http://testserver/api/person/funnel/?insight=FUNNELS&limit=100&offset=0"
        );
    }

    #[test]
    fn test_catalog_links() {
        let url = "http://testserver/api/property_definition/?search=ema&offset=20&limit=20";
        let links = catalog_links(url, 20, 20, 5).unwrap();
        assert_eq!(
            links.previous.as_deref(),
            Some("http://testserver/api/property_definition/?search=ema&limit=20")
        );
        assert!(links.next.unwrap().ends_with("search=ema&limit=20&offset=40"));

        let empty = catalog_links(url, 20, 20, 0).unwrap();
        assert_eq!(empty.next, None);
    }

    #[test]
    fn test_offsets_near_u32_max_have_no_next() {
        assert_eq!(next_offset(100, u32::MAX, 100), None);
        let links = page_links(URL, u32::MAX, 100, 100).unwrap();
        assert_eq!(links.next, None);
        assert!(links.previous.unwrap().ends_with(&format!("offset={}", u32::MAX - 100)));

        let catalog = catalog_links(URL, u32::MAX - 5, 20, 20).unwrap();
        assert_eq!(catalog.next, None);
        assert!(catalog.previous.is_some());

        let activity = activity_links(URL, u32::MAX, 10, true, true).unwrap();
        assert_eq!(activity.next, None);
        assert!(activity.previous.is_some());
    }

    #[test]
    fn test_activity_links() {
        let url = "http://testserver/api/person/activity/?page=2";
        let links = activity_links(url, 2, 10, true, true).unwrap();
        assert_eq!(
            links.next.as_deref(),
            Some("http://testserver/api/person/activity/?limit=10&page=3")
        );
        assert_eq!(
            links.previous.as_deref(),
            Some("http://testserver/api/person/activity/?limit=10&page=1")
        );
    }
}
