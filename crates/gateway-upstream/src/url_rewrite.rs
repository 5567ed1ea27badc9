//! Target URL construction, including the `/v1/responses` compatibility
//! shim.

use crate::error::{Error, Result};

/// Suffix that marks the base URL as pointing at the codex backend, which
/// gets the `/responses/compact` rewrite.
const CODEX_BASE_SUFFIX: &str = "/backend-api/codex";

/// Inbound path prefix that triggers the rewrite when the base ends in
/// [`CODEX_BASE_SUFFIX`].
const RESPONSES_PATH_PREFIX: &str = "/backend-api/codex/v1/responses";

const COMPACT_PATH: &str = "/backend-api/codex/responses/compact";

/// Build the upstream target URL for an inbound `path_and_query` (e.g.
/// `/v1/chat?foo=1`) against the configured base. Normally this is the
/// base's scheme/host with the base path and inbound path concatenated,
/// query preserved verbatim. The one exception: a base ending in
/// `…/backend-api/codex` with an inbound path starting
/// `/backend-api/codex/v1/responses` is rewritten wholesale to
/// `…/backend-api/codex/responses/compact`, dropping the query — an
/// upstream compatibility shim, not a general rule.
pub fn compute_target_url(base: &str, path_and_query: &str) -> Result<String> {
    let base_url = reqwest::Url::parse(base).map_err(|e| Error::InvalidBaseUrl(e.to_string()))?;
    let (path, query) = split_path_query(path_and_query);

    if base_url.path().ends_with(CODEX_BASE_SUFFIX) && path.starts_with(RESPONSES_PATH_PREFIX) {
        let mut rewritten = base_url;
        rewritten.set_path(COMPACT_PATH);
        rewritten.set_query(None);
        return Ok(rewritten.to_string());
    }

    let base_path = base_url.path().trim_end_matches('/');
    let mut target = base_url.clone();
    target.set_path(&format!("{base_path}{path}"));
    target.set_query(query);
    Ok(target.to_string())
}

fn split_path_query(path_and_query: &str) -> (&str, Option<&str>) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path_is_appended_with_query_preserved() {
        let target = compute_target_url("https://example.com/api", "/v1/chat?foo=1").unwrap();
        assert_eq!(target, "https://example.com/api/v1/chat?foo=1");
    }

    #[test]
    fn trailing_slash_on_base_is_not_doubled() {
        let target = compute_target_url("https://example.com/api/", "/v1/chat").unwrap();
        assert_eq!(target, "https://example.com/api/v1/chat");
    }

    #[test]
    fn responses_path_is_rewritten_to_compact_with_dropped_query() {
        let target = compute_target_url(
            "https://chatgpt.com/backend-api/codex",
            "/backend-api/codex/v1/responses/foo?x=1",
        )
        .unwrap();
        assert_eq!(target, "https://chatgpt.com/backend-api/codex/responses/compact");
    }

    #[test]
    fn rewrite_does_not_apply_to_other_bases() {
        let target = compute_target_url(
            "https://example.com/other",
            "/backend-api/codex/v1/responses/foo?x=1",
        )
        .unwrap();
        assert_eq!(target, "https://example.com/other/backend-api/codex/v1/responses/foo?x=1");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(compute_target_url("not a url", "/v1/chat").is_err());
    }
}
