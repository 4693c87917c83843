use crate::config::AssetConfig;

use super::network::AssetRequest;

/// Extensions served cache-first regardless of path.
const STATIC_EXTENSIONS: &[&str] = &[
  "js", "css", "woff", "woff2", "ttf", "png", "jpg", "jpeg", "svg", "ico", "webp", "gif", "map",
];

/// How the worker answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve from cache; on miss fetch and store.
  CacheFirst,
  /// Fetch; on failure fall back to the cache.
  NetworkFirst,
  /// Always hit the network, never cache.
  NetworkOnly,
}

impl Strategy {
  pub fn label(&self) -> &'static str {
    match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirst => "network-first",
      Strategy::NetworkOnly => "network-only",
    }
  }
}

pub fn classify(request: &AssetRequest, config: &AssetConfig) -> Strategy {
  if !request.method.eq_ignore_ascii_case("GET") {
    return Strategy::NetworkOnly;
  }

  let path = request.path();
  if config
    .excluded_prefixes
    .iter()
    .any(|prefix| has_segment_prefix(path, prefix))
  {
    return Strategy::NetworkOnly;
  }

  if is_static(path, config) {
    Strategy::CacheFirst
  } else {
    Strategy::NetworkFirst
  }
}

fn is_static(path: &str, config: &AssetConfig) -> bool {
  if config
    .static_prefixes
    .iter()
    .any(|prefix| path.starts_with(prefix.as_str()))
  {
    return true;
  }

  let file = path.rsplit('/').next().unwrap_or(path);
  match file.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => STATIC_EXTENSIONS
      .iter()
      .any(|known| known.eq_ignore_ascii_case(ext)),
    _ => false,
  }
}

/// `/admin` matches `/admin` and `/admin/users` but not `/administrator`.
fn has_segment_prefix(path: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  if prefix.is_empty() {
    return false;
  }
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('/'),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn strategy(request: AssetRequest) -> Strategy {
    classify(&request, &AssetConfig::default())
  }

  #[test]
  fn test_static_assets_are_cache_first() {
    assert_eq!(strategy(AssetRequest::get("/static/js/app.js")), Strategy::CacheFirst);
    assert_eq!(strategy(AssetRequest::get("/fonts/inter.woff2")), Strategy::CacheFirst);
    assert_eq!(strategy(AssetRequest::get("/logo.PNG?v=3")), Strategy::CacheFirst);
    assert_eq!(strategy(AssetRequest::get("/static/data")), Strategy::CacheFirst);
  }

  #[test]
  fn test_pages_and_api_are_network_first() {
    assert_eq!(strategy(AssetRequest::navigate("/")), Strategy::NetworkFirst);
    assert_eq!(strategy(AssetRequest::navigate("/scouting")), Strategy::NetworkFirst);
    assert_eq!(
      strategy(AssetRequest::get("/scouting/api/teams")),
      Strategy::NetworkFirst
    );
    assert_eq!(strategy(AssetRequest::get("/.well-known")), Strategy::NetworkFirst);
  }

  #[test]
  fn test_excluded_prefixes_and_writes_bypass_cache() {
    assert_eq!(strategy(AssetRequest::get("/analytics")), Strategy::NetworkOnly);
    assert_eq!(strategy(AssetRequest::get("/admin/users")), Strategy::NetworkOnly);
    assert_eq!(strategy(AssetRequest::get("/admin/app.js")), Strategy::NetworkOnly);
    assert_eq!(strategy(AssetRequest::get("/administrator")), Strategy::NetworkFirst);

    let post = AssetRequest {
      method: "POST".to_string(),
      ..AssetRequest::get("/scouting/api/save")
    };
    assert_eq!(strategy(post), Strategy::NetworkOnly);
  }
}
