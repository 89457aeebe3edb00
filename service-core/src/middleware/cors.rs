//! Per-instance CORS origin allow-list.
//!
//! Each `OriginChecker` owns its set; clones share it, separate instances
//! never do.

use axum::http::{HeaderValue, Method};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

#[derive(Clone, Default)]
pub struct OriginChecker {
    origins: Arc<RwLock<HashSet<String>>>,
}

impl OriginChecker {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let origins = origins
            .into_iter()
            .map(|o| normalize(&o.into()))
            .filter(|o| !o.is_empty())
            .collect();
        Self {
            origins: Arc::new(RwLock::new(origins)),
        }
    }

    pub fn add_origin(&self, origin: &str) {
        let origin = normalize(origin);
        if origin.is_empty() {
            return;
        }
        match self.origins.write() {
            Ok(mut set) => {
                set.insert(origin);
            }
            Err(e) => tracing::error!("CORS origin set lock poisoned: {}", e),
        }
    }

    pub fn remove_origin(&self, origin: &str) {
        if let Ok(mut set) = self.origins.write() {
            set.remove(&normalize(origin));
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.origins
            .read()
            .map(|set| set.contains("*") || set.contains(&normalize(origin)))
            .unwrap_or(false)
    }

    /// A `CorsLayer` that consults this checker on every preflight and request.
    pub fn layer(&self) -> CorsLayer {
        let checker = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts| {
                    origin
                        .to_str()
                        .map(|o| checker.is_allowed(o))
                        .unwrap_or(false)
                },
            ))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(AllowHeaders::mirror_request())
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_share_origins() {
        let first = OriginChecker::new(["https://one.example.com"]);
        let second = OriginChecker::new(Vec::<String>::new());

        first.add_origin("https://two.example.com");

        assert!(first.is_allowed("https://two.example.com"));
        assert!(!second.is_allowed("https://two.example.com"));
        assert!(!second.is_allowed("https://one.example.com"));
    }

    #[test]
    fn test_clones_share_origins() {
        let checker = OriginChecker::default();
        let clone = checker.clone();
        clone.add_origin("https://app.example.com/");

        assert!(checker.is_allowed("https://APP.example.com"));
        checker.remove_origin("https://app.example.com");
        assert!(!clone.is_allowed("https://app.example.com"));
    }

    #[test]
    fn test_wildcard() {
        let checker = OriginChecker::new(["*"]);
        assert!(checker.is_allowed("https://anything.example.org"));
    }
}
