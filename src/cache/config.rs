//! Fragment cache configuration.
//!
//! Built from the `[cache]` section of `tessera.toml`.

use std::time::Duration;

use url::Url;

const DEFAULT_SWEEP_THROTTLE_SECS: u64 = 86_400;
const FALLBACK_DURATION_SECS: u64 = 31_536_000;
const DEFAULT_PATH_QUERY_PARAM: &str = "p";
const DEFAULT_PAGE_TRIGGER: &str = "p";
const DEFAULT_RESOURCE_TRIGGER: &str = "cpresources";
const TRANSFORMS_SEGMENT: &str = "transforms";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; when off, scopes are never persisted and lookups miss.
    pub enabled: bool,
    /// Collect saved-query fingerprints and schedule deferred requery jobs.
    pub query_caching_enabled: bool,
    /// Lifetime of fragments written without an explicit TTL or expiration.
    /// Zero or negative falls back to one year.
    pub default_duration_seconds: i64,
    /// Minimum time between two expiry sweeps.
    pub sweep_throttle: Duration,
    /// Query parameter carrying the routed path; stripped from path keys.
    pub path_query_param: String,
    /// Prefix of the page segment appended for paginated requests.
    pub page_trigger: String,
    /// Public site URL; together with `resource_trigger` identifies
    /// on-the-fly transform URLs that must never be cached.
    pub site_url: Option<Url>,
    pub resource_trigger: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            query_caching_enabled: true,
            default_duration_seconds: 0,
            sweep_throttle: Duration::from_secs(DEFAULT_SWEEP_THROTTLE_SECS),
            path_query_param: DEFAULT_PATH_QUERY_PARAM.to_string(),
            page_trigger: DEFAULT_PAGE_TRIGGER.to_string(),
            site_url: None,
            resource_trigger: DEFAULT_RESOURCE_TRIGGER.to_string(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            query_caching_enabled: settings.query_caching_enabled,
            default_duration_seconds: settings.default_cache_duration_seconds,
            sweep_throttle: settings.sweep_throttle,
            path_query_param: settings.path_query_param.clone(),
            page_trigger: settings.page_trigger.clone(),
            site_url: settings.site_url.clone(),
            resource_trigger: settings.resource_trigger.clone(),
        }
    }
}

impl CacheConfig {
    /// Lifetime applied when a scope closes without TTL or expiration.
    pub fn default_duration(&self) -> Duration {
        match u64::try_from(self.default_duration_seconds) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_secs(FALLBACK_DURATION_SECS),
        }
    }

    /// Marker URL of generated-on-the-fly transforms, when a site URL is known.
    pub fn transient_resource_marker(&self) -> Option<String> {
        let site_url = self.site_url.as_ref()?;
        let base = site_url.as_str().trim_end_matches('/');
        Some(format!(
            "{base}/{}/{TRANSFORMS_SEGMENT}",
            self.resource_trigger.trim_matches('/')
        ))
    }
}
