//! Path keys for non-global fragments.

use super::config::CacheConfig;

/// The parts of an incoming request that distinguish non-global fragments.
#[derive(Debug, Clone, Copy)]
pub struct RequestPath<'a> {
    /// Request served by the control panel rather than the public site.
    pub control_panel: bool,
    pub path: &'a str,
    /// 1-based page number of paginated listings.
    pub page: u32,
    pub query: Option<&'a str>,
}

impl<'a> RequestPath<'a> {
    pub fn site(path: &'a str) -> Self {
        Self {
            control_panel: false,
            path,
            page: 1,
            query: None,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn with_query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }

    /// Derive the stored path key, e.g. `site:blog/p2?sort=asc`.
    pub fn derive(&self, config: &CacheConfig) -> String {
        let prefix = if self.control_panel { "cp:" } else { "site:" };
        let mut key = format!("{prefix}{}", self.path.trim_matches('/'));

        if self.page != 1 {
            key.push('/');
            key.push_str(&config.page_trigger);
            key.push_str(&self.page.to_string());
        }

        if let Some(query) = self.query {
            let rest = strip_param(query, &config.path_query_param);
            if !rest.is_empty() {
                key.push('?');
                key.push_str(&rest);
            }
        }

        key
    }
}

/// Remove every `name=value` pair for `param`, keeping other pairs verbatim.
fn strip_param(query: &str, param: &str) -> String {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(param))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_path_gets_prefix() {
        let config = CacheConfig::default();
        assert_eq!(RequestPath::site("/blog/").derive(&config), "site:blog");
    }

    #[test]
    fn control_panel_requests_use_cp_prefix() {
        let config = CacheConfig::default();
        let request = RequestPath {
            control_panel: true,
            ..RequestPath::site("entries")
        };
        assert_eq!(request.derive(&config), "cp:entries");
    }

    #[test]
    fn page_segment_is_appended_after_first_page() {
        let config = CacheConfig::default();
        assert_eq!(
            RequestPath::site("blog").with_page(1).derive(&config),
            "site:blog"
        );
        assert_eq!(
            RequestPath::site("blog").with_page(3).derive(&config),
            "site:blog/p3"
        );
    }

    #[test]
    fn path_param_is_stripped_from_query() {
        let config = CacheConfig::default();
        let request = RequestPath::site("blog").with_query("p=blog&sort=asc&p=again");
        assert_eq!(request.derive(&config), "site:blog?sort=asc");
    }

    #[test]
    fn lookalike_params_survive() {
        let config = CacheConfig::default();
        let request = RequestPath::site("blog").with_query("xp=1&p=blog");
        assert_eq!(request.derive(&config), "site:blog?xp=1");
    }

    #[test]
    fn query_with_only_path_param_is_dropped() {
        let config = CacheConfig::default();
        let request = RequestPath::site("blog").with_query("p=blog");
        assert_eq!(request.derive(&config), "site:blog");
    }
}
