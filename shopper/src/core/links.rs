//! URL helpers for seed URLs and page hrefs.

use url::Url;

/// Prefix `https://` onto schemeless seed URLs such as `www.shop.test`.
pub fn format_seed_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Resolve `href` against the page it was found on.
///
/// Returns `None` for hrefs that cannot lead to another page (fragments,
/// `javascript:`, `mailto:`, `tel:`) or that do not resolve to http(s).
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let resolved = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base).ok()?.join(href).ok()?,
        Err(_) => return None,
    };
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

/// Resolve a batch of hrefs, dropping unusable ones and repeats but keeping order.
pub fn absolutize_all(base: &str, hrefs: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(hrefs.len());
    for href in hrefs {
        if let Some(url) = absolutize(base, href)
            && !out.contains(&url)
        {
            out.push(url);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_url_gets_scheme() {
        assert_eq!(format_seed_url("www.shop.test"), "https://www.shop.test");
        assert_eq!(format_seed_url("http://shop.test/x"), "http://shop.test/x");
    }

    #[test]
    fn relative_hrefs_resolve_against_page() {
        let base = "https://shop.test/collections/shoes";
        assert_eq!(
            absolutize(base, "/products/runner").as_deref(),
            Some("https://shop.test/products/runner")
        );
        assert_eq!(
            absolutize(base, "sale").as_deref(),
            Some("https://shop.test/collections/sale")
        );
        assert_eq!(
            absolutize(base, "https://other.test/a").as_deref(),
            Some("https://other.test/a")
        );
    }

    #[test]
    fn non_navigable_hrefs_are_dropped() {
        let base = "https://shop.test/";
        assert_eq!(absolutize(base, "#top"), None);
        assert_eq!(absolutize(base, "javascript:void(0)"), None);
        assert_eq!(absolutize(base, "mailto:help@shop.test"), None);
        assert_eq!(absolutize(base, "  "), None);
    }

    #[test]
    fn absolutize_all_dedups_in_order() {
        let hrefs = vec![
            "/a".to_string(),
            "https://shop.test/a".to_string(),
            "#x".to_string(),
            "/b".to_string(),
        ];
        assert_eq!(
            absolutize_all("https://shop.test/", &hrefs),
            vec!["https://shop.test/a".to_string(), "https://shop.test/b".to_string()]
        );
    }
}
