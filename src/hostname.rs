//! Hostname → subdomain extraction.
//!
//! Pluggable: the dispatcher is handed this as a plain function pointer, not
//! hard-wired, so an embedder can swap in a public-suffix-list-aware
//! implementation without touching the tunnel core.

/// Strip an optional `:port` suffix and lowercase the host part.
fn host_only(host: &str) -> String {
    let without_port = host.split(':').next().unwrap_or(host);
    without_port.to_ascii_lowercase()
}

/// Extract the tunnel id implied by a `Host` header, or `None` if this
/// request targets the control plane (bare apex / no matching subdomain).
pub fn extract(host: &str, domain: Option<&str>) -> Option<String> {
    let host = host_only(host);
    if host.is_empty() {
        return None;
    }

    // `*.localhost[:port]` is always honored, regardless of `domain`.
    if let Some(rest) = host.strip_suffix(".localhost") {
        return first_label(rest);
    }

    match domain {
        Some(domain) => {
            let domain = domain.to_ascii_lowercase();
            if host == domain {
                return None;
            }
            let suffix = format!(".{domain}");
            host.strip_suffix(&suffix).and_then(first_label)
        }
        None => {
            // No registrable domain configured: best-effort leftmost label
            // of any multi-label host, except an IP literal — its
            // dot-separated octets are not subdomain labels.
            if host.parse::<std::net::IpAddr>().is_ok() {
                return None;
            }
            let mut labels = host.split('.');
            let first = labels.next()?;
            if labels.next().is_none() {
                // Single-label host (e.g. bare "localhost" or an unqualified
                // name) — nothing to strip a subdomain from.
                None
            } else {
                Some(first.to_string())
            }
        }
    }
}

fn first_label(rest: &str) -> Option<String> {
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_special_case() {
        assert_eq!(extract("abcd.localhost", None), Some("abcd".into()));
        assert_eq!(extract("abcd.localhost:8080", None), Some("abcd".into()));
        assert_eq!(extract("abcd.localhost", Some("example.com")), Some("abcd".into()));
    }

    #[test]
    fn configured_domain() {
        assert_eq!(
            extract("abcd.example.com", Some("example.com")),
            Some("abcd".into())
        );
        assert_eq!(extract("example.com", Some("example.com")), None);
        assert_eq!(extract("other.com", Some("example.com")), None);
    }

    #[test]
    fn no_domain_configured_fallback() {
        assert_eq!(extract("abcd.example.com", None), Some("abcd".into()));
        assert_eq!(extract("localhost", None), None);
        assert_eq!(extract("203.0.113.4", None), None);
    }

    #[test]
    fn never_panics_on_garbage() {
        assert_eq!(extract("", None), None);
        assert_eq!(extract(":::", None), None);
        assert_eq!(extract(".", Some("example.com")), None);
    }
}
