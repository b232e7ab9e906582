use std::sync::Mutex;

use cookie::time::OffsetDateTime;
use cookie::Cookie;
use http::HeaderValue;
use url::Url;

use crate::error::{Error, Result};

/// Storage consulted on every request hop
///
/// Persistence is up to the implementation; the engine only stores
/// `Set-Cookie` values and asks for the `Cookie` header of the next hop.
pub trait CookieStore: Send + Sync {
    /// Store the `Set-Cookie` values received from `url`
    fn set_cookies(&self, url: &Url, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>);

    /// `Cookie` header value for a request to `url`
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;
}

#[derive(Debug, Clone)]
struct StoredCookie {
    cookie: Cookie<'static>,
    /// Domain without a leading dot
    domain: String,
    /// Domain attribute absent; only the exact host matches
    host_only: bool,
    /// From Max-Age, else Expires; `None` for session cookies
    expires_at: Option<OffsetDateTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return false,
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        let path = self.cookie.path().unwrap_or("/");
        let path_ok = url.path() == path
            || (url.path().starts_with(path)
                && (path.ends_with('/') || url.path()[path.len()..].starts_with('/')));
        let secure_ok = !self.cookie.secure().unwrap_or(false) || url.scheme() == "https";
        domain_ok && path_ok && secure_ok
    }

    fn same_slot(&self, other: &StoredCookie) -> bool {
        self.cookie.name() == other.cookie.name()
            && self.domain == other.domain
            && self.cookie.path() == other.cookie.path()
    }
}

/// In-memory cookie jar
///
/// This provides a thread-safe way to store and retrieve cookies
/// for HTTP requests and responses.
#[derive(Debug, Default)]
pub struct CookieJar {
    inner: Mutex<Vec<StoredCookie>>,
}

impl CookieJar {
    /// Create a new empty cookie jar
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cookie as if `url` had set it
    pub fn add_from_string(&self, cookie_str: &str, url: &Url) -> Result<()> {
        let cookie = Cookie::parse(cookie_str)
            .map_err(|e| Error::cookie(format!("Failed to parse cookie: {}", e)))?;
        self.store(cookie.into_owned(), url);
        Ok(())
    }

    fn store(&self, mut cookie: Cookie<'static>, url: &Url) {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return;
        };
        let (domain, host_only) = match cookie.domain() {
            Some(domain) => {
                let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                // A host may only set cookies for itself or a parent domain.
                if host != domain && !host.ends_with(&format!(".{}", domain)) {
                    tracing::debug!(cookie = cookie.name(), %domain, "ignoring cookie for foreign domain");
                    return;
                }
                (domain, false)
            }
            None => (host, true),
        };
        if cookie.path().is_none() {
            cookie.set_path(default_path(url));
        }
        let now = OffsetDateTime::now_utc();
        // Max-Age wins over Expires; a non-positive Max-Age deletes.
        let expires_at = match cookie.max_age() {
            Some(age) if age.is_zero() || age.is_negative() => Some(now),
            Some(age) => now.checked_add(age),
            None => cookie.expires_datetime(),
        };
        let stored = StoredCookie {
            cookie,
            domain,
            host_only,
            expires_at,
        };
        let expired = stored.is_expired(now);

        if let Ok(mut jar) = self.inner.lock() {
            jar.retain(|existing| !existing.same_slot(&stored));
            if !expired {
                jar.push(stored);
            }
        }
    }

    /// Get cookies for a specific URL
    pub fn cookies_for_url(&self, url: &Url) -> Vec<Cookie<'static>> {
        let now = OffsetDateTime::now_utc();
        match self.inner.lock() {
            Ok(mut jar) => {
                jar.retain(|stored| !stored.is_expired(now));
                jar.iter()
                    .filter(|stored| stored.matches(url))
                    .map(|stored| stored.cookie.clone())
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Get the number of cookies in the jar
    pub fn len(&self) -> usize {
        self.inner.lock().map(|jar| jar.len()).unwrap_or(0)
    }

    /// Check if the cookie jar is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all cookies
    pub fn clear(&self) {
        if let Ok(mut jar) = self.inner.lock() {
            jar.clear();
        }
    }
}

impl CookieStore for CookieJar {
    fn set_cookies(&self, url: &Url, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>) {
        for value in cookie_headers {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|s| Cookie::parse(s.to_string()).ok());
            match parsed {
                Some(cookie) => self.store(cookie, url),
                None => tracing::debug!("ignoring malformed Set-Cookie header"),
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let header = self
            .cookies_for_url(url)
            .iter()
            .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
            .collect::<Vec<_>>()
            .join("; ");
        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}
