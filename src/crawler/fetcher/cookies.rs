use cookie_store::{CookieStore, RawCookie};
use parking_lot::RwLock;
use url::Url;

/// Cookie jar shared by every fetch made through one engine
#[derive(Default)]
pub(crate) struct CookieJar {
    store: RwLock<CookieStore>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the `Set-Cookie` values of a response received from `url`
    pub fn store_response_cookies<'a>(&self, url: &Url, values: impl Iterator<Item = &'a str>) {
        let cookies: Vec<RawCookie<'static>> = values
            .filter_map(|value| match RawCookie::parse(value.to_string()) {
                Ok(cookie) => Some(cookie),
                Err(e) => {
                    tracing::debug!("{}: ignoring unparsable cookie {:?}: {}", url, value, e);
                    None
                }
            })
            .collect();
        if cookies.is_empty() {
            return;
        }
        self.store
            .write()
            .store_response_cookies(cookies.into_iter(), url);
    }

    /// The `Cookie` header value for a request to `url`, if any cookie matches
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let store = self.store.read();
        let pairs: Vec<String> = store
            .get_request_values(url)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().iter_unexpired().count()
    }
}
