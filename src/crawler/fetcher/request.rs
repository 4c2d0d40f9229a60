use crate::state::{FetchType, FormField};
use url::form_urlencoded;

/// Accept header sent when no literal Accept lines are configured
pub const DEFAULT_ACCEPT: &str = "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Everything that goes on the wire for one request, in header order
#[derive(Debug, Default)]
pub(crate) struct RequestSpec<'a> {
    pub method: &'static str,
    pub target: String,
    pub http11: bool,
    pub host: String,
    pub user_agent: &'a str,
    /// `Connection: close` or `Proxy-Connection: close`
    pub close_header: Option<&'static str>,
    /// Literal Accept lines; `None` sends [`DEFAULT_ACCEPT`]
    pub accept_lines: Option<&'a [String]>,
    pub accept_compression: bool,
    pub range_end: Option<u64>,
    pub if_modified_since: Option<&'a str>,
    pub if_none_match: Option<&'a str>,
    pub cookie: Option<String>,
    pub authorization: Option<&'a str>,
    pub proxy_authorization: Option<&'a str>,
    pub form_body: Option<String>,
}

impl RequestSpec<'_> {
    /// Serializes the request head and body
    pub fn render(&self) -> Vec<u8> {
        let version = if self.http11 { "HTTP/1.1" } else { "HTTP/1.0" };
        let mut head = format!("{} {} {}\r\n", self.method, self.target, version);

        head.push_str(&format!("Host: {}\r\n", self.host));
        head.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        if let Some(close) = self.close_header {
            head.push_str(&format!("{}: close\r\n", close));
        }
        match self.accept_lines {
            Some(lines) => {
                for line in lines {
                    head.push_str(line);
                    head.push_str("\r\n");
                }
            }
            None => {
                head.push_str(DEFAULT_ACCEPT);
                head.push_str("\r\n");
            }
        }
        if self.accept_compression {
            head.push_str("Accept-Encoding: gzip,deflate\r\n");
        }
        if let Some(end) = self.range_end {
            head.push_str(&format!("Range: bytes=0-{}\r\n", end));
        }
        if let Some(date) = self.if_modified_since {
            head.push_str(&format!("If-Modified-Since: {}\r\n", date));
        }
        if let Some(etag) = self.if_none_match {
            head.push_str(&format!("If-None-Match: {}\r\n", etag));
        }
        if let Some(cookie) = &self.cookie {
            head.push_str(&format!("Cookie: {}\r\n", cookie));
        }
        if let Some(auth) = self.authorization {
            head.push_str(&format!("Authorization: {}\r\n", auth));
        }
        if let Some(auth) = self.proxy_authorization {
            head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        if let Some(body) = &self.form_body {
            head.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if let Some(body) = &self.form_body {
            bytes.extend_from_slice(body.as_bytes());
        }
        bytes
    }
}

/// `application/x-www-form-urlencoded` body for a POST, UTF-8, `+` for space
pub fn form_body(fields: &[FormField]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for field in fields {
        serializer.append_pair(&field.name, &field.value);
    }
    serializer.finish()
}

/// The form body to send for a fetch type, if any
pub(crate) fn body_for(fetch_type: FetchType, fields: &[FormField]) -> Option<String> {
    match fetch_type {
        FetchType::Post => Some(form_body(fields)),
        FetchType::Get => None,
    }
}
