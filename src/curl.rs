//! Debug command-line rendering of a request.
//!
//! Produces a `curl` invocation reproducing the current representation:
//! method, session and request headers merged with request scope winning,
//! the cookie header rendered via `-b`, credentials via `-u`, and the body
//! via `--data` with shell escaping.

use http::header::COOKIE;
use http::{HeaderMap, Method};

use crate::types::{Credential, HttpRequest};

fn escape(value: &str) -> String {
    value.replace('\'', "'\\''")
}

pub(crate) fn curl_representation(
    request: &HttpRequest,
    session_headers: &HeaderMap,
    credential: Option<&Credential>,
) -> String {
    let mut components = vec!["curl -v".to_string()];

    if request.method != Method::GET {
        components.push(format!("-X {}", request.method));
    }

    if let Some(credential) = credential {
        components.push(format!(
            "-u '{}':'{}'",
            escape(&credential.username),
            escape(&credential.password)
        ));
    }

    // Request-scope headers win over session scope; cookies render via -b.
    let mut merged = session_headers.clone();
    for (name, value) in request.headers.iter() {
        merged.insert(name.clone(), value.clone());
    }

    if let Some(cookie) = merged.get(COOKIE) {
        if let Ok(cookie) = cookie.to_str() {
            components.push(format!("-b '{}'", escape(cookie)));
        }
    }

    let mut header_lines: Vec<String> = merged
        .iter()
        .filter(|(name, _)| **name != COOKIE)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| format!("-H '{}: {}'", name.as_str(), escape(value)))
        })
        .collect();
    header_lines.sort();
    components.extend(header_lines);

    if let Some(body) = &request.body {
        let body = String::from_utf8_lossy(body);
        components.push(format!("--data '{}'", escape(&body)));
    }

    components.push(format!("'{}'", request.url));

    components.join(" \\\n\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, ACCEPT, AUTHORIZATION};
    use url::Url;

    fn request() -> HttpRequest {
        HttpRequest::post(
            Url::parse("https://example.com/submit").expect("static url"),
            "a='1'",
        )
    }

    #[test]
    fn renders_method_body_and_url() {
        let rendered = curl_representation(&request(), &HeaderMap::new(), None);
        assert!(rendered.starts_with("curl -v"));
        assert!(rendered.contains("-X POST"));
        assert!(rendered.contains("--data 'a='\\''1'\\'''"));
        assert!(rendered.ends_with("'https://example.com/submit'"));
    }

    #[test]
    fn request_headers_override_session_scope() {
        let mut session = HeaderMap::new();
        session.insert(ACCEPT, HeaderValue::from_static("text/plain"));
        session.insert(AUTHORIZATION, HeaderValue::from_static("Bearer session"));

        let req = request().with_header(ACCEPT, HeaderValue::from_static("application/json"));
        let rendered = curl_representation(&req, &session, None);
        assert!(rendered.contains("-H 'accept: application/json'"));
        assert!(!rendered.contains("text/plain"));
        assert!(rendered.contains("-H 'authorization: Bearer session'"));
    }

    #[test]
    fn cookie_header_renders_as_cookie_flag() {
        let req = request().with_header(COOKIE, HeaderValue::from_static("session=abc"));
        let rendered = curl_representation(&req, &HeaderMap::new(), None);
        assert!(rendered.contains("-b 'session=abc'"));
        assert!(!rendered.contains("-H 'cookie"));
    }

    #[test]
    fn credentials_are_quoted_and_escaped() {
        let credential = Credential::new("user", "pa'ss");
        let rendered = curl_representation(&request(), &HeaderMap::new(), Some(&credential));
        assert!(rendered.contains("-u 'user':'pa'\\''ss'"));
    }
}
