// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket endpoint derivation.
//!
//! The publishing endpoint lives next to the tracker's web page: the page URL
//! with its scheme upgraded (`https` to `wss`, `http` to `ws`) and a fixed
//! suffix appended to the path.

use tokio_tungstenite::tungstenite::http::Uri;

use crate::error::EndpointError;

/// Suffix of the location publishing endpoint.
pub const PUBLISH_SUFFIX: &str = "fusion";

/// Suffix of the inbound vehicle update endpoint.
pub const UPDATES_SUFFIX: &str = "updates";

/// Derive a socket URL from a page URL.
///
/// The suffix is appended to the page path as-is, so `http://host/tracker/`
/// with `fusion` gives `ws://host/tracker/fusion`.
pub fn socket_url(page_url: &str, suffix: &str) -> Result<String, EndpointError> {
    let uri: Uri = page_url
        .parse()
        .map_err(|e| EndpointError::InvalidUrl(format!("{page_url} ({e})")))?;

    let scheme = match uri.scheme_str() {
        Some("https") => "wss",
        Some("http") => "ws",
        Some(other) => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        None => return Err(EndpointError::InvalidUrl(page_url.to_string())),
    };

    let authority = uri
        .authority()
        .ok_or_else(|| EndpointError::MissingHost(page_url.to_string()))?;
    let host = match authority.port_u16() {
        Some(port) => format!("{}:{port}", authority.host()),
        None => authority.host().to_string(),
    };

    let path = match uri.path() {
        "" => "/",
        path => path,
    };

    Ok(format!("{scheme}://{host}{path}{suffix}"))
}

/// Use `explicit` when configured, otherwise derive from `page_url`.
pub fn resolve(explicit: Option<&str>, page_url: &str, suffix: &str) -> Result<String, EndpointError> {
    match explicit {
        Some(url) => Ok(url.to_string()),
        None => socket_url(page_url, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_becomes_wss() {
        assert_eq!(
            socket_url("https://shuttles.example.edu/", PUBLISH_SUFFIX).unwrap(),
            "wss://shuttles.example.edu/fusion"
        );
    }

    #[test]
    fn test_http_keeps_port_and_path() {
        assert_eq!(
            socket_url("http://localhost:8080/tracker/", PUBLISH_SUFFIX).unwrap(),
            "ws://localhost:8080/tracker/fusion"
        );
    }

    #[test]
    fn test_query_is_not_carried_over() {
        assert_eq!(
            socket_url("http://localhost/?debug=1", UPDATES_SUFFIX).unwrap(),
            "ws://localhost/updates"
        );
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert_eq!(
            socket_url("ftp://localhost/", PUBLISH_SUFFIX),
            Err(EndpointError::UnsupportedScheme("ftp".to_string()))
        );
    }

    #[test]
    fn test_rejects_relative_url() {
        assert!(matches!(
            socket_url("/tracker/", PUBLISH_SUFFIX),
            Err(EndpointError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_explicit_url_wins() {
        assert_eq!(
            resolve(Some("ws://other:9000/feed"), "http://localhost/", PUBLISH_SUFFIX).unwrap(),
            "ws://other:9000/feed"
        );
        assert_eq!(
            resolve(None, "http://localhost/", PUBLISH_SUFFIX).unwrap(),
            "ws://localhost/fusion"
        );
    }
}
