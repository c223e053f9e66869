//! Acting user of a request.

use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Serialize;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    id: Option<String>,
}

impl User {
    pub fn anonymous() -> Self {
        Self { id: None }
    }

    pub fn authenticated(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()) }
    }

    pub fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The user attached to the request by the authentication middleware.
    pub fn from_request(request: &Parts) -> Self {
        request
            .extensions
            .get::<User>()
            .cloned()
            .unwrap_or_else(User::anonymous)
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(User::authenticated)
            .unwrap_or_else(User::anonymous)
    }
}

/// Blocking user resolution, run off the async executor by the throttle layer.
pub trait UserLookup: Send + Sync {
    fn get_user(&self, request: &Parts) -> User;
}

/// Reads the user the authentication middleware stored in the request extensions.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionUserLookup;

impl UserLookup for ExtensionUserLookup {
    fn get_user(&self, request: &Parts) -> User {
        User::from_request(request)
    }
}

/// Trusts the `x-user-id` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderUserLookup;

impl UserLookup for HeaderUserLookup {
    fn get_user(&self, request: &Parts) -> User {
        User::from_headers(&request.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_from_request_defaults_to_anonymous() {
        let request = parts(Request::builder().uri("/"));
        assert!(!User::from_request(&request).is_authenticated());
    }

    #[test]
    fn test_extension_lookup() {
        let mut request = parts(Request::builder().uri("/"));
        request.extensions.insert(User::authenticated("42"));
        assert_eq!(ExtensionUserLookup.get_user(&request).id(), Some("42"));
    }

    #[test]
    fn test_header_lookup() {
        let request = parts(Request::builder().uri("/").header(USER_ID_HEADER, " alice "));
        assert_eq!(HeaderUserLookup.get_user(&request).id(), Some("alice"));

        let blank = parts(Request::builder().uri("/").header(USER_ID_HEADER, ""));
        assert!(!HeaderUserLookup.get_user(&blank).is_authenticated());
    }
}
