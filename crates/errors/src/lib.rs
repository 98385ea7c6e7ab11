use std::borrow::Cow;

use http::StatusCode;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags an error with the information the
/// panel needs to decide whether to retry it, surface it, or swallow it.
///
/// The msg is shown to the user in the error banner.
///
/// The short_msg is used as a tag - available for tests and for log
/// filtering - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg InvalidDocumentId
    pub short_msg: Cow<'static, str>,
    /// human readable - user facing. Should be longer and descriptive.
    /// Eg "The document id is invalid because it contains an invalid character"
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr, strum::Display)]
pub enum ErrorCode {
    /// Malformed input, type mismatches on inline edits, 4xx responses.
    BadRequest,
    /// Missing or expired credentials.
    Unauthenticated,
    Forbidden,
    NotFound,
    /// 429s and exhausted GitHub rate limits.
    RateLimited,
    /// 5xx responses.
    Overloaded,
    /// The request never produced a response.
    Network,
    /// The caller aborted the operation. Never shown to the user.
    Canceled,
}

impl ErrorMetadata {
    fn tagged(
        code: ErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Bad Request. Maps to 400 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the user.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::tagged(ErrorCode::BadRequest, short_msg, msg)
    }

    /// Resource not found. Maps to 404 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// FileNotFound).
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::tagged(ErrorCode::NotFound, short_msg, msg)
    }

    /// Not authenticated. Maps to 401 in HTTP.
    ///
    /// Callers that see this should drop the stored credential and prompt
    /// the user to sign in again.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::tagged(ErrorCode::Unauthenticated, short_msg, msg)
    }

    /// Forbidden. Maps to 403 in HTTP.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::tagged(ErrorCode::Forbidden, short_msg, msg)
    }

    /// Rate limited by the remote service. Maps to 429 in HTTP.
    pub fn rate_limited(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::tagged(ErrorCode::RateLimited, short_msg, msg)
    }

    /// The remote service answered with a 5xx.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::tagged(ErrorCode::Overloaded, short_msg, msg)
    }

    /// Transport level failure: DNS, connection reset, timeout.
    pub fn network(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::tagged(ErrorCode::Network, NETWORK_ERROR, msg)
    }

    /// The operation was aborted by its caller.
    pub fn canceled() -> Self {
        Self::tagged(ErrorCode::Canceled, CANCELED, CANCELED_MSG)
    }

    /// Classify a non-success HTTP response. Returns `None` for statuses
    /// that are not errors.
    pub fn from_http_status(status: StatusCode, msg: impl Into<Cow<'static, str>>) -> Option<Self> {
        let code = ErrorCode::from_http_status_code(status)?;
        let short_msg: &'static str = code.into();
        Some(Self::tagged(code, short_msg, msg))
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code == ErrorCode::Unauthenticated
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == ErrorCode::Forbidden
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_rate_limited(&self) -> bool {
        self.code == ErrorCode::RateLimited
    }

    pub fn is_canceled(&self) -> bool {
        self.code == ErrorCode::Canceled
    }

    /// Transient errors that a backoff loop may retry.
    pub fn is_retriable(&self) -> bool {
        match self.code {
            ErrorCode::RateLimited | ErrorCode::Overloaded | ErrorCode::Network => true,
            ErrorCode::BadRequest
            | ErrorCode::Unauthenticated
            | ErrorCode::Forbidden
            | ErrorCode::NotFound
            | ErrorCode::Canceled => false,
        }
    }

    /// Whether the error should reach the user-visible banner.
    pub fn should_surface(&self) -> bool {
        self.code != ErrorCode::Canceled
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Network => StatusCode::BAD_GATEWAY,
            // nginx's "client closed request"
            ErrorCode::Canceled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            },
        }
    }

    pub fn from_http_status_code(code: StatusCode) -> Option<Self> {
        match code {
            StatusCode::UNAUTHORIZED => Some(ErrorCode::Unauthenticated),
            StatusCode::FORBIDDEN => Some(ErrorCode::Forbidden),
            StatusCode::NOT_FOUND => Some(ErrorCode::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Some(ErrorCode::RateLimited),
            // Tries to categorize in one of the above more specific 4xx codes first,
            // otherwise categorizes as a general 4xx via BadRequest
            v if v.is_client_error() => Some(ErrorCode::BadRequest),
            v if v.is_server_error() => Some(ErrorCode::Overloaded),
            _ => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn error_code(&self) -> Option<ErrorCode>;
    fn is_bad_request(&self) -> bool;
    fn is_unauthenticated(&self) -> bool;
    fn is_forbidden(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_rate_limited(&self) -> bool;
    fn is_canceled(&self) -> bool;
    fn is_retriable(&self) -> bool;
    fn should_surface(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn http_status(&self) -> StatusCode;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

/// The outermost [`ErrorMetadata`] in the chain.
fn metadata(e: &anyhow::Error) -> Option<&ErrorMetadata> {
    e.downcast_ref::<ErrorMetadata>()
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_code(&self) -> Option<ErrorCode> {
        metadata(self).map(|e| e.code)
    }

    fn is_bad_request(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_unauthenticated(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_unauthenticated)
    }

    fn is_forbidden(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_forbidden)
    }

    fn is_not_found(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_not_found)
    }

    fn is_rate_limited(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_rate_limited)
    }

    fn is_canceled(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_canceled)
    }

    /// Untagged errors are not retried: we only retry what we classified as
    /// transient at the throw site.
    fn is_retriable(&self) -> bool {
        metadata(self).is_some_and(ErrorMetadata::is_retriable)
    }

    fn should_surface(&self) -> bool {
        metadata(self).is_none_or(ErrorMetadata::should_surface)
    }

    /// The banner text: the tagged message, else the error's own display.
    fn user_facing_message(&self) -> String {
        match metadata(self) {
            Some(e) => e.to_string(),
            None => self.to_string(),
        }
    }

    fn short_msg(&self) -> &str {
        metadata(self).map_or(UNCLASSIFIED_ERROR, |e| &*e.short_msg)
    }

    fn msg(&self) -> &str {
        metadata(self).map_or(UNCLASSIFIED_ERROR_MSG, |e| &*e.msg)
    }

    fn http_status(&self) -> StatusCode {
        metadata(self).map_or(StatusCode::INTERNAL_SERVER_ERROR, |e| {
            e.code.http_status_code()
        })
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        let tagged = metadata(&self).cloned();
        match tagged {
            Some(e) => self.context(f(e)),
            None => self,
        }
    }

    /// Wrap the underlying error message, maintaining the underlying error
    /// metadata short code if it exists.
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        let tagged = metadata(&self).cloned();
        match tagged {
            Some(mut tagged) => {
                tagged.msg = f(tagged.msg.to_string()).into();
                self.context(tagged)
            },
            None => {
                let wrapped = f(self.to_string());
                self.context(wrapped)
            },
        }
    }
}

pub const UNCLASSIFIED_ERROR: &str = "UnclassifiedError";
pub const UNCLASSIFIED_ERROR_MSG: &str = "Something went wrong. Try again later.";
pub const NETWORK_ERROR: &str = "NetworkError";
const CANCELED: &str = "Canceled";
const CANCELED_MSG: &str = "The operation was canceled.";

#[cfg(any(test, feature = "testing"))]
mod arbitrary_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::Unauthenticated => ErrorMetadata::unauthenticated("un", "auth"),
                    ErrorCode::Forbidden => ErrorMetadata::forbidden("for", "bidden"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::RateLimited => ErrorMetadata::rate_limited("rate", "limited"),
                    ErrorCode::Overloaded => ErrorMetadata::overloaded("over", "loaded"),
                    ErrorCode::Network => ErrorMetadata::network("connection reset"),
                    ErrorCode::Canceled => ErrorMetadata::canceled(),
                })
                .boxed()
        }
    }
}
