//! Response serializers.
//!
//! A serializer turns one terminal snapshot (request, response, buffered
//! body, error) into a typed value. Serializers run strictly in FIFO order
//! on the serialization context, one at a time, after the owning attempt's
//! terminal error and response are fixed; a serializer never observes a
//! half-updated snapshot.

use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;

use crate::errors::{Error, Result};
use crate::types::{HttpRequest, HttpResponse};

/// Status codes for which an empty body is a valid serialization input.
pub const DEFAULT_EMPTY_RESPONSE_CODES: &[StatusCode] =
    &[StatusCode::NO_CONTENT, StatusCode::RESET_CONTENT];

/// Decode step run against the terminal snapshot of one finish cycle.
pub trait ResponseSerializer: Send + Sync + 'static {
    type Output: Send + 'static;

    fn serialize(
        &self,
        request: Option<&HttpRequest>,
        response: Option<&HttpResponse>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<Self::Output>;
}

fn empty_allowed(response: Option<&HttpResponse>) -> bool {
    response.is_some_and(|r| DEFAULT_EMPTY_RESPONSE_CODES.contains(&r.status))
}

/// Hands back the raw buffered bytes.
pub struct BytesSerializer;

impl ResponseSerializer for BytesSerializer {
    type Output = Bytes;

    fn serialize(
        &self,
        _request: Option<&HttpRequest>,
        response: Option<&HttpResponse>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<Bytes> {
        if let Some(error) = error {
            return Err(error.clone());
        }
        match data {
            Some(data) => Ok(data.clone()),
            None if empty_allowed(response) => Ok(Bytes::new()),
            None => Err(Error::response_serialization("response contained no data")),
        }
    }
}

/// Decodes the body as UTF-8 text.
pub struct StringSerializer;

impl ResponseSerializer for StringSerializer {
    type Output = String;

    fn serialize(
        &self,
        request: Option<&HttpRequest>,
        response: Option<&HttpResponse>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<String> {
        let bytes = BytesSerializer.serialize(request, response, data, error)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::response_serialization(err))
    }
}

/// Decodes the body as JSON into `T`.
pub struct JsonSerializer<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseSerializer for JsonSerializer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn serialize(
        &self,
        request: Option<&HttpRequest>,
        response: Option<&HttpResponse>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<T> {
        let bytes = BytesSerializer.serialize(request, response, data, error)?;
        serde_json::from_slice(&bytes).map_err(|err| Error::response_serialization(err))
    }
}

/// Typed terminal response delivered to a completion handler.
#[derive(Debug)]
pub struct DataResponse<T> {
    /// Current request representation at finish, when one was produced.
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    /// Buffered body bytes at finish.
    pub data: Option<Bytes>,
    /// Retries performed before this terminal snapshot.
    pub retry_count: u32,
    pub result: Result<T>,
}

impl<T> DataResponse<T> {
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn bytes_serializer_propagates_terminal_error() {
        let err = Error::ExplicitlyCancelled;
        let result = BytesSerializer.serialize(None, None, Some(&Bytes::from_static(b"x")), Some(&err));
        assert!(matches!(result, Err(Error::ExplicitlyCancelled)));
    }

    #[test]
    fn empty_body_is_valid_for_no_content() {
        let response = HttpResponse::new(StatusCode::NO_CONTENT);
        let bytes = BytesSerializer
            .serialize(None, Some(&response), None, None)
            .expect("204 with no body");
        assert!(bytes.is_empty());
    }

    #[test]
    fn json_serializer_decodes_and_reports_failures() {
        #[derive(Deserialize)]
        struct Payload {
            id: u32,
        }

        let response = HttpResponse::new(StatusCode::OK);
        let good = Bytes::from_static(b"{\"id\":7}");
        let decoded: Payload = JsonSerializer::new()
            .serialize(None, Some(&response), Some(&good), None)
            .expect("valid json");
        assert_eq!(decoded.id, 7);

        let bad = Bytes::from_static(b"{\"id\":");
        let result: Result<Payload> =
            JsonSerializer::new().serialize(None, Some(&response), Some(&bad), None);
        assert!(matches!(result, Err(Error::ResponseSerialization { .. })));
    }
}
