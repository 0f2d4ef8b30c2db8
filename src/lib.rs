//! Client-side request lifecycle engine for HTTP/WebSocket networking
//! stacks.
//!
//! `reqflow` sits between "a caller wants to issue a request" and "the
//! transport actually sends bytes": it owns construction, adaptation,
//! per-attempt transport-task creation, progress and redirect/cache
//! callbacks, validation, retry decisioning, response-serializer execution,
//! and cleanup for one logical request, while staying safe under concurrent
//! access from arbitrary caller threads.
//!
//! The wire transport is a collaborator behind the [`Transport`] trait; a
//! reference implementation over `reqwest` ships behind the `reqwest`
//! feature. Five request variants share one state machine by composition:
//! [`DataRequest`] (buffered body), [`StreamRequest`] (chunked delivery),
//! [`DownloadRequest`] (resumable file download), [`UploadRequest`] (lazily
//! resolved upload source), and [`SocketRequest`] (bidirectional messaging
//! with heartbeat).
//!
//! ```no_run
//! use std::sync::Arc;
//! use reqflow::{DataRequest, HttpRequest, ReqwestTransport, RequestConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(ReqwestTransport::with_default_client()?);
//! let url = url::Url::parse("https://example.com/status")?;
//! let request = DataRequest::new(RequestConfig::new(transport), move || {
//!     Ok(HttpRequest::get(url.clone()))
//! });
//! request
//!     .validate_success_status()
//!     .response_string(|response| println!("{:?}", response.result))
//!     .resume();
//! request.wait_until_finished().await;
//! # Ok(())
//! # }
//! ```

mod curl;
mod data;
mod delegate;
mod download;
mod errors;
mod interceptor;
mod monitor;
mod policy;
mod progress;
mod protected;
mod queue;
mod request;
#[cfg(feature = "reqwest")]
mod reqwest_transport;
mod serializer;
mod socket;
mod stream;
pub mod testing;
mod transport;
mod types;
mod upload;

pub use data::DataRequest;
pub use delegate::RequestDelegate;
pub use download::{
    destination_to, Destination, DownloadOptions, DownloadRequest, DownloadResponse,
};
pub use errors::{Error, Result, SharedError, TaskErrorKind};
pub use interceptor::{Adapter, Interceptor, RetryContext, RetryDecision};
pub use monitor::{CompositeEventMonitor, EventMonitor};
pub use policy::{ErrorSubstitutingInterceptor, RetryPolicy};
pub use progress::Progress;
pub use queue::SerialQueue;
pub use request::{Request, RequestConfig, RequestFactory, State, TaskEvents};
#[cfg(feature = "reqwest")]
pub use reqwest_transport::ReqwestTransport;
pub use serializer::{
    BytesSerializer, DataResponse, JsonSerializer, ResponseSerializer, StringSerializer,
    DEFAULT_EMPTY_RESPONSE_CODES,
};
pub use socket::{
    close_code, Message, MessageSerializer, PassthroughMessageSerializer, SocketEvent,
    SocketOptions, SocketRequest,
};
pub use stream::{
    StreamCancellationToken, StreamCompletion, StreamEvent, StreamPayload, StreamRequest,
};
pub use transport::{
    ResumeDataCompletion, SendCompletion, TaskState, Transport, TransportTask,
};
pub use types::{
    CachedResponseHandler, Credential, HttpRequest, HttpResponse, RedirectHandler,
    ResponseDisposition, TransportMetrics,
};
pub use upload::{ByteStream, UploadRequest, UploadStream, Uploadable};
