use crate::errors::Error;
use crate::request::Request;
use crate::socket::SocketEvent;
use crate::types::{HttpRequest, HttpResponse, TransportMetrics};

/// Advisory sink receiving every lifecycle and event-API call.
///
/// Purely observational: no return values, and implementations must not
/// block — every hook runs inline on the underlying context. All methods
/// default to no-ops so monitors implement only what they care about.
#[allow(unused_variables)]
pub trait EventMonitor: Send + Sync {
    fn request_did_create_initial_request(&self, request: &Request, representation: &HttpRequest) {
    }

    fn request_did_adapt_request(&self, request: &Request, adapted: &HttpRequest) {}

    fn request_did_fail_to_create_request(&self, request: &Request, error: &Error) {}

    fn request_did_fail_to_adapt_request(&self, request: &Request, error: &Error) {}

    fn request_did_create_task(&self, request: &Request) {}

    fn request_did_resume(&self, request: &Request) {}

    fn request_did_suspend(&self, request: &Request) {}

    fn request_did_cancel(&self, request: &Request) {}

    fn request_did_finish(&self, request: &Request) {}

    fn request_did_resume_task(&self, request: &Request) {}

    fn request_did_suspend_task(&self, request: &Request) {}

    fn request_did_cancel_task(&self, request: &Request) {}

    fn request_did_receive_response(&self, request: &Request, response: &HttpResponse) {}

    fn request_did_gather_metrics(&self, request: &Request, metrics: &TransportMetrics) {}

    fn request_did_complete_task(&self, request: &Request, error: Option<&Error>) {}

    fn request_did_validate(&self, request: &Request, result: &Result<(), Error>) {}

    fn request_is_retrying(&self, request: &Request) {}

    fn request_did_create_uploadable(&self, request: &Request) {}

    fn request_did_fail_to_create_uploadable(&self, request: &Request, error: &Error) {}

    fn request_did_finish_downloading(&self, request: &Request) {}

    fn stream_consumer_failed(&self, request: &Request, error: &Error) {}

    fn socket_event(&self, request: &Request, event: &SocketEvent) {}
}

/// Monitor that fans every event out to a list of monitors, in order.
pub struct CompositeEventMonitor(pub Vec<std::sync::Arc<dyn EventMonitor>>);

macro_rules! forward {
    ($name:ident $(, $arg:ident : $ty:ty)*) => {
        fn $name(&self, request: &Request $(, $arg: $ty)*) {
            for monitor in &self.0 {
                monitor.$name(request $(, $arg)*);
            }
        }
    };
}

impl EventMonitor for CompositeEventMonitor {
    forward!(request_did_create_initial_request, representation: &HttpRequest);
    forward!(request_did_adapt_request, adapted: &HttpRequest);
    forward!(request_did_fail_to_create_request, error: &Error);
    forward!(request_did_fail_to_adapt_request, error: &Error);
    forward!(request_did_create_task);
    forward!(request_did_resume);
    forward!(request_did_suspend);
    forward!(request_did_cancel);
    forward!(request_did_finish);
    forward!(request_did_resume_task);
    forward!(request_did_suspend_task);
    forward!(request_did_cancel_task);
    forward!(request_did_receive_response, response: &HttpResponse);
    forward!(request_did_gather_metrics, metrics: &TransportMetrics);
    forward!(request_did_complete_task, error: Option<&Error>);
    forward!(request_did_validate, result: &Result<(), Error>);
    forward!(request_is_retrying);
    forward!(request_did_create_uploadable);
    forward!(request_did_fail_to_create_uploadable, error: &Error);
    forward!(request_did_finish_downloading);
    forward!(stream_consumer_failed, error: &Error);
    forward!(socket_event, event: &SocketEvent);
}
