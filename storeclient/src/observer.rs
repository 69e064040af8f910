use crate::request::CStoreHandle;

/// Observation points over the life of a store client.
///
/// All methods default to doing nothing.
/// They are invoked from the sender thread,
/// so implementations must return promptly and never call back
/// into the client in a blocking way
/// (in particular not [`cancel(wait = true)`](crate::CStoreClient::cancel)).
pub trait StoreObserver: Send + Sync {
    /// A request was taken off the queue and is about to be sent.
    fn on_request_begin(&self, _request: &CStoreHandle) {}

    /// Outbound progress of the request in flight.
    fn on_request_progress(&self, _request: &CStoreHandle, _bytes_sent: u64, _bytes_total: u64) {}

    /// The request failed before a response could be obtained
    /// (no usable presentation context, codec failure, unreadable file).
    /// The association stays up and the queue moves on.
    fn on_request_failed(&self, _request: &CStoreHandle, _reason: &str) {}

    /// A C-STORE response was received for the request;
    /// its status is also recorded on the handle.
    fn on_response(&self, _request: &CStoreHandle, _status: u16) {}

    /// The queue drained, the linger period expired
    /// and the association was released normally.
    fn on_complete(&self) {}

    /// The association is down, for whatever reason.
    /// Fires after `on_complete` on a normal close.
    fn on_closed(&self) {}

    /// The association was torn down by a transport or protocol error.
    /// The in-flight request, if any, went back to the front of the queue.
    fn on_network_error(&self, _error: &str) {}
}

/// An observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StoreObserver for NullObserver {}
