//! The C-STORE client orchestrator.
//!
//! A dedicated sender thread owns the association for as long as
//! there is (or may soon be) work:
//! it negotiates with presentation contexts derived from the queue,
//! sends one request at a time,
//! lingers for late arrivals once the queue drains,
//! and reconnects with the queue intact when the transport drops.

use std::any::Any;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dicom_dictionary_std::uids;
use dicom_dul::association::client::{
    ClientAssociation, ClientAssociationOptions, Error as AssociationError,
};
use dicom_dul::dimse::{
    dispatch, receive_dimse, send_dimse, status, CommandSet, DatasetSource, DimseAssembler,
    Priority, Reaction, ReceivePolicy, ServiceHandlers, TransferMonitor, TransferProgress,
};
use dicom_dul::pdu::{PresentationContextResultReason, DEFAULT_MAX_PDU};
use dicom_dul::transport::ShutdownHandle;
use dicom_dul::AeAddr;
use dicom_encoding::adapters::EncodeOptions;
use tracing::{debug, error, info, warn};

use crate::observer::{NullObserver, StoreObserver};
use crate::preload::Preloader;
use crate::request::{self, inspect, CStoreHandle, LoadPolicy, Payload, RequestStatus};

/// How often the lingering sender re-checks the queue.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between reconnection attempts after a connect failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Configuration of a [`CStoreClient`].
#[derive(Debug, Clone)]
pub struct CStoreClientOptions {
    calling_ae_title: String,
    /// overrides the AE title of the target address
    called_ae_title: Option<String>,
    max_pdu_length: u32,
    preferred_transfer_syntax: Option<String>,
    preferred_transfer_syntax_params: EncodeOptions,
    serialized_presentation_contexts: bool,
    offer_explicit_syntax: bool,
    disable_file_streaming: bool,
    preload_count: usize,
    linger: Duration,
    use_file_buffer: bool,
    connect_timeout: Duration,
    socket_timeout: Duration,
    dimse_timeout: Duration,
    throttle_bytes_per_sec: u32,
}

impl Default for CStoreClientOptions {
    fn default() -> Self {
        CStoreClientOptions {
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: None,
            max_pdu_length: DEFAULT_MAX_PDU,
            preferred_transfer_syntax: None,
            preferred_transfer_syntax_params: EncodeOptions::default(),
            serialized_presentation_contexts: false,
            offer_explicit_syntax: true,
            disable_file_streaming: false,
            preload_count: 1,
            linger: Duration::ZERO,
            use_file_buffer: false,
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(30),
            dimse_timeout: Duration::from_secs(180),
            throttle_bytes_per_sec: 0,
        }
    }
}

impl CStoreClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The application entity title presented by this node.
    ///
    /// The default is `STORE-SCU`.
    pub fn calling_ae_title(mut self, value: impl Into<String>) -> Self {
        self.calling_ae_title = value.into();
        self
    }

    /// The application entity title of the target node,
    /// overriding the one in the target address.
    pub fn called_ae_title(mut self, value: impl Into<String>) -> Self {
        self.called_ae_title = Some(value.into());
        self
    }

    /// The maximum PDU length this node will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Propose this transfer syntax first for every SOP class,
    /// and transcode into it when the file's own syntax
    /// is not accepted.
    pub fn preferred_transfer_syntax(mut self, uid: impl Into<String>) -> Self {
        self.preferred_transfer_syntax = Some(uid.into());
        self
    }

    /// Encoder parameters applied when transcoding
    /// into the preferred transfer syntax.
    pub fn preferred_transfer_syntax_params(mut self, params: EncodeOptions) -> Self {
        self.preferred_transfer_syntax_params = params;
        self
    }

    /// Propose one presentation context per
    /// (SOP class, transfer syntax) pair,
    /// instead of one per SOP class with multiple syntaxes.
    /// Some peers negotiate more predictably this way.
    pub fn serialized_presentation_contexts(mut self, value: bool) -> Self {
        self.serialized_presentation_contexts = value;
        self
    }

    /// Offer explicit VR little endian in every proposal.
    /// Enabled by default.
    pub fn offer_explicit_syntax(mut self, value: bool) -> Self {
        self.offer_explicit_syntax = value;
        self
    }

    /// Always read and re-encode data sets in memory,
    /// even when the accepted transfer syntax
    /// matches the file's own.
    pub fn disable_file_streaming(mut self, value: bool) -> Self {
        self.disable_file_streaming = value;
        self
    }

    /// How many queued requests the background preloader
    /// keeps loaded ahead of the sender. Zero disables preloading.
    pub fn preload_count(mut self, value: usize) -> Self {
        self.preload_count = value;
        self
    }

    /// For how long an idle association is kept open
    /// after the queue drains, waiting for more requests.
    pub fn linger(mut self, value: Duration) -> Self {
        self.linger = value;
        self
    }

    /// Buffer inbound data sets in files rather than memory.
    pub fn use_file_buffer(mut self, value: bool) -> Self {
        self.use_file_buffer = value;
        self
    }

    /// Bound on the TCP handshake.
    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Bound on any single socket send or receive.
    pub fn socket_timeout(mut self, value: Duration) -> Self {
        self.socket_timeout = value;
        self
    }

    /// Bound on the idle gap while awaiting a response.
    pub fn dimse_timeout(mut self, value: Duration) -> Self {
        self.dimse_timeout = value;
        self
    }

    /// Limit the outbound byte rate. Zero means unthrottled.
    pub fn throttle_bytes_per_sec(mut self, value: u32) -> Self {
        self.throttle_bytes_per_sec = value;
        self
    }
}

struct Shared {
    address: AeAddr,
    options: CStoreClientOptions,
    observer: Arc<dyn StoreObserver>,
    queue: Arc<Mutex<VecDeque<CStoreHandle>>>,
    queue_signal: Condvar,
    /// SOP class → transfer syntaxes observed in queued files,
    /// in order of first appearance
    context_map: Mutex<Vec<(String, Vec<String>)>>,
    /// ask the sender to stop between exchanges
    cancel: AtomicBool,
    /// abandon the exchange in flight as well
    hard_cancel: AtomicBool,
    /// open path to force the current transport closed
    shutdown: Mutex<Option<ShutdownHandle>>,
    /// whether a sender thread is alive
    running: AtomicBool,
    preloader: Preloader,
}

/// A queue-driven C-STORE service class user.
///
/// See the [crate level documentation](crate) for an overview.
pub struct CStoreClient {
    shared: Arc<Shared>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl CStoreClient {
    /// Create a client that will store to the given application entity.
    pub fn new(address: AeAddr, options: CStoreClientOptions) -> Self {
        Self::with_observer(address, options, Arc::new(NullObserver))
    }

    /// Create a client with an observer for life cycle
    /// and per-request events.
    pub fn with_observer(
        address: AeAddr,
        options: CStoreClientOptions,
        observer: Arc<dyn StoreObserver>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let preloader = Preloader::new(queue.clone(), load_policy(&options));
        CStoreClient {
            shared: Arc::new(Shared {
                address,
                options,
                observer,
                queue,
                queue_signal: Condvar::new(),
                context_map: Mutex::new(Vec::new()),
                cancel: AtomicBool::new(false),
                hard_cancel: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                running: AtomicBool::new(false),
                preloader,
            }),
            sender: Mutex::new(None),
        }
    }

    /// Inspect a DICOM file and put it on the send queue.
    ///
    /// The returned handle tracks the request to its final status.
    /// A file whose meta group cannot be parsed yields a handle
    /// already marked as failed, and is never enqueued.
    pub fn add_file(&self, path: impl AsRef<Path>) -> CStoreHandle {
        self.add_file_impl(path.as_ref(), None)
    }

    /// Same as [`add_file`](CStoreClient::add_file),
    /// with an opaque state retrievable from the handle
    /// in observer callbacks.
    pub fn add_file_with_state(
        &self,
        path: impl AsRef<Path>,
        state: Arc<dyn Any + Send + Sync>,
    ) -> CStoreHandle {
        self.add_file_impl(path.as_ref(), Some(state))
    }

    fn add_file_impl(
        &self,
        path: &Path,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> CStoreHandle {
        let info = match inspect(path) {
            Ok(info) => info,
            Err(e) => {
                warn!("could not open {} as DICOM: {}", path.display(), e);
                return CStoreHandle::parse_failure(path.to_path_buf(), e.to_string(), user_data);
            }
        };

        {
            let mut map = self
                .shared
                .context_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match map.iter_mut().find(|(class, _)| *class == info.sop_class_uid) {
                Some((_, syntaxes)) => {
                    if !syntaxes.contains(&info.transfer_syntax) {
                        syntaxes.push(info.transfer_syntax.clone());
                    }
                }
                None => map.push((
                    info.sop_class_uid.clone(),
                    vec![info.transfer_syntax.clone()],
                )),
            }
        }

        let handle = CStoreHandle::new(path.to_path_buf(), info, user_data);
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.push_back(handle.clone());
            self.shared.queue_signal.notify_all();
        }
        self.ensure_sender();
        handle
    }

    /// Number of requests still waiting to be sent.
    pub fn queue_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether a sender thread is currently serving the queue.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop sending.
    ///
    /// With `wait` the exchange in flight is allowed to complete
    /// and the association is released before this call returns;
    /// requests still queued stay queued.
    /// Without `wait` the transport is torn down at once.
    ///
    /// Must not be called from observer callbacks.
    pub fn cancel(&self, wait: bool) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        {
            // wake a sender blocked on an empty queue
            let _queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.queue_signal.notify_all();
        }

        if !wait {
            self.shared.hard_cancel.store(true, Ordering::SeqCst);
            if let Some(handle) = &*self
                .shared
                .shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
            {
                handle.shutdown();
            }
            return;
        }

        if let Some(handle) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
    }

    /// Resume sending after a cancellation or a normal close,
    /// preserving the queue.
    pub fn reconnect(&self) {
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.hard_cancel.store(false, Ordering::SeqCst);
        self.ensure_sender();
    }

    /// Block until the sender goes idle
    /// (queue drained, linger expired, association released).
    pub fn wait(&self) {
        if let Some(handle) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
    }

    fn ensure_sender(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let mut sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // reap a sender that already finished
        if let Some(old) = sender.take() {
            let _ = old.join();
        }
        *sender = Some(
            std::thread::Builder::new()
                .name("store-sender".into())
                .spawn(move || run_sender(shared))
                .expect("failed to spawn the sender thread"),
        );
    }
}

impl Drop for CStoreClient {
    fn drop(&mut self) {
        self.cancel(true);
    }
}

fn load_policy(options: &CStoreClientOptions) -> LoadPolicy {
    LoadPolicy {
        disable_file_streaming: options.disable_file_streaming,
        preferred_transfer_syntax: options.preferred_transfer_syntax.clone(),
        preferred_params: options.preferred_transfer_syntax_params.clone(),
    }
}

/// Build the presentation context proposals for the next association
/// from the observed (SOP class, transfer syntax) pairs.
///
/// Per SOP class, the candidate list is: the preferred syntax,
/// then the syntaxes observed in queued files,
/// then explicit VR little endian when offered,
/// then implicit VR little endian as the universal fallback,
/// each at most once in that order.
fn build_proposals(shared: &Shared) -> Vec<(String, Vec<String>)> {
    let map = shared
        .context_map
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let options = &shared.options;

    let mut proposals = Vec::new();
    for (sop_class, observed) in map {
        let mut syntaxes: Vec<String> = Vec::new();
        if let Some(preferred) = &options.preferred_transfer_syntax {
            push_unique(&mut syntaxes, preferred);
        }
        for ts in &observed {
            push_unique(&mut syntaxes, ts);
        }
        if options.offer_explicit_syntax {
            push_unique(&mut syntaxes, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        }
        push_unique(&mut syntaxes, uids::IMPLICIT_VR_LITTLE_ENDIAN);

        if options.serialized_presentation_contexts {
            for ts in syntaxes {
                proposals.push((sop_class.clone(), vec![ts]));
            }
        } else {
            proposals.push((sop_class, syntaxes));
        }
    }
    proposals
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

enum WindowOutcome {
    /// released normally after the linger period ran out
    Released,
    /// released early because the send loop was canceled
    Canceled,
    /// released on purpose so a wider proposal set can be negotiated
    Reassociate,
    /// the association died underneath us
    TransportLost(String),
}

fn run_sender(shared: Arc<Shared>) {
    let observer = shared.observer.clone();
    loop {
        // wait for queued work or cancellation
        {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                if shared.cancel.load(Ordering::SeqCst) {
                    shared.running.store(false, Ordering::SeqCst);
                    return;
                }
                if !queue.is_empty() {
                    break;
                }
                let (guard, _) = shared
                    .queue_signal
                    .wait_timeout(queue, QUEUE_POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner);
                queue = guard;
            }
        }

        let called_ae_title = shared
            .options
            .called_ae_title
            .clone()
            .unwrap_or_else(|| shared.address.ae_title_or("ANY-SCP").to_string());

        let mut builder = ClientAssociationOptions::new()
            .calling_ae_title(shared.options.calling_ae_title.clone())
            .called_ae_title(called_ae_title)
            .max_pdu_length(shared.options.max_pdu_length)
            .connect_timeout(shared.options.connect_timeout)
            .socket_timeout(shared.options.socket_timeout)
            .dimse_timeout(shared.options.dimse_timeout)
            .throttle_bytes_per_sec(shared.options.throttle_bytes_per_sec);
        for (abstract_syntax, transfer_syntaxes) in build_proposals(&shared) {
            builder = builder.with_presentation_context(abstract_syntax, transfer_syntaxes);
        }

        let mut association = match builder.establish(&shared.address) {
            Ok(association) => association,
            Err(e) => {
                error!("could not establish association: {}", e);
                observer.on_network_error(&e.to_string());
                observer.on_closed();
                let terminal = matches!(
                    e,
                    AssociationError::Rejected { .. }
                        | AssociationError::NoAcceptedPresentationContexts { .. }
                ) || shared.cancel.load(Ordering::SeqCst);
                if terminal {
                    shared.running.store(false, Ordering::SeqCst);
                    return;
                }
                std::thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        debug!("association established with {}", shared.address);

        *shared
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = association.shutdown_handle().ok();

        let outcome = send_window(&shared, &mut association);

        *shared
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        match outcome {
            WindowOutcome::Released => {
                let drained = shared
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_empty();
                if drained {
                    observer.on_complete();
                    observer.on_closed();
                    shared.running.store(false, Ordering::SeqCst);
                    // a request may have been enqueued just as we went idle;
                    // reclaim the sender role if nobody else has
                    let raced = !shared.cancel.load(Ordering::SeqCst)
                        && !shared
                            .queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .is_empty()
                        && !shared.running.swap(true, Ordering::SeqCst);
                    if raced {
                        continue;
                    }
                    return;
                }
                // requests slipped in while releasing
                observer.on_closed();
            }
            WindowOutcome::Canceled => {
                observer.on_closed();
                shared.running.store(false, Ordering::SeqCst);
                return;
            }
            WindowOutcome::Reassociate => {
                observer.on_closed();
            }
            WindowOutcome::TransportLost(reason) => {
                error!("association lost: {}", reason);
                observer.on_network_error(&reason);
                observer.on_closed();
                if shared.cancel.load(Ordering::SeqCst) {
                    shared.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}

/// Serve the queue over one established association
/// until the linger period runs dry, the works are canceled,
/// or the association is lost.
fn send_window(shared: &Shared, association: &mut ClientAssociation) -> WindowOutcome {
    let observer = &shared.observer;
    let contexts = Arc::new(association.presentation_contexts().to_vec());
    let policy = load_policy(&shared.options);
    let mut assembler = DimseAssembler::new(ReceivePolicy {
        use_file_buffer: shared.options.use_file_buffer,
        spill_dir: None,
    });

    let mut message_id: u16 = 1;
    let linger = shared.options.linger + Duration::from_secs(1);
    let mut linger_deadline = Instant::now() + linger;

    while !shared.cancel.load(Ordering::SeqCst) && Instant::now() < linger_deadline {
        loop {
            if shared.cancel.load(Ordering::SeqCst) {
                break;
            }
            let current = match shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                Some(handle) => handle,
                None => break,
            };
            shared
                .preloader
                .kick(contexts.clone(), shared.options.preload_count);

            let load_result = {
                let mut request = current.lock();
                request::load(&mut request, &contexts, &policy)
            };
            if let Err(e) = load_result {
                // a SOP class this association never proposed can still
                // be served: renegotiate with the enlarged proposal set
                let sop_class = current.sop_class_uid();
                let proposed = contexts.iter().any(|pc| pc.abstract_syntax == sop_class);
                if !proposed {
                    debug!(
                        "SOP class {} not in this association, renegotiating",
                        sop_class
                    );
                    shared
                        .queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_front(current);
                    let _ = association.release();
                    return WindowOutcome::Reassociate;
                }

                let status = match &e {
                    request::Error::NoAcceptedContext { .. } => RequestStatus::SopClassNotSupported,
                    _ => RequestStatus::ProcessingFailure,
                };
                let reason = e.to_string();
                {
                    let mut request = current.lock();
                    request.status = status;
                    request.last_error = Some(reason.clone());
                }
                error!("{}: {}", current.file().display(), reason);
                observer.on_request_failed(&current, &reason);
                continue;
            }

            observer.on_request_begin(&current);

            let (sop_class, sop_instance, effective_ts, source) = {
                let mut request = current.lock();
                let source = match request.payload.take() {
                    Some(Payload::Encoded(data)) => DatasetSource::Mem(data),
                    Some(Payload::Stream) | None => DatasetSource::File(request.file.clone()),
                };
                (
                    request.sop_class_uid.clone(),
                    request.sop_instance_uid.clone(),
                    request.effective_transfer_syntax.clone(),
                    source,
                )
            };

            let context = contexts.iter().find(|pc| {
                pc.reason == PresentationContextResultReason::Acceptance
                    && pc.abstract_syntax == sop_class
                    && pc.transfer_syntax == effective_ts
            });
            let presentation_context_id = match context {
                Some(pc) => pc.id,
                None => {
                    let reason = format!(
                        "no accepted presentation context for ({}, {})",
                        sop_class, effective_ts
                    );
                    {
                        let mut request = current.lock();
                        request.status = RequestStatus::SopClassNotSupported;
                        request.last_error = Some(reason.clone());
                    }
                    error!("{}: {}", current.file().display(), reason);
                    observer.on_request_failed(&current, &reason);
                    continue;
                }
            };

            info!(
                "sending {} (sop={}, ts={}, pc={})",
                current.file().display(),
                sop_instance,
                effective_ts,
                presentation_context_id,
            );

            let command = CommandSet::c_store_rq(
                message_id,
                sop_class.clone(),
                sop_instance.clone(),
                Priority::Medium,
            );
            let send_result = {
                let mut bridge = ProgressBridge {
                    observer: observer.as_ref(),
                    handle: &current,
                };
                send_dimse(
                    association,
                    presentation_context_id,
                    &command,
                    source,
                    Some(&shared.hard_cancel),
                    &mut bridge,
                )
            };
            if let Err(e) = send_result {
                requeue_in_flight(shared, current);
                let _ = association.abort();
                return WindowOutcome::TransportLost(e.to_string());
            }

            let message = match receive_dimse(association, &mut assembler) {
                Ok(message) => message,
                Err(e) => {
                    requeue_in_flight(shared, current);
                    let _ = association.abort();
                    return WindowOutcome::TransportLost(e.to_string());
                }
            };

            // any message other than a storage response is unexpected here;
            // the dispatcher answers it with an abort
            let mut router = RspRouter::default();
            if let Err(e) = dispatch(&mut router, association, &message) {
                requeue_in_flight(shared, current);
                let _ = association.abort();
                return WindowOutcome::TransportLost(e.to_string());
            }

            let code = router.status.unwrap_or(status::PROCESSING_FAILURE);
            {
                let mut request = current.lock();
                request.status = RequestStatus::from_dimse(code);
                request::unload(&mut request);
            }
            if status::is_success(code) {
                debug!("stored {} successfully", sop_instance);
            } else if status::is_warning(code) {
                warn!(
                    "possible issue storing {} (status {:04X}H)",
                    sop_instance, code
                );
            } else {
                error!("failed to store {} (status {:04X}H)", sop_instance, code);
            }
            observer.on_response(&current, code);

            message_id = message_id.wrapping_add(1);
            linger_deadline = Instant::now() + linger;
        }

        if shared.cancel.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(QUEUE_POLL_INTERVAL);
    }

    if let Err(e) = association.release() {
        debug!("imperfect release: {}", e);
    }
    if shared.cancel.load(Ordering::SeqCst) {
        WindowOutcome::Canceled
    } else {
        WindowOutcome::Released
    }
}

/// Put the request that was in flight back at the front of the queue,
/// pristine, so the next association retries it from scratch.
fn requeue_in_flight(shared: &Shared, current: CStoreHandle) {
    {
        let mut request = current.lock();
        request::reset(&mut request);
        request.retried = true;
    }
    shared
        .queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_front(current);
}

/// Routes the single expected storage response out of the dispatcher.
#[derive(Default)]
struct RspRouter {
    status: Option<u16>,
}

impl ServiceHandlers for RspRouter {
    fn on_c_store_rsp(&mut self, command: &CommandSet) -> Reaction {
        self.status = Some(command.status.unwrap_or(status::PROCESSING_FAILURE));
        Reaction::Done
    }
}

/// Forwards outbound transfer progress to the store observer.
struct ProgressBridge<'a> {
    observer: &'a dyn StoreObserver,
    handle: &'a CStoreHandle,
}

impl TransferMonitor for ProgressBridge<'_> {
    fn on_send_progress(&mut self, progress: &TransferProgress) {
        self.observer.on_request_progress(
            self.handle,
            progress.bytes_transferred,
            progress.estimated_command_length + progress.estimated_data_set_length,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Condvar, Mutex};

    use super::{build_proposals, CStoreClientOptions, Shared};
    use crate::observer::NullObserver;
    use crate::preload::Preloader;

    const CT: &str = "1.2.840.10008.5.1.4.1.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.70";

    fn shared_with(
        options: CStoreClientOptions,
        contexts: Vec<(String, Vec<String>)>,
    ) -> Shared {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        Shared {
            address: "127.0.0.1:11112".parse().unwrap(),
            preloader: Preloader::new(queue.clone(), super::load_policy(&options)),
            options,
            observer: Arc::new(NullObserver),
            queue,
            queue_signal: Condvar::new(),
            context_map: Mutex::new(contexts),
            cancel: AtomicBool::new(false),
            hard_cancel: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    #[test]
    fn proposals_append_fallbacks_once() {
        let shared = shared_with(
            CStoreClientOptions::default(),
            vec![(CT.to_string(), vec![EXPLICIT_VR_LE.to_string()])],
        );

        let proposals = build_proposals(&shared);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].0, CT);
        assert_eq!(proposals[0].1, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE]);
    }

    #[test]
    fn preferred_syntax_leads_the_proposal_exactly_once() {
        let shared = shared_with(
            CStoreClientOptions::default().preferred_transfer_syntax(JPEG_LOSSLESS),
            vec![(
                CT.to_string(),
                vec![JPEG_LOSSLESS.to_string(), EXPLICIT_VR_LE.to_string()],
            )],
        );

        let proposals = build_proposals(&shared);
        assert_eq!(
            proposals[0].1,
            vec![JPEG_LOSSLESS, EXPLICIT_VR_LE, IMPLICIT_VR_LE]
        );
    }

    #[test]
    fn serialized_mode_yields_one_context_per_pair() {
        let shared = shared_with(
            CStoreClientOptions::default().serialized_presentation_contexts(true),
            vec![(CT.to_string(), vec![EXPLICIT_VR_LE.to_string()])],
        );

        let proposals = build_proposals(&shared);
        assert_eq!(proposals.len(), 2);
        assert!(proposals.iter().all(|(class, ts)| class == CT && ts.len() == 1));
    }

    #[test]
    fn explicit_offer_can_be_withheld() {
        let shared = shared_with(
            CStoreClientOptions::default().offer_explicit_syntax(false),
            vec![(CT.to_string(), vec![JPEG_LOSSLESS.to_string()])],
        );

        let proposals = build_proposals(&shared);
        assert_eq!(proposals[0].1, vec![JPEG_LOSSLESS, IMPLICIT_VR_LE]);
    }
}
