//! Store requests and their payload loading.
//!
//! Loading resolves the transfer syntax a file will travel under,
//! given the accepted presentation contexts of an association:
//! same syntax means the data set can be streamed from disk as is,
//! anything else means reading the file
//! and re-encoding (or transcoding) it in memory.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dicom_core::Tag;
use dicom_dictionary_std::uids;
use dicom_dul::dimse::status;
use dicom_dul::pdu::{PresentationContextNegotiated, PresentationContextResultReason};
use dicom_encoding::adapters::EncodeOptions;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{open_file, OpenFileOptions};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not read DICOM file {}", path))]
    ReadFile {
        path: String,
        #[snafu(source(from(dicom_object::ReadError, Box::from)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("unsupported transfer syntax {}", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    #[snafu(display("no accepted presentation context for SOP class {}", sop_class_uid))]
    NoAcceptedContext {
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("no way to re-encode from {} to {}", from, to))]
    NoTranscodePath {
        from: String,
        to: String,
        backtrace: Backtrace,
    },

    /// transcoding failed
    #[cfg(feature = "transcode")]
    Transcode {
        #[snafu(source(from(dicom_pixeldata::TranscodeError, Box::from)))]
        source: Box<dicom_pixeldata::TranscodeError>,
    },

    /// could not encode the data set
    WriteDataset {
        #[snafu(source(from(dicom_object::WriteError, Box::from)))]
        source: Box<dicom_object::WriteError>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where a store request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// not sent yet
    Pending,
    /// stored successfully
    Success,
    /// stored, but the peer reported this warning status
    Warning(u16),
    /// the peer refused or failed the store with this status
    Failed(u16),
    /// the request could not be prepared
    /// (unreadable file, codec failure)
    ProcessingFailure,
    /// the peer accepted no usable presentation context
    /// for the SOP class of the request
    SopClassNotSupported,
}

impl RequestStatus {
    /// Classify a C-STORE response status code.
    pub(crate) fn from_dimse(code: u16) -> Self {
        if status::is_success(code) {
            RequestStatus::Success
        } else if status::is_warning(code) {
            RequestStatus::Warning(code)
        } else {
            RequestStatus::Failed(code)
        }
    }

    /// Whether the request reached a terminal unsuccessful state.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RequestStatus::Failed(_)
                | RequestStatus::ProcessingFailure
                | RequestStatus::SopClassNotSupported
        )
    }
}

/// The loaded form of a request's data set.
#[derive(Debug)]
pub(crate) enum Payload {
    /// stream the data set straight from the file
    Stream,
    /// data set bytes re-encoded in the effective transfer syntax
    Encoded(Vec<u8>),
}

#[derive(Debug)]
pub(crate) struct CStoreRequest {
    pub(crate) file: PathBuf,
    pub(crate) sop_class_uid: String,
    pub(crate) sop_instance_uid: String,
    pub(crate) original_transfer_syntax: String,
    pub(crate) effective_transfer_syntax: String,
    pub(crate) loaded: bool,
    pub(crate) payload: Option<Payload>,
    pub(crate) status: RequestStatus,
    pub(crate) last_error: Option<String>,
    /// whether this request already went through a reconnect cycle
    pub(crate) retried: bool,
    pub(crate) user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for CStoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let request = self.lock();
        f.debug_struct("CStoreHandle")
            .field("file", &request.file)
            .field("status", &request.status)
            .finish()
    }
}

/// A shared handle to one queued store request.
///
/// The handle stays valid for the life of the client and beyond;
/// its accessors return snapshots of the request state.
#[derive(Clone)]
pub struct CStoreHandle {
    inner: Arc<Mutex<CStoreRequest>>,
}

impl CStoreHandle {
    pub(crate) fn new(
        file: PathBuf,
        info: FileInfo,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        CStoreHandle {
            inner: Arc::new(Mutex::new(CStoreRequest {
                file,
                sop_class_uid: info.sop_class_uid,
                sop_instance_uid: info.sop_instance_uid,
                original_transfer_syntax: info.transfer_syntax.clone(),
                effective_transfer_syntax: info.transfer_syntax,
                loaded: false,
                payload: None,
                status: RequestStatus::Pending,
                last_error: None,
                retried: false,
                user_data,
            })),
        }
    }

    /// A handle for a file that could not even be inspected;
    /// such requests are never enqueued.
    pub(crate) fn parse_failure(
        file: PathBuf,
        error: String,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        CStoreHandle {
            inner: Arc::new(Mutex::new(CStoreRequest {
                file,
                sop_class_uid: String::new(),
                sop_instance_uid: String::new(),
                original_transfer_syntax: String::new(),
                effective_transfer_syntax: String::new(),
                loaded: false,
                payload: None,
                status: RequestStatus::ProcessingFailure,
                last_error: Some(error),
                retried: false,
                user_data,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CStoreRequest> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The path of the file backing this request.
    pub fn file(&self) -> PathBuf {
        self.lock().file.clone()
    }

    /// The current status of the request.
    pub fn status(&self) -> RequestStatus {
        self.lock().status
    }

    /// The SOP class UID found in the file meta group.
    pub fn sop_class_uid(&self) -> String {
        self.lock().sop_class_uid.clone()
    }

    /// The SOP instance UID found in the file meta group.
    pub fn sop_instance_uid(&self) -> String {
        self.lock().sop_instance_uid.clone()
    }

    /// The transfer syntax the request travels under.
    /// Until negotiation decides otherwise,
    /// this is the transfer syntax of the file.
    pub fn transfer_syntax(&self) -> String {
        self.lock().effective_transfer_syntax.clone()
    }

    /// The last error recorded against this request, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Whether the payload of this request is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    /// The opaque state attached by the caller on submission.
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.lock().user_data.clone()
    }
}

/// What file inspection yields: the identifiers needed
/// to negotiate and address the store.
#[derive(Debug, Clone)]
pub(crate) struct FileInfo {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
}

/// Parse only the file meta group of a DICOM file.
pub(crate) fn inspect(path: &Path) -> Result<FileInfo> {
    let obj = OpenFileOptions::new()
        .read_until(Tag(0x0001, 0x0000))
        .open_file(path)
        .context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
    let meta = obj.meta();

    let ts_uid = meta.transfer_syntax.trim_end_matches('\0');
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .with_context(|| UnsupportedTransferSyntaxSnafu {
            uid: ts_uid.to_string(),
        })?;

    Ok(FileInfo {
        sop_class_uid: trimmed(&meta.media_storage_sop_class_uid),
        sop_instance_uid: trimmed(&meta.media_storage_sop_instance_uid),
        transfer_syntax: ts.uid().to_string(),
    })
}

fn trimmed(uid: &str) -> String {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// Knobs consulted while loading a request.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoadPolicy {
    pub disable_file_streaming: bool,
    pub preferred_transfer_syntax: Option<String>,
    pub preferred_params: EncodeOptions,
}

/// Resolve the effective transfer syntax for the request
/// and materialize its payload.
///
/// Loading is idempotent; a request already loaded is left untouched,
/// so the background preloader and the sender may race freely.
pub(crate) fn load(
    request: &mut CStoreRequest,
    contexts: &[PresentationContextNegotiated],
    policy: &LoadPolicy,
) -> Result<()> {
    if request.loaded {
        return Ok(());
    }

    let accepted: Vec<&PresentationContextNegotiated> = contexts
        .iter()
        .filter(|pc| {
            pc.reason == PresentationContextResultReason::Acceptance
                && pc.abstract_syntax == request.sop_class_uid
        })
        .collect();
    ensure!(
        !accepted.is_empty(),
        NoAcceptedContextSnafu {
            sop_class_uid: request.sop_class_uid.clone(),
        }
    );

    // an exact transfer syntax match lets the file bytes
    // go out without a full parse
    if accepted
        .iter()
        .any(|pc| pc.transfer_syntax == request.original_transfer_syntax)
    {
        if policy.disable_file_streaming {
            let file_ts = TransferSyntaxRegistry
                .get(&request.original_transfer_syntax)
                .with_context(|| UnsupportedTransferSyntaxSnafu {
                    uid: request.original_transfer_syntax.clone(),
                })?;
            let obj = open_file(&request.file).context(ReadFileSnafu {
                path: request.file.display().to_string(),
            })?;
            let mut data = Vec::with_capacity(2048);
            obj.write_dataset_with_ts(&mut data, file_ts)
                .context(WriteDatasetSnafu)?;
            request.payload = Some(Payload::Encoded(data));
        } else {
            request.payload = Some(Payload::Stream);
        }
        request.effective_transfer_syntax = request.original_transfer_syntax.clone();
        request.loaded = true;
        return Ok(());
    }

    // the data set must be re-encoded for an accepted syntax
    let file_ts = TransferSyntaxRegistry
        .get(&request.original_transfer_syntax)
        .with_context(|| UnsupportedTransferSyntaxSnafu {
            uid: request.original_transfer_syntax.clone(),
        })?;
    let target_uid = pick_target_syntax(&accepted, policy);
    let target_ts = TransferSyntaxRegistry
        .get(&target_uid)
        .with_context(|| UnsupportedTransferSyntaxSnafu {
            uid: target_uid.clone(),
        })?;

    let codec_free_pair = file_ts.is_codec_free() && target_ts.is_codec_free();

    #[cfg(not(feature = "transcode"))]
    ensure!(
        codec_free_pair,
        NoTranscodePathSnafu {
            from: file_ts.uid().to_string(),
            to: target_ts.uid().to_string(),
        }
    );
    #[cfg(feature = "transcode")]
    ensure!(
        codec_free_pair || file_ts.can_decode_all(),
        NoTranscodePathSnafu {
            from: file_ts.uid().to_string(),
            to: target_ts.uid().to_string(),
        }
    );

    #[cfg(feature = "transcode")]
    let obj = {
        use dicom_pixeldata::Transcode;

        let mut obj = open_file(&request.file).context(ReadFileSnafu {
            path: request.file.display().to_string(),
        })?;
        // the encoder parameters only apply when the target
        // is the syntax they were configured for
        let options = if policy.preferred_transfer_syntax.as_deref() == Some(target_ts.uid()) {
            policy.preferred_params.clone()
        } else {
            EncodeOptions::default()
        };
        obj.transcode_with_options(target_ts, options)
            .context(TranscodeSnafu)?;
        obj
    };
    #[cfg(not(feature = "transcode"))]
    let obj = open_file(&request.file).context(ReadFileSnafu {
        path: request.file.display().to_string(),
    })?;

    let mut data = Vec::with_capacity(2048);
    obj.write_dataset_with_ts(&mut data, target_ts)
        .context(WriteDatasetSnafu)?;
    request.payload = Some(Payload::Encoded(data));
    request.effective_transfer_syntax = target_ts.uid().to_string();
    request.loaded = true;
    Ok(())
}

/// Choose the transfer syntax to re-encode into,
/// from the accepted contexts of the request's SOP class.
fn pick_target_syntax(
    accepted: &[&PresentationContextNegotiated],
    policy: &LoadPolicy,
) -> String {
    if let Some(preferred) = &policy.preferred_transfer_syntax {
        if accepted.iter().any(|pc| pc.transfer_syntax == *preferred) {
            return preferred.clone();
        }
    }
    for fallback in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
        if accepted.iter().any(|pc| pc.transfer_syntax == fallback) {
            return fallback.to_string();
        }
    }
    accepted
        .iter()
        .find(|pc| {
            TransferSyntaxRegistry
                .get(&pc.transfer_syntax)
                .map(|ts| ts.is_codec_free())
                .unwrap_or(false)
        })
        .unwrap_or(&accepted[0])
        .transfer_syntax
        .clone()
}

/// Release the payload; the effective transfer syntax
/// reverts to that of the file.
pub(crate) fn unload(request: &mut CStoreRequest) {
    request.loaded = false;
    request.payload = None;
    request.effective_transfer_syntax = request.original_transfer_syntax.clone();
}

/// Return the request to its pristine pending state,
/// ready to be re-enqueued.
pub(crate) fn reset(request: &mut CStoreRequest) {
    unload(request);
    request.status = RequestStatus::Pending;
    request.last_error = None;
}
