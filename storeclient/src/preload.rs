//! Background preloading of queued request payloads.
//!
//! A single worker keeps a bounded look-ahead of the queue loaded,
//! so the sender rarely waits on disk or on the transcoder.
//! Loads are idempotent, which resolves the race
//! between the worker and the sender's on-demand load:
//! whoever comes second finds the work already done.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use dicom_dul::pdu::PresentationContextNegotiated;
use tracing::{debug, trace};

use crate::request::{load, CStoreHandle, LoadPolicy};

pub(crate) struct PreloadJob {
    /// the negotiated contexts of the association being served
    pub contexts: Arc<Vec<PresentationContextNegotiated>>,
    /// how many queue entries to keep loaded
    pub count: usize,
}

/// The handle to the preloading worker.
///
/// Dropping it shuts the worker down.
pub(crate) struct Preloader {
    tx: Option<Sender<PreloadJob>>,
    worker: Option<JoinHandle<()>>,
}

impl Preloader {
    pub fn new(queue: Arc<Mutex<VecDeque<CStoreHandle>>>, policy: LoadPolicy) -> Self {
        let (tx, rx) = channel::<PreloadJob>();
        let worker = std::thread::Builder::new()
            .name("store-preloader".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if job.count == 0 {
                        continue;
                    }
                    // snapshot the queue head,
                    // then load without holding the queue lock
                    let head: Vec<CStoreHandle> = {
                        let queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                        queue.iter().take(job.count).cloned().collect()
                    };
                    for handle in head {
                        let mut request = handle.lock();
                        if request.loaded {
                            continue;
                        }
                        trace!("preloading {}", request.file.display());
                        if let Err(e) = load(&mut request, &job.contexts, &policy) {
                            // leave the verdict to the sender,
                            // which knows how to fail the request properly
                            debug!(
                                "preload of {} did not complete: {}",
                                request.file.display(),
                                e
                            );
                        }
                    }
                }
            })
            .expect("failed to spawn the preloader thread");

        Preloader {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Ask the worker to top up the loaded look-ahead.
    pub fn kick(&self, contexts: Arc<Vec<PresentationContextNegotiated>>, count: usize) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(PreloadJob { contexts, count });
        }
    }
}

impl Drop for Preloader {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
