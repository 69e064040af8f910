//! A queue-driven DICOM C-STORE service class user.
//!
//! [`CStoreClient`] accepts DICOM files through [`add_file`],
//! negotiates an association on demand
//! with presentation contexts derived from the queued files,
//! and sends each file as a C-STORE request,
//! transcoding when the accepted transfer syntax demands it.
//! Files whose transfer syntax was accepted as is
//! are streamed straight from disk,
//! without a full parse of the data set.
//!
//! Life cycle behavior follows the conventions of a long-lived agent:
//! the association lingers for a configurable while
//! after the queue drains, new requests reuse it,
//! a lost connection re-enqueues the in-flight request and reconnects,
//! and [`cancel`] stops the works either gracefully or at once.
//!
//! [`add_file`]: CStoreClient::add_file
//! [`cancel`]: CStoreClient::cancel
//!
//! ```no_run
//! use dicom_storeclient::{CStoreClient, CStoreClientOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CStoreClient::new(
//!     "MAIN-STORAGE@10.0.0.7:104".parse()?,
//!     CStoreClientOptions::default().calling_ae_title("MY-SCU"),
//! );
//! let request = client.add_file("image.dcm");
//! client.wait();
//! println!("{:?}", request.status());
//! # Ok(())
//! # }
//! ```

mod client;
mod observer;
mod preload;
mod request;

pub use client::{CStoreClient, CStoreClientOptions};
pub use observer::{NullObserver, StoreObserver};
pub use request::{CStoreHandle, RequestStatus};

pub use dicom_dul::AeAddr;
