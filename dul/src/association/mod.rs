//! DICOM association module
//!
//! This module contains the abstractions for negotiating and driving
//! an association with another DICOM node over the upper layer protocol,
//! from the requesting side.

use std::borrow::Cow;

pub mod client;
pub mod pdata;

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use pdata::PDataWriter;

/// The lifecycle stage of an established association.
///
/// An association object only exists once negotiation succeeded,
/// so the pre-establishment states
/// (connecting, awaiting the A-ASSOCIATE response)
/// have no representation here.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionState {
    /// data transfer is possible in both directions
    Open,
    /// an A-RELEASE-RQ was sent, awaiting the peer's reply
    AwaitingRelease,
    /// the session is over; no PDU may be sent or received
    Closed,
}

/// Strip trailing null padding from a UID,
/// as data set values may carry it for even length.
pub(crate) fn trim_uid(uid: Cow<str>) -> Cow<str> {
    if uid.ends_with('\0') {
        Cow::Owned(
            uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string(),
        )
    } else {
        uid
    }
}
