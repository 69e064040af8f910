//! Types and methods for driving the DICOM upper layer protocol
//! from the requesting side.
//!
//! This crate implements the pieces needed to talk to a DICOM node
//! over TCP as a service class user:
//!
//! - The [`pdu`] module holds the data structures for
//!   _protocol data units_ and their byte-level codec.
//! - The [`transport`] module manages a single connection,
//!   with connect/send/receive deadlines and optional send throttling.
//! - The [`address`] module provides compound `AET@host:port` addresses
//!   for naming application entities in a network.
//! - The [`association`] module negotiates and drives an association,
//!   including fragmentation of outbound data streams.
//! - The [`dimse`] module assembles and emits DIMSE messages
//!   over presentation data values,
//!   and dispatches completed messages to service handlers.

pub mod address;
pub mod association;
pub mod dimse;
pub mod pdu;
pub mod transport;

/// The implementation class UID generically referring to this stack.
///
/// Generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.306074457780303097051490474226131013540";

/// The implementation version name advertised during negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-DUL 0.1";

// re-exports

pub use address::AeAddr;
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use pdu::reader::read_pdu;
pub use pdu::writer::write_pdu;
pub use pdu::Pdu;
