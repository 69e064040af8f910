//! Protocol data unit structures of the DICOM upper layer,
//! plus the reader and writer for their byte-level representation.

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes:
/// PDU type (1), reserved (1), PDU length (4).
pub const PDU_HEADER_SIZE: u32 = 6;

/// An upper layer protocol data unit.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Pdu {
    /// A PDU of an unrecognized type, kept as raw bytes
    Unknown {
        pdu_type: u8,
        data: Vec<u8>,
    },
    /// A-ASSOCIATE-RQ
    AssociationRQ {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-AC
    AssociationAC {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextResult>,
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-RJ
    AssociationRJ {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// P-DATA-TF
    PData {
        data: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ
    ReleaseRQ,
    /// A-RELEASE-RP
    ReleaseRP,
    /// A-ABORT
    AbortRQ {
        source: AbortRQSource,
    },
}

impl Pdu {
    /// A short name for the PDU, suitable for log messages.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::Unknown { .. } => "Unknown",
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
        }
    }
}

/// A presentation context proposed by the association requestor:
/// one abstract syntax and the transfer syntaxes offered for it.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome for a single presentation context
/// as announced by the association acceptor.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    /// the identifier of the proposed presentation context
    pub id: u8,
    /// whether it was accepted and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax chosen by the acceptor
    /// (only significant on acceptance)
    pub transfer_syntax: String,
}

/// The reason field of a presentation context result.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// A fully negotiated presentation context:
/// the acceptor's result joined back with the proposed abstract syntax.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// whether it was accepted and if not, why
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// the transfer syntax chosen by the acceptor
    pub transfer_syntax: String,
}

/// The result field of an A-ASSOCIATE-RJ PDU.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }
}

/// A rejection reason attributed to the service user.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

/// A rejection reason attributed to the ACSE related function
/// of the service provider.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// A rejection reason attributed to the presentation related function
/// of the service provider.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value within a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment
/// belongs to a command set or a data set.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source field of an A-ABORT PDU.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }
}

/// An abort reason attributed to the service provider.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// A variable item within an A-ASSOCIATE-RQ or A-ASSOCIATE-AC PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    UserIdentityItem(UserIdentity),
}

/// A user identity negotiation item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// The kind of identity asserted in a user identity item.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum UserIdentityType {
    Username = 1,
    UsernamePassword = 2,
    KerberosServiceTicket = 3,
    SamlAssertion = 4,
}

impl UserIdentityType {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            _ => None,
        }
    }
}
