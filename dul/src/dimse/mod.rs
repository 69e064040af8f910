//! DICOM message service element (DIMSE) support:
//! typed command sets, the assembler and emitter
//! that move them across presentation data values,
//! and the dispatcher that routes completed messages
//! to service handlers.

pub mod assembler;
pub mod dispatcher;
pub mod emitter;

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

pub use assembler::{DimseAssembler, DimseDataset, DimseMessage, ReceivePolicy};
pub use dispatcher::{dispatch, receive_dimse, send_c_echo, Reaction, ServiceHandlers};
pub use emitter::{send_dimse, DatasetSource};

/// The data set type value indicating
/// that no data set follows the command set.
pub const NO_DATA_SET: u16 = 0x0101;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to decode command set
    ReadCommand {
        #[snafu(source(from(dicom_object::ReadError, Box::from)))]
        source: Box<dicom_object::ReadError>,
    },

    /// failed to encode command set
    WriteCommand {
        #[snafu(source(from(dicom_object::WriteError, Box::from)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("command set is missing a required field {}", tag))]
    MissingField { tag: Tag, backtrace: Backtrace },

    #[snafu(display("could not interpret command field {}", tag))]
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown command field value {:#06x}", value))]
    UnknownCommandField { value: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All command field values of the DIMSE-C and DIMSE-N services.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_u16(value: u16) -> Option<Self> {
        use CommandField::*;
        Some(match value {
            0x0001 => CStoreRq,
            0x8001 => CStoreRsp,
            0x0010 => CGetRq,
            0x8010 => CGetRsp,
            0x0020 => CFindRq,
            0x8020 => CFindRsp,
            0x0021 => CMoveRq,
            0x8021 => CMoveRsp,
            0x0030 => CEchoRq,
            0x8030 => CEchoRsp,
            0x0100 => NEventReportRq,
            0x8100 => NEventReportRsp,
            0x0110 => NGetRq,
            0x8110 => NGetRsp,
            0x0120 => NSetRq,
            0x8120 => NSetRsp,
            0x0130 => NActionRq,
            0x8130 => NActionRsp,
            0x0140 => NCreateRq,
            0x8140 => NCreateRsp,
            0x0150 => NDeleteRq,
            0x8150 => NDeleteRsp,
            0x0FFF => CCancelRq,
            _ => return None,
        })
    }

    /// Whether this command field identifies a response message.
    pub fn is_response(self) -> bool {
        (self as u16) & 0x8000 != 0
    }
}

/// Priority of a DIMSE-C operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// Interpretation of DIMSE status codes, per PS3.7 annex C.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const CANCEL: u16 = 0xFE00;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;

    pub fn is_success(status: u16) -> bool {
        status == SUCCESS
    }

    pub fn is_warning(status: u16) -> bool {
        matches!(status, 0x0001 | 0x0107 | 0x0116) || (0xB000..=0xBFFF).contains(&status)
    }

    pub fn is_pending(status: u16) -> bool {
        matches!(status, PENDING | PENDING_WARNING)
    }

    pub fn is_cancel(status: u16) -> bool {
        status == CANCEL
    }

    pub fn is_failure(status: u16) -> bool {
        !is_success(status) && !is_warning(status) && !is_pending(status) && !is_cancel(status)
    }
}

/// A typed DIMSE command set.
///
/// Only the fields demanded by the command field are meaningful;
/// all others are left unset.
/// The wire form is a DICOM data set
/// in implicit VR little endian with a group length,
/// produced by [`write_to`](CommandSet::write_to)
/// and consumed by [`read_from`](CommandSet::read_from).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<Priority>,
    /// `0x0101` when no data set accompanies the command
    pub data_set_type: u16,
    pub status: Option<u16>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub event_type_id: Option<u16>,
    pub action_type_id: Option<u16>,
    pub attribute_identifier_list: Option<Vec<Tag>>,
    pub remaining_suboperations: Option<u16>,
    pub completed_suboperations: Option<u16>,
    pub warning_suboperations: Option<u16>,
    pub failed_suboperations: Option<u16>,
}

impl CommandSet {
    fn empty(command_field: CommandField) -> Self {
        CommandSet {
            command_field,
            message_id: None,
            message_id_responded_to: None,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_class_uid: None,
            requested_sop_instance_uid: None,
            priority: None,
            data_set_type: NO_DATA_SET,
            status: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            event_type_id: None,
            action_type_id: None,
            attribute_identifier_list: None,
            remaining_suboperations: None,
            completed_suboperations: None,
            warning_suboperations: None,
            failed_suboperations: None,
        }
    }

    /// Create a C-ECHO request command set.
    pub fn c_echo_rq(message_id: u16) -> Self {
        CommandSet {
            message_id: Some(message_id),
            affected_sop_class_uid: Some(dicom_dictionary_std::uids::VERIFICATION.to_string()),
            ..Self::empty(CommandField::CEchoRq)
        }
    }

    /// Create a C-ECHO response command set.
    pub fn c_echo_rsp(message_id_responded_to: u16, status: u16) -> Self {
        CommandSet {
            message_id_responded_to: Some(message_id_responded_to),
            affected_sop_class_uid: Some(dicom_dictionary_std::uids::VERIFICATION.to_string()),
            status: Some(status),
            ..Self::empty(CommandField::CEchoRsp)
        }
    }

    /// Create a C-STORE request command set.
    /// The accompanying data set travels separately.
    pub fn c_store_rq(
        message_id: u16,
        affected_sop_class_uid: impl Into<String>,
        affected_sop_instance_uid: impl Into<String>,
        priority: Priority,
    ) -> Self {
        CommandSet {
            message_id: Some(message_id),
            affected_sop_class_uid: Some(affected_sop_class_uid.into()),
            affected_sop_instance_uid: Some(affected_sop_instance_uid.into()),
            priority: Some(priority),
            data_set_type: 0x0000,
            ..Self::empty(CommandField::CStoreRq)
        }
    }

    /// Create a C-STORE response command set.
    pub fn c_store_rsp(
        message_id_responded_to: u16,
        affected_sop_class_uid: impl Into<String>,
        affected_sop_instance_uid: impl Into<String>,
        status: u16,
    ) -> Self {
        CommandSet {
            message_id_responded_to: Some(message_id_responded_to),
            affected_sop_class_uid: Some(affected_sop_class_uid.into()),
            affected_sop_instance_uid: Some(affected_sop_instance_uid.into()),
            status: Some(status),
            ..Self::empty(CommandField::CStoreRsp)
        }
    }

    /// Whether a data set accompanies this command.
    pub fn has_data_set(&self) -> bool {
        self.data_set_type != NO_DATA_SET
    }

    /// Build the in-memory DICOM object for this command set,
    /// with the command group length element included.
    pub fn to_object(&self) -> InMemDicomObject<StandardDataDictionary> {
        let mut elements: Vec<DataElement<InMemDicomObject<StandardDataDictionary>>> = vec![
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field as u16]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [self.data_set_type]),
            ),
        ];

        if let Some(v) = self.message_id {
            elements.push(DataElement::new(
                tags::MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.message_id_responded_to {
            elements.push(DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(uid) = &self.affected_sop_class_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uid),
            ));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid),
            ));
        }
        if let Some(uid) = &self.requested_sop_class_uid {
            elements.push(DataElement::new(
                tags::REQUESTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uid),
            ));
        }
        if let Some(uid) = &self.requested_sop_instance_uid {
            elements.push(DataElement::new(
                tags::REQUESTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid),
            ));
        }
        if let Some(priority) = self.priority {
            elements.push(DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [priority as u16]),
            ));
        }
        if let Some(v) = self.status {
            elements.push(DataElement::new(
                tags::STATUS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(ae) = &self.move_originator_ae_title {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, ae),
            ));
        }
        if let Some(v) = self.move_originator_message_id {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.event_type_id {
            elements.push(DataElement::new(
                tags::EVENT_TYPE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.action_type_id {
            elements.push(DataElement::new(
                tags::ACTION_TYPE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(list) = &self.attribute_identifier_list {
            elements.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                dicom_core::value::PrimitiveValue::Tags(dicom_core::value::C::from(list.clone())),
            ));
        }
        if let Some(v) = self.remaining_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.completed_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.warning_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.failed_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }

        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Interpret an in-memory DICOM object as a command set.
    pub fn from_object(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<Self> {
        let command_field_value = obj
            .get(tags::COMMAND_FIELD)
            .context(MissingFieldSnafu {
                tag: tags::COMMAND_FIELD,
            })?
            .to_int::<u16>()
            .context(ConvertFieldSnafu {
                tag: tags::COMMAND_FIELD,
            })?;
        let command_field = CommandField::from_u16(command_field_value).context(
            UnknownCommandFieldSnafu {
                value: command_field_value,
            },
        )?;

        let priority = match get_u16(obj, tags::PRIORITY)? {
            Some(0x0002) => Some(Priority::Low),
            Some(0x0001) => Some(Priority::High),
            Some(_) => Some(Priority::Medium),
            None => None,
        };

        let attribute_identifier_list = obj
            .get(tags::ATTRIBUTE_IDENTIFIER_LIST)
            .and_then(|el| el.value().primitive())
            .and_then(|value| value.tags().ok())
            .map(|list| list.to_vec());

        Ok(CommandSet {
            command_field,
            message_id: get_u16(obj, tags::MESSAGE_ID)?,
            message_id_responded_to: get_u16(obj, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            affected_sop_class_uid: get_uid(obj, tags::AFFECTED_SOP_CLASS_UID)?,
            affected_sop_instance_uid: get_uid(obj, tags::AFFECTED_SOP_INSTANCE_UID)?,
            requested_sop_class_uid: get_uid(obj, tags::REQUESTED_SOP_CLASS_UID)?,
            requested_sop_instance_uid: get_uid(obj, tags::REQUESTED_SOP_INSTANCE_UID)?,
            priority,
            data_set_type: get_u16(obj, tags::COMMAND_DATA_SET_TYPE)?.unwrap_or(NO_DATA_SET),
            status: get_u16(obj, tags::STATUS)?,
            move_originator_ae_title: get_uid(obj, tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)?,
            move_originator_message_id: get_u16(obj, tags::MOVE_ORIGINATOR_MESSAGE_ID)?,
            event_type_id: get_u16(obj, tags::EVENT_TYPE_ID)?,
            action_type_id: get_u16(obj, tags::ACTION_TYPE_ID)?,
            attribute_identifier_list,
            remaining_suboperations: get_u16(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?,
            completed_suboperations: get_u16(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?,
            warning_suboperations: get_u16(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS)?,
            failed_suboperations: get_u16(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS)?,
        })
    }

    /// Decode a command set from its wire form.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            bytes,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(ReadCommandSnafu)?;
        Self::from_object(&obj)
    }

    /// Encode this command set into its wire form.
    pub fn write_to(&self, to: &mut Vec<u8>) -> Result<()> {
        self.to_object()
            .write_dataset_with_ts(to, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(WriteCommandSnafu)
    }
}

fn get_u16(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Result<Option<u16>> {
    match obj.get(tag) {
        Some(el) => Ok(Some(
            el.to_int::<u16>().context(ConvertFieldSnafu { tag })?,
        )),
        None => Ok(None),
    }
}

fn get_uid(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Result<Option<String>> {
    match obj.get(tag) {
        Some(el) => {
            let value = el.to_str().context(ConvertFieldSnafu { tag })?;
            Ok(Some(
                value
                    .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                    .to_string(),
            ))
        }
        None => Ok(None),
    }
}

/// Progress counters of one DIMSE transfer, inbound or outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// the presentation context carrying the message
    pub presentation_context_id: u8,
    /// command and data set bytes moved so far
    pub bytes_transferred: u64,
    /// length of the encoded command set, once known
    pub estimated_command_length: u64,
    /// length of the encoded data set, once known (zero when absent)
    pub estimated_data_set_length: u64,
}

/// Observation points over DIMSE transfers.
///
/// All methods default to doing nothing.
/// Implementations must not block:
/// they run on the thread driving the association.
pub trait TransferMonitor {
    fn on_send_begin(&mut self, _progress: &TransferProgress) {}
    fn on_send_progress(&mut self, _progress: &TransferProgress) {}
    fn on_send_complete(&mut self, _progress: &TransferProgress) {}
    fn on_receive_begin(&mut self, _progress: &TransferProgress) {}
    fn on_receive_progress(&mut self, _progress: &TransferProgress) {}
    fn on_receive_complete(&mut self, _progress: &TransferProgress) {}
}

/// A transfer monitor that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl TransferMonitor for NullMonitor {}
