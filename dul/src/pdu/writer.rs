//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(source(from(WriteChunkError, Box::new)))]
        source: Box<WriteChunkError>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Build the chunk contents in a scratch buffer,
/// then emit its length as a big endian 32-bit number
/// followed by the data.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Same as [`write_chunk_u32`], with a 16-bit length prefix.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_ae_title(writer: &mut dyn Write, ae_title: &str, field: &'static str) -> Result<()> {
    let codec = DefaultCharacterSetCodec;
    // always 16 bytes, space padded
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Serialize a single PDU into the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            // PDU type (1), reserved (1), then the length-prefixed body
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // protocol version (2), reserved (2),
                // called AE title (16), calling AE title (16), reserved (32)
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // the AE title fields are formally reserved in the AC,
                // echoed back from the request
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;

            Ok(())
        }
        Pdu::AssociationRJ { result, source } => {
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // reserved (1), result (1), source (1), reason (1)
                writer.push(0x00);

                writer.push(match result {
                    AssociationRJResult::Permanent => 0x01,
                    AssociationRJResult::Transient => 0x02,
                });

                let source_word = match source {
                    AssociationRJSource::ServiceUser(reason) => {
                        let reason = match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                0x02
                            }
                            AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                            AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                            AssociationRJServiceUserReason::Reserved(data) => *data,
                        };
                        [0x01, reason]
                    }
                    AssociationRJSource::ServiceProviderAcse(reason) => {
                        let reason = match reason {
                            AssociationRJServiceProviderAcseReason::NoReasonGiven => 0x01,
                            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => {
                                0x02
                            }
                        };
                        [0x02, reason]
                    }
                    AssociationRJSource::ServiceProviderPresentation(reason) => {
                        let reason = match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                0x01
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                0x02
                            }
                            AssociationRJServiceProviderPresentationReason::Reserved(data) => *data,
                        };
                        [0x03, reason]
                    }
                };
                writer.extend(source_word);

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        // presentation context ID (1),
                        // message control header (1), fragment bytes
                        writer.push(presentation_data_value.presentation_context_id);

                        let mut message_header = 0x00;
                        if let PDataValueType::Command = presentation_data_value.value_type {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);

                        writer.extend(&presentation_data_value.data);

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }

                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;

            Ok(())
        }
        Pdu::ReleaseRQ => {
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })?;

            Ok(())
        }
        Pdu::ReleaseRP => {
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })?;

            Ok(())
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // reserved (2), source (1), reason (1);
                // the reason is only significant
                // for service provider initiated aborts
                writer.push(0);
                writer.push(0);

                let source_word = match source {
                    AbortRQSource::ServiceUser => [0x00, 0x00],
                    AbortRQSource::Reserved => [0x01, 0x00],
                    AbortRQSource::ServiceProvider(reason) => match reason {
                        AbortRQServiceProviderReason::ReasonNotSpecified => [0x02, 0x00],
                        AbortRQServiceProviderReason::UnrecognizedPdu => [0x02, 0x01],
                        AbortRQServiceProviderReason::UnexpectedPdu => [0x02, 0x02],
                        AbortRQServiceProviderReason::Reserved => [0x02, 0x03],
                        AbortRQServiceProviderReason::UnrecognizedPduParameter => [0x02, 0x04],
                        AbortRQServiceProviderReason::UnexpectedPduParameter => [0x02, 0x05],
                        AbortRQServiceProviderReason::InvalidPduParameter => [0x02, 0x06],
                    },
                };
                writer.extend(source_word);

                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.extend(data);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Unknown" })?;

            Ok(())
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // item type 10H, reserved, length-prefixed name
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer
            .write_all(
                &codec
                    .encode(application_context_name)
                    .context(EncodeFieldSnafu {
                        field: "Application-context-name",
                    })?,
            )
            .context(WriteFieldSnafu {
                field: "Application-context-name",
            })
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // item type 20H, reserved, then
    // ID (1), reserved (3),
    // one abstract syntax sub-item (30H)
    // and one transfer syntax sub-item (40H) per candidate
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_chunk_u16(writer, |writer| {
            writer
                .write_all(
                    &codec
                        .encode(&presentation_context.abstract_syntax)
                        .context(EncodeFieldSnafu {
                            field: "Abstract-syntax-name",
                        })?,
                )
                .context(WriteFieldSnafu {
                    field: "Abstract-syntax-name",
                })
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u16(writer, |writer| {
                writer
                    .write_all(&codec.encode(transfer_syntax).context(EncodeFieldSnafu {
                        field: "Transfer-syntax-name",
                    })?)
                    .context(WriteFieldSnafu {
                        field: "Transfer-syntax-name",
                    })
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax Sub-Item",
            })?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // item type 21H, reserved, then
    // ID (1), reserved (1), result/reason (1), reserved (1),
    // one transfer syntax sub-item (40H)
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_chunk_u16(writer, |writer| {
            writer
                .write_all(
                    &codec
                        .encode(&presentation_context.transfer_syntax)
                        .context(EncodeFieldSnafu {
                            field: "Transfer-syntax-name",
                        })?,
                )
                .context(WriteFieldSnafu {
                    field: "Transfer-syntax-name",
                })
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax Sub-Item",
        })?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Result Item",
    })?;

    Ok(())
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // item type 50H, reserved, then one sub-item per user variable
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum Length Sub-Item",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(class_uid) => {
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&codec.encode(class_uid).context(EncodeFieldSnafu {
                                field: "Implementation-class-uid",
                            })?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-class-uid",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Class UID Sub-Item",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(version_name) => {
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&codec.encode(version_name).context(EncodeFieldSnafu {
                                field: "Implementation-version-name",
                            })?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-version-name",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Version Name Sub-Item",
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    writer
                        .write_u8(0x56)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        let uid_bytes =
                            codec.encode(sop_class_uid).context(EncodeFieldSnafu {
                                field: "SOP-class-uid",
                            })?;
                        writer
                            .write_u16::<BigEndian>(uid_bytes.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid_bytes).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(data.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "Service-class-application-information-length",
                            })?;
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Service-class-application-information",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP Class Extended Negotiation Sub-Item",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.primary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.primary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.secondary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.secondary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Sub-Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer.extend(data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Unknown Sub-Item",
                    })?;
                }
            }
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "User Information Item",
    })?;

    Ok(())
}
