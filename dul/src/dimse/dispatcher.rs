//! Routing of completed DIMSE messages to service handlers.
//!
//! The dispatcher selects a handler by the command field
//! of a completed message.
//! Anything the handler set leaves unhandled
//! is answered with an A-ABORT,
//! as this engine then has no way to make sense of the exchange.

use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::warn;

use crate::association::client::ClientAssociation;
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, Pdu, PresentationContextResultReason,
};

use super::assembler::{DimseAssembler, DimseMessage, ReceivePolicy};
use super::emitter::{send_dimse, DatasetSource};
use super::{CommandField, CommandSet, NullMonitor};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("no handler for command field {:?}", command_field))]
    UnhandledCommand {
        command_field: CommandField,
        backtrace: Backtrace,
    },

    /// failed to send the DIMSE message
    SendMessage {
        #[snafu(backtrace)]
        source: Box<super::emitter::Error>,
    },

    /// failed to receive on the association
    Receive {
        #[snafu(backtrace)]
        source: Box<crate::association::client::Error>,
    },

    /// failed to reassemble the inbound message
    Assemble {
        #[snafu(backtrace)]
        source: super::assembler::Error,
    },

    #[snafu(display("unexpected response command field {:?}", command_field))]
    UnexpectedResponseCommand {
        command_field: CommandField,
        backtrace: Backtrace,
    },

    /// response command set carries no status
    MissingStatus { backtrace: Backtrace },

    /// no accepted presentation context for the verification service
    NoVerificationContext { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a service handler decided about a message.
pub enum Reaction {
    /// nobody is interested in this message
    Unhandled,
    /// the message was consumed; nothing needs to be sent back
    Done,
    /// reply with this command set on the same presentation context
    Reply(CommandSet),
}

/// Handlers for the DIMSE services this engine speaks.
///
/// Every method defaults to [`Reaction::Unhandled`],
/// which makes the dispatcher abort the association.
/// Handlers run on the thread driving the association
/// and must not block.
pub trait ServiceHandlers {
    /// A verification request arrived.
    fn on_c_echo_rq(&mut self, _command: &CommandSet) -> Reaction {
        Reaction::Unhandled
    }

    /// A verification response arrived.
    fn on_c_echo_rsp(&mut self, _command: &CommandSet) -> Reaction {
        Reaction::Unhandled
    }

    /// A storage request arrived, along with its data set
    /// (in memory, or as the path of the file it was spilled to).
    fn on_c_store_rq(&mut self, _message: &DimseMessage) -> Reaction {
        Reaction::Unhandled
    }

    /// A storage response arrived.
    fn on_c_store_rsp(&mut self, _command: &CommandSet) -> Reaction {
        Reaction::Unhandled
    }
}

/// Route one completed message to the matching handler.
///
/// A [`Reaction::Reply`] is sent back on the same presentation context.
/// An unhandled message aborts the association.
/// Any spill file of the message is removed once the handler returns,
/// so handlers that want to keep the data must move the file away.
pub fn dispatch<H>(
    handlers: &mut H,
    association: &mut ClientAssociation,
    message: &DimseMessage,
) -> Result<()>
where
    H: ServiceHandlers + ?Sized,
{
    let reaction = match message.command.command_field {
        CommandField::CEchoRq => handlers.on_c_echo_rq(&message.command),
        CommandField::CEchoRsp => handlers.on_c_echo_rsp(&message.command),
        CommandField::CStoreRq => handlers.on_c_store_rq(message),
        CommandField::CStoreRsp => handlers.on_c_store_rsp(&message.command),
        _ => Reaction::Unhandled,
    };

    let out = match reaction {
        Reaction::Done => Ok(()),
        Reaction::Reply(reply) => send_dimse(
            association,
            message.presentation_context_id,
            &reply,
            DatasetSource::None,
            None,
            &mut NullMonitor,
        )
        .map_err(Box::from)
        .context(SendMessageSnafu),
        Reaction::Unhandled => {
            warn!(
                "no handler for {:?}, aborting the association",
                message.command.command_field
            );
            let _ = association.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ));
            UnhandledCommandSnafu {
                command_field: message.command.command_field,
            }
            .fail()
        }
    };

    // the spill file belongs to the handler only for the
    // duration of the call
    if let super::DimseDataset::Spilled(path) = &message.data_set {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("could not remove spill file {}: {}", path.display(), e);
            }
        }
    }

    out
}

/// Receive PDUs until one whole DIMSE message has been reassembled.
pub fn receive_dimse(
    association: &mut ClientAssociation,
    assembler: &mut DimseAssembler,
) -> Result<DimseMessage> {
    let contexts = association.presentation_contexts().to_vec();
    loop {
        let pdu = association
            .receive()
            .map_err(Box::from)
            .context(ReceiveSnafu)?;
        if let Pdu::PData { data } = pdu {
            for pdv in data {
                if let Some(message) = assembler
                    .feed(pdv, &contexts, &mut NullMonitor)
                    .context(AssembleSnafu)?
                {
                    return Ok(message);
                }
            }
        }
        // association.receive only lets data PDUs through,
        // everything else already failed there
    }
}

/// Run one verification (C-ECHO) round trip
/// and return the response status.
pub fn send_c_echo(association: &mut ClientAssociation, message_id: u16) -> Result<u16> {
    let presentation_context_id = association
        .presentation_contexts()
        .iter()
        .find(|pc| {
            pc.reason == PresentationContextResultReason::Acceptance
                && pc.abstract_syntax == dicom_dictionary_std::uids::VERIFICATION
        })
        .map(|pc| pc.id)
        .context(NoVerificationContextSnafu)?;

    send_dimse(
        association,
        presentation_context_id,
        &CommandSet::c_echo_rq(message_id),
        DatasetSource::None,
        None,
        &mut NullMonitor,
    )
    .map_err(Box::from)
    .context(SendMessageSnafu)?;

    let mut assembler = DimseAssembler::new(ReceivePolicy::default());
    let message = receive_dimse(association, &mut assembler)?;
    snafu::ensure!(
        message.command.command_field == CommandField::CEchoRsp,
        UnexpectedResponseCommandSnafu {
            command_field: message.command.command_field,
        }
    );
    message.command.status.context(MissingStatusSnafu)
}
