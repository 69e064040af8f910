//! Association requester module
//!
//! The [`ClientAssociationOptions`] builder gathers everything needed
//! to propose an association to a service class provider;
//! a successful negotiation yields a [`ClientAssociation`]
//! through which PDUs can be exchanged until release or abort.

use std::borrow::Cow;
use std::net::ToSocketAddrs;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult, AssociationRJSource, Pdu,
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResultReason,
    UserIdentity, UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::transport::{ShutdownHandle, Transport, TransportOptions};

use super::{trim_uid, PDataWriter, SessionState};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing at least one presentation context to begin negotiation
    MissingPresentationContexts { backtrace: Backtrace },

    /// too many presentation contexts proposed (at most 128)
    TooManyPresentationContexts { backtrace: Backtrace },

    #[snafu(display("application entity title `{}` is invalid", ae_title))]
    InvalidAeTitle {
        ae_title: String,
        backtrace: Backtrace,
    },

    /// could not connect to the service class provider
    Connect {
        #[snafu(backtrace)]
        source: crate::transport::Error,
    },

    /// failed to send association request
    SendRequest {
        #[snafu(backtrace)]
        source: crate::transport::Error,
    },

    /// failed to receive association response
    ReceiveResponse {
        #[snafu(backtrace)]
        source: crate::transport::Error,
    },

    /// failed to send PDU message
    Send {
        #[snafu(backtrace)]
        source: crate::transport::Error,
    },

    /// failed to receive PDU message
    Receive {
        #[snafu(backtrace)]
        source: crate::transport::Error,
    },

    #[snafu(display("unexpected response from SCP `{:?}`", pdu))]
    #[non_exhaustive]
    UnexpectedResponse {
        /// the PDU obtained from the server
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown response from SCP `{:?}`", pdu))]
    #[non_exhaustive]
    UnknownResponse {
        /// the PDU obtained from the server, of variant Unknown
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// the association was rejected by the service class provider
    Rejected {
        association_result: AssociationRJResult,
        association_source: AssociationRJSource,
        backtrace: Backtrace,
    },

    /// the association was aborted by the peer
    Aborted { backtrace: Backtrace },

    /// no presentation contexts accepted by the service class provider
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display(
        "presentation context #{} was accepted under transfer syntax {}, which was never proposed",
        id,
        transfer_syntax
    ))]
    AcceptedTransferSyntaxNotProposed {
        id: u8,
        transfer_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("the acceptor answered for presentation context #{}, which was never proposed", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    /// the association session is already closed
    SessionClosed { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DICOM association builder for a service class user (SCU).
///
/// This is the standard way of establishing an association
/// with a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context(
///        "1.2.840.10008.1.1",
///        vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
///    )
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the proposed presentation contexts:
    /// abstract syntax with its candidate transfer syntaxes
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length that this node can receive
    max_pdu_length: u32,
    /// whether to refuse inbound PDUs larger than the negotiated maximum
    strict: bool,
    /// user identity username
    username: Option<Cow<'static, str>>,
    /// user identity password
    password: Option<Cow<'static, str>>,
    /// user identity Kerberos service ticket
    kerberos_service_ticket: Option<Cow<'static, str>>,
    /// user identity SAML assertion
    saml_assertion: Option<Cow<'static, str>>,
    /// SOP class extended negotiation items
    sop_class_extended: Vec<(String, Vec<u8>)>,
    /// connection deadlines and pacing
    transport_options: TransportOptions,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: false,
            username: None,
            password: None,
            kerberos_service_ticket: None,
            saml_assertion: None,
            sop_class_extended: Vec::new(),
            transport_options: TransportOptions::default(),
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose one presentation context:
    /// an abstract syntax with the transfer syntaxes
    /// admitted for it, in order of preference.
    pub fn with_presentation_context<T, U>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<U>,
    ) -> Self
    where
        T: Into<Cow<'static, str>>,
        U: Into<Cow<'static, str>>,
    {
        let abstract_syntax = trim_uid(abstract_syntax_uid.into()).into_owned();
        let transfer_syntaxes = transfer_syntax_uids
            .into_iter()
            .map(|ts| trim_uid(ts.into()).into_owned().into())
            .collect();
        self.presentation_contexts
            .push((abstract_syntax.into(), transfer_syntaxes));
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Refuse inbound PDUs larger than the maximum PDU length,
    /// instead of tolerating them up to the cap of the standard.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Assert a user identity by username only.
    pub fn username<T>(mut self, username: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.username = Some(username.into());
        self.kerberos_service_ticket = None;
        self.saml_assertion = None;
        self
    }

    /// Assert a user identity by username and password.
    pub fn username_password<T, U>(mut self, username: T, password: U) -> Self
    where
        T: Into<Cow<'static, str>>,
        U: Into<Cow<'static, str>>,
    {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self.kerberos_service_ticket = None;
        self.saml_assertion = None;
        self
    }

    /// Assert a user identity by Kerberos service ticket.
    pub fn kerberos_service_ticket<T>(mut self, ticket: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.kerberos_service_ticket = Some(ticket.into());
        self.username = None;
        self.password = None;
        self.saml_assertion = None;
        self
    }

    /// Assert a user identity by SAML assertion.
    pub fn saml_assertion<T>(mut self, assertion: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.saml_assertion = Some(assertion.into());
        self.username = None;
        self.password = None;
        self.kerberos_service_ticket = None;
        self
    }

    /// Attach a SOP class extended negotiation item.
    pub fn with_sop_class_extended_negotiation<T>(mut self, sop_class_uid: T, data: Vec<u8>) -> Self
    where
        T: Into<String>,
    {
        self.sop_class_extended.push((sop_class_uid.into(), data));
        self
    }

    /// Override the bound on the TCP handshake.
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.connect_timeout = timeout;
        self
    }

    /// Override the bound on single socket operations.
    pub fn socket_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.socket_timeout = timeout;
        self
    }

    /// Override the bound on the idle gap between inbound messages.
    pub fn dimse_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.dimse_timeout = timeout;
        self
    }

    /// Limit the outbound byte rate. Zero means unthrottled.
    pub fn throttle_bytes_per_sec(mut self, rate: u32) -> Self {
        self.transport_options.throttle_bytes_per_sec = rate;
        self
    }

    /// Initiate the TCP connection and negotiate the association.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            protocol_version,
            max_pdu_length,
            strict,
            username,
            password,
            kerberos_service_ticket,
            saml_assertion,
            sop_class_extended,
            transport_options,
        } = self;

        // presentation contexts carry the intent of the association,
        // there is nothing to negotiate without them
        ensure!(
            !presentation_contexts.is_empty(),
            MissingPresentationContextsSnafu
        );
        // PCIDs are odd numbers in a single byte
        ensure!(
            presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu
        );

        check_ae_title(&calling_ae_title)?;
        check_ae_title(&called_ae_title)?;

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ];

        if let Some(identity) = user_identity(
            username.as_deref(),
            password.as_deref(),
            kerberos_service_ticket.as_deref(),
            saml_assertion.as_deref(),
        ) {
            user_variables.push(UserVariableItem::UserIdentityItem(identity));
        }

        for (sop_class_uid, data) in sop_class_extended {
            user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                sop_class_uid,
                data,
            ));
        }

        let msg = Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables,
        };

        let mut transport = Transport::connect(address, &transport_options).context(ConnectSnafu)?;
        transport.set_max_pdu_length(max_pdu_length);
        transport.set_strict(strict);

        transport.send_pdu(&msg).context(SendRequestSnafu)?;

        let msg = transport.recv_pdu().context(ReceiveResponseSnafu)?;

        match msg {
            Pdu::AssociationAC {
                protocol_version: protocol_version_scp,
                application_context_name: _,
                calling_ae_title: _,
                called_ae_title: _,
                presentation_contexts: presentation_contexts_scp,
                user_variables,
            } => {
                ensure!(
                    protocol_version == protocol_version_scp,
                    ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: protocol_version_scp,
                    }
                );

                // join the acceptor's verdicts back with our proposals;
                // an accepted transfer syntax must be one that we offered
                // for the same presentation context
                let mut negotiated = Vec::with_capacity(presentation_contexts_scp.len());
                for result in presentation_contexts_scp {
                    let proposed = presentation_contexts
                        .iter()
                        .find(|pc| pc.id == result.id);
                    let proposed = match proposed {
                        Some(proposed) => proposed,
                        None => {
                            let _ = transport.send_pdu(&Pdu::AbortRQ {
                                source: AbortRQSource::ServiceUser,
                            });
                            return UnknownPresentationContextSnafu { id: result.id }.fail();
                        }
                    };
                    if result.reason == PresentationContextResultReason::Acceptance
                        && !proposed
                            .transfer_syntaxes
                            .iter()
                            .any(|ts| *ts == result.transfer_syntax)
                    {
                        let _ = transport.send_pdu(&Pdu::AbortRQ {
                            source: AbortRQSource::ServiceUser,
                        });
                        return AcceptedTransferSyntaxNotProposedSnafu {
                            id: result.id,
                            transfer_syntax: result.transfer_syntax,
                        }
                        .fail();
                    }
                    negotiated.push(PresentationContextNegotiated {
                        id: result.id,
                        reason: result.reason,
                        abstract_syntax: proposed.abstract_syntax.clone(),
                        transfer_syntax: result.transfer_syntax,
                    });
                }

                if !negotiated
                    .iter()
                    .any(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                {
                    let _ = transport.send_pdu(&Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    });
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                let acceptor_max_pdu_length = user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(value) => Some(*value),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);

                debug!(
                    "association established, {} context(s) accepted",
                    negotiated
                        .iter()
                        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                        .count()
                );

                Ok(ClientAssociation {
                    transport,
                    presentation_contexts: negotiated,
                    requestor_max_pdu_length: max_pdu_length,
                    acceptor_max_pdu_length,
                    state: SessionState::Open,
                    closed_on_error: false,
                })
            }
            Pdu::AssociationRJ { result, source } => RejectedSnafu {
                association_result: result,
                association_source: source,
            }
            .fail(),
            Pdu::AbortRQ { .. } => AbortedSnafu.fail(),
            pdu @ Pdu::Unknown { .. } => {
                let _ = transport.send_pdu(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                UnknownResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu => {
                let _ = transport.send_pdu(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                });
                UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }
}

fn check_ae_title(ae_title: &str) -> Result<()> {
    ensure!(
        !ae_title.trim().is_empty() && ae_title.len() <= 16 && ae_title.is_ascii(),
        InvalidAeTitleSnafu { ae_title }
    );
    Ok(())
}

fn user_identity(
    username: Option<&str>,
    password: Option<&str>,
    kerberos_service_ticket: Option<&str>,
    saml_assertion: Option<&str>,
) -> Option<UserIdentity> {
    if let Some(username) = username {
        if let Some(password) = password {
            return Some(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                username.as_bytes().to_vec(),
                password.as_bytes().to_vec(),
            ));
        }
        return Some(UserIdentity::new(
            false,
            UserIdentityType::Username,
            username.as_bytes().to_vec(),
            vec![],
        ));
    }
    if let Some(ticket) = kerberos_service_ticket {
        return Some(UserIdentity::new(
            false,
            UserIdentityType::KerberosServiceTicket,
            ticket.as_bytes().to_vec(),
            vec![],
        ));
    }
    if let Some(assertion) = saml_assertion {
        return Some(UserIdentity::new(
            false,
            UserIdentityType::SamlAssertion,
            assertion.as_bytes().to_vec(),
            vec![],
        ));
    }
    None
}

/// A DICOM upper level association from the perspective
/// of the association requester.
///
/// PDU exchange methods keep an explicit session state:
/// any inbound A-ABORT or unexpected PDU closes the session,
/// the latter after answering with an A-ABORT of our own.
#[derive(Debug)]
pub struct ClientAssociation {
    /// the transport session owning the socket
    transport: Transport,
    /// the negotiated presentation contexts, accepted or not
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length that this node may receive
    requestor_max_pdu_length: u32,
    /// the maximum PDU length that the peer may receive
    acceptor_max_pdu_length: u32,
    /// where the association stands in its lifecycle
    state: SessionState,
    /// whether the closure was caused by an error
    closed_on_error: bool,
}

impl ClientAssociation {
    /// Retrieve the outcome of every proposed presentation context.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// Retrieve the maximum PDU length admitted by the peer.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// Retrieve the maximum PDU length that this node admits.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The current lifecycle state of this association.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether this association reached its closed state due to an error.
    pub fn closed_on_error(&self) -> bool {
        self.closed_on_error
    }

    /// Obtain a handle with which another thread can force
    /// the underlying connection closed.
    pub fn shutdown_handle(&self) -> std::io::Result<ShutdownHandle> {
        self.transport.shutdown_handle()
    }

    /// Send a PDU message to the peer.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        ensure!(self.state == SessionState::Open, SessionClosedSnafu);
        self.transport.send_pdu(msg).map_err(|e| {
            self.close_on_error();
            e
        })
        .context(SendSnafu)
    }

    /// Read a PDU message from the peer.
    ///
    /// An inbound A-ABORT closes the session and surfaces as an error.
    /// Any PDU that is invalid in the open state is answered
    /// with an A-ABORT before failing.
    pub fn receive(&mut self) -> Result<Pdu> {
        ensure!(self.state == SessionState::Open, SessionClosedSnafu);
        let pdu = self.transport.recv_pdu().map_err(|e| {
            self.close_on_error();
            e
        })
        .context(ReceiveSnafu)?;

        match pdu {
            pdu @ Pdu::PData { .. } => Ok(pdu),
            Pdu::AbortRQ { source } => {
                warn!("association aborted by the peer ({:?})", source);
                self.close_on_error();
                AbortedSnafu.fail()
            }
            pdu @ Pdu::Unknown { .. } => {
                self.abort_and_close();
                UnknownResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu => {
                self.abort_and_close();
                UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }

    /// Gracefully release the association.
    ///
    /// Stray data PDUs arriving before the release reply are discarded.
    pub fn release(&mut self) -> Result<()> {
        ensure!(self.state == SessionState::Open, SessionClosedSnafu);
        self.transport
            .send_pdu(&Pdu::ReleaseRQ)
            .map_err(|e| {
                self.close_on_error();
                e
            })
            .context(SendSnafu)?;
        self.state = SessionState::AwaitingRelease;

        loop {
            let pdu = self
                .transport
                .recv_pdu()
                .map_err(|e| {
                    self.close_on_error();
                    e
                })
                .context(ReceiveSnafu)?;
            match pdu {
                Pdu::ReleaseRP => break,
                Pdu::PData { .. } => {
                    debug!("discarding data PDU while awaiting release");
                }
                Pdu::AbortRQ { source } => {
                    // release was requested anyway,
                    // an abort only makes the closure less graceful
                    warn!("association aborted by the peer during release ({:?})", source);
                    break;
                }
                pdu @ Pdu::Unknown { .. } => {
                    self.abort_and_close();
                    return UnknownResponseSnafu { pdu: Box::new(pdu) }.fail();
                }
                pdu => {
                    self.abort_and_close();
                    return UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail();
                }
            }
        }

        self.state = SessionState::Closed;
        self.transport.close();
        Ok(())
    }

    /// Abort the association by telling the peer to stop at once.
    pub fn abort(&mut self) -> Result<()> {
        self.abort_with(AbortRQSource::ServiceUser)
    }

    /// Abort the association with a specific source and reason.
    pub fn abort_with(&mut self, source: AbortRQSource) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let out = self
            .transport
            .send_pdu(&Pdu::AbortRQ { source })
            .context(SendSnafu);
        self.state = SessionState::Closed;
        self.transport.close();
        out
    }

    /// Obtain a writer for data set bytes on the given presentation
    /// context, which fragments the stream into P-DATA-TF PDUs
    /// within the peer's maximum PDU length.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut Transport> {
        PDataWriter::new(
            &mut self.transport,
            presentation_context_id,
            self.acceptor_max_pdu_length,
        )
    }

    fn close_on_error(&mut self) {
        self.state = SessionState::Closed;
        self.closed_on_error = true;
        self.transport.close();
    }

    fn abort_and_close(&mut self) {
        let _ = self.transport.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
        });
        self.close_on_error();
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.abort();
        }
    }
}
