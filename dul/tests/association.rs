//! Association negotiation tests against an in-process SCP.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};

use dicom_dul::association::client::{ClientAssociationOptions, Error};
use dicom_dul::dimse::{self, CommandField, CommandSet};
use dicom_dul::pdu::{
    read_pdu, write_pdu, AssociationRJResult, AssociationRJSource,
    AssociationRJServiceUserReason, PDataValue, PDataValueType, Pdu, PresentationContextResult,
    PresentationContextResultReason, DEFAULT_MAX_PDU,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";

static VERIFICATION: &str = "1.2.840.10008.1.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

fn send(stream: &mut TcpStream, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::new();
    write_pdu(&mut buffer, pdu)?;
    stream.write_all(&buffer)?;
    Ok(())
}

/// Accept one association, accepting the first transfer syntax
/// of every proposed presentation context,
/// answer verification requests,
/// and play along until release.
fn spawn_scp() -> Result<(std::thread::JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let h = std::thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;

        loop {
            match read_pdu(&mut stream, DEFAULT_MAX_PDU, false) {
                Ok(Pdu::AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts,
                    ..
                }) => {
                    assert_eq!(calling_ae_title, SCU_AE_TITLE);
                    assert_eq!(called_ae_title, SCP_AE_TITLE);
                    let accepted = presentation_contexts
                        .iter()
                        .map(|pc| PresentationContextResult {
                            id: pc.id,
                            reason: PresentationContextResultReason::Acceptance,
                            transfer_syntax: pc.transfer_syntaxes[0].clone(),
                        })
                        .collect::<Vec<_>>();
                    send(
                        &mut stream,
                        &Pdu::AssociationAC {
                            protocol_version,
                            calling_ae_title,
                            called_ae_title,
                            application_context_name,
                            presentation_contexts: accepted,
                            user_variables: vec![],
                        },
                    )?;
                }
                Ok(Pdu::PData { data }) => {
                    for pdv in data {
                        if pdv.value_type != PDataValueType::Command || !pdv.is_last {
                            continue;
                        }
                        let command = CommandSet::read_from(&pdv.data)?;
                        assert_eq!(command.command_field, CommandField::CEchoRq);
                        let mut rsp = Vec::new();
                        CommandSet::c_echo_rsp(command.message_id.unwrap(), 0x0000)
                            .write_to(&mut rsp)?;
                        send(
                            &mut stream,
                            &Pdu::PData {
                                data: vec![PDataValue {
                                    presentation_context_id: pdv.presentation_context_id,
                                    value_type: PDataValueType::Command,
                                    is_last: true,
                                    data: rsp,
                                }],
                            },
                        )?;
                    }
                }
                Ok(Pdu::ReleaseRQ) => {
                    send(&mut stream, &Pdu::ReleaseRP)?;
                    break;
                }
                Ok(Pdu::AbortRQ { .. }) | Err(_) => break,
                Ok(pdu) => panic!("SCP got unexpected {:?}", pdu),
            }
        }
        Ok(())
    });
    Ok((h, addr))
}

#[test]
fn negotiate_and_release() {
    let (scp, addr) = spawn_scp().unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(MR_IMAGE_STORAGE, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let contexts = association.presentation_contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].id, 1);
    assert_eq!(contexts[0].abstract_syntax, MR_IMAGE_STORAGE);
    assert_eq!(contexts[0].transfer_syntax, EXPLICIT_VR_LE);
    assert_eq!(contexts[1].id, 3);
    assert_eq!(contexts[1].abstract_syntax, VERIFICATION);
    assert_eq!(contexts[1].transfer_syntax, IMPLICIT_VR_LE);

    association.release().expect("release must succeed");
    assert!(!association.closed_on_error());

    scp.join().expect("SCP panicked").expect("SCP error");
}

#[test]
fn echo_round_trip() {
    let (scp, addr) = spawn_scp().unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let status = dimse::send_c_echo(&mut association, 1).unwrap();
    assert_eq!(status, 0x0000);

    association.release().unwrap();
    scp.join().expect("SCP panicked").expect("SCP error");
}

#[test]
fn rejected_association_surfaces_the_reason() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = std::thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;
        let _ = read_pdu(&mut stream, DEFAULT_MAX_PDU, false)?;
        send(
            &mut stream,
            &Pdu::AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            },
        )?;
        Ok(())
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NO-SUCH-AE")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .expect_err("the association must be rejected");

    match err {
        Error::Rejected {
            association_result: AssociationRJResult::Permanent,
            association_source:
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            ..
        } => {}
        other => panic!("expected Rejected, got {:?}", other),
    }

    scp.join().expect("SCP panicked").expect("SCP error");
}

#[test]
fn unexpected_pdu_during_negotiation_is_refused() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = std::thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;
        let _ = read_pdu(&mut stream, DEFAULT_MAX_PDU, false)?;
        // a release reply is never valid at this point
        send(&mut stream, &Pdu::ReleaseRP)?;
        // the SCU must answer with an abort
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, false)?;
        assert!(matches!(pdu, Pdu::AbortRQ { .. }));
        Ok(())
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .expect_err("negotiation must fail");

    assert!(matches!(err, Error::UnexpectedResponse { .. }));

    scp.join().expect("SCP panicked").expect("SCP error");
}

#[test]
fn accepted_transfer_syntax_must_have_been_proposed() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = std::thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, false)?;
        let (protocol_version, calling_ae_title, called_ae_title, application_context_name, id) =
            match pdu {
                Pdu::AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts,
                    ..
                } => (
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts[0].id,
                ),
                pdu => panic!("expected A-ASSOCIATE-RQ, got {:?}", pdu),
            };
        send(
            &mut stream,
            &Pdu::AssociationAC {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts: vec![PresentationContextResult {
                    id,
                    reason: PresentationContextResultReason::Acceptance,
                    // never proposed by the SCU
                    transfer_syntax: "1.2.840.10008.1.2.2".to_string(),
                }],
                user_variables: vec![],
            },
        )?;
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, false)?;
        assert!(matches!(pdu, Pdu::AbortRQ { .. }));
        Ok(())
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .expect_err("negotiation must fail");

    assert!(matches!(
        err,
        Error::AcceptedTransferSyntaxNotProposed { .. }
    ));

    scp.join().expect("SCP panicked").expect("SCP error");
}

/// The peer pushes a storage request at us:
/// the data set is spilled to the file chosen by the application,
/// the dispatcher routes the message to the handler,
/// the reply travels back, and the spill file is cleaned up.
#[test]
fn inbound_store_is_spilled_dispatched_and_answered() {
    use dicom_dul::dimse::{
        dispatch, receive_dimse, DimseAssembler, DimseDataset, DimseMessage, Reaction,
        ReceivePolicy, ServiceHandlers,
    };
    use dicom_object::InMemDicomObject;

    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = std::thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;
        // accept the proposed context as offered
        let pcid = match read_pdu(&mut stream, DEFAULT_MAX_PDU, false)? {
            Pdu::AssociationRQ {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                ..
            } => {
                let id = presentation_contexts[0].id;
                let ts = presentation_contexts[0].transfer_syntaxes[0].clone();
                send(
                    &mut stream,
                    &Pdu::AssociationAC {
                        protocol_version,
                        calling_ae_title,
                        called_ae_title,
                        application_context_name,
                        presentation_contexts: vec![PresentationContextResult {
                            id,
                            reason: PresentationContextResultReason::Acceptance,
                            transfer_syntax: ts,
                        }],
                        user_variables: vec![],
                    },
                )?;
                id
            }
            pdu => panic!("expected A-ASSOCIATE-RQ, got {:?}", pdu),
        };

        // push a C-STORE-RQ with a small data set
        let mut cmd = Vec::new();
        CommandSet::c_store_rq(
            9,
            MR_IMAGE_STORAGE,
            "1.2.3.9",
            dicom_dul::dimse::Priority::Medium,
        )
        .write_to(&mut cmd)?;
        let mut dataset = Vec::new();
        InMemDicomObject::from_element_iter([dicom_core::DataElement::new(
            dicom_dictionary_std::tags::SOP_INSTANCE_UID,
            dicom_core::VR::UI,
            dicom_core::dicom_value!(Str, "1.2.3.9"),
        )])
        .write_dataset_with_ts(
            &mut dataset,
            &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )?;
        send(
            &mut stream,
            &Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id: pcid,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: cmd,
                    },
                    PDataValue {
                        presentation_context_id: pcid,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: dataset,
                    },
                ],
            },
        )?;

        // the reply must be a successful C-STORE-RSP
        match read_pdu(&mut stream, DEFAULT_MAX_PDU, false)? {
            Pdu::PData { data } => {
                let rsp = CommandSet::read_from(&data[0].data)?;
                assert_eq!(rsp.command_field, CommandField::CStoreRsp);
                assert_eq!(rsp.status, Some(0x0000));
                assert_eq!(rsp.message_id_responded_to, Some(9));
            }
            pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
        }

        match read_pdu(&mut stream, DEFAULT_MAX_PDU, false)? {
            Pdu::ReleaseRQ => send(&mut stream, &Pdu::ReleaseRP)?,
            pdu => panic!("expected A-RELEASE-RQ, got {:?}", pdu),
        }
        Ok(())
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(MR_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let spill_dir = tempfile::tempdir().unwrap();
    let destination = spill_dir.path().join("incoming.dcm");
    let hook_destination = destination.clone();
    let mut assembler = DimseAssembler::new(ReceivePolicy::default())
        .destination_hook(move |_| Some(hook_destination.clone()));

    let message = receive_dimse(&mut association, &mut assembler).unwrap();

    struct StoreHandler {
        spilled: Option<std::path::PathBuf>,
    }
    impl ServiceHandlers for StoreHandler {
        fn on_c_store_rq(&mut self, message: &DimseMessage) -> Reaction {
            if let DimseDataset::Spilled(path) = &message.data_set {
                self.spilled = Some(path.clone());
            }
            Reaction::Reply(CommandSet::c_store_rsp(
                message.command.message_id.unwrap(),
                message.command.affected_sop_class_uid.clone().unwrap(),
                message.command.affected_sop_instance_uid.clone().unwrap(),
                0x0000,
            ))
        }
    }

    let mut handler = StoreHandler { spilled: None };
    // the spill file is a valid DICOM file while the handler runs
    {
        let spilled = match &message.data_set {
            DimseDataset::Spilled(path) => path.clone(),
            other => panic!("expected a spilled data set, got {:?}", other),
        };
        let contents = std::fs::read(&spilled).unwrap();
        assert_eq!(&contents[128..132], b"DICM");
    }
    dispatch(&mut handler, &mut association, &message).unwrap();

    assert_eq!(handler.spilled.as_deref(), Some(destination.as_path()));
    // the post dispatch cleanup removed the spill file
    assert!(!destination.exists());

    association.release().unwrap();
    scp.join().expect("SCP panicked").expect("SCP error");
}
