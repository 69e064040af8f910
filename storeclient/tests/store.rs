//! End-to-end store scenarios against an in-process SCP.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_dul::dimse::{CommandField, CommandSet};
use dicom_dul::pdu::{
    read_pdu, write_pdu, PDataValue, PDataValueType, Pdu, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU,
};
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_storeclient::{
    AeAddr, CStoreClient, CStoreClientOptions, CStoreHandle, RequestStatus, StoreObserver,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

// ---------------------------------------------------------------- fixtures

fn create_dicom_file(dir: &Path, name: &str, sop_class: &str, sop_instance: &str) -> PathBuf {
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "OT")),
    ]);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance)
        .transfer_syntax(EXPLICIT_VR_LE)
        .build()
        .unwrap();
    let path = dir.join(name);
    obj.with_exact_meta(meta).write_to_file(&path).unwrap();
    path
}

// ---------------------------------------------------------------- mock SCP

#[derive(Debug, Default)]
struct ScpReport {
    /// (SOP instance UID, transfer syntax) per stored object
    stores: Vec<(String, String)>,
    connections: usize,
    releases: usize,
}

struct ScpOptions {
    /// abstract syntax → transfer syntaxes this SCP accepts
    accept: Vec<(&'static str, Vec<&'static str>)>,
    /// drop the first connection upon the first store command
    drop_first_store: bool,
    /// how many connections to serve before returning
    connections: usize,
}

fn send_to(stream: &mut TcpStream, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::new();
    write_pdu(&mut buffer, pdu)?;
    stream.write_all(&buffer)?;
    Ok(())
}

fn spawn_scp(options: ScpOptions) -> (JoinHandle<Result<ScpReport>>, SocketAddr) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = std::thread::spawn(move || -> Result<ScpReport> {
        let mut report = ScpReport::default();

        for connection in 0..options.connections {
            let (mut stream, _) = listener.accept()?;
            report.connections += 1;
            let drop_on_store = options.drop_first_store && connection == 0;

            // pcid → accepted transfer syntax
            let mut accepted: HashMap<u8, String> = HashMap::new();
            let mut command_buf: Vec<u8> = Vec::new();
            let mut data_buf: Vec<u8> = Vec::new();
            let mut command: Option<CommandSet> = None;

            'conn: loop {
                match read_pdu(&mut stream, DEFAULT_MAX_PDU, false) {
                    Ok(Pdu::AssociationRQ {
                        protocol_version,
                        calling_ae_title,
                        called_ae_title,
                        application_context_name,
                        presentation_contexts,
                        ..
                    }) => {
                        let results: Vec<_> = presentation_contexts
                            .iter()
                            .map(|pc| {
                                let allowed = options
                                    .accept
                                    .iter()
                                    .find(|(class, _)| *class == pc.abstract_syntax);
                                match allowed {
                                    Some((_, syntaxes)) => {
                                        match pc
                                            .transfer_syntaxes
                                            .iter()
                                            .find(|ts| syntaxes.contains(&ts.as_str()))
                                        {
                                            Some(ts) => {
                                                accepted.insert(pc.id, ts.clone());
                                                PresentationContextResult {
                                                    id: pc.id,
                                                    reason:
                                                        PresentationContextResultReason::Acceptance,
                                                    transfer_syntax: ts.clone(),
                                                }
                                            }
                                            None => PresentationContextResult {
                                                id: pc.id,
                                                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                                                transfer_syntax: pc.transfer_syntaxes[0].clone(),
                                            },
                                        }
                                    }
                                    None => PresentationContextResult {
                                        id: pc.id,
                                        reason:
                                            PresentationContextResultReason::AbstractSyntaxNotSupported,
                                        transfer_syntax: pc.transfer_syntaxes[0].clone(),
                                    },
                                }
                            })
                            .collect();
                        send_to(
                            &mut stream,
                            &Pdu::AssociationAC {
                                protocol_version,
                                calling_ae_title,
                                called_ae_title,
                                application_context_name,
                                presentation_contexts: results,
                                user_variables: vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
                            },
                        )?;
                    }
                    Ok(Pdu::PData { data }) => {
                        for pdv in data {
                            match pdv.value_type {
                                PDataValueType::Command => {
                                    if drop_on_store {
                                        // simulated transport loss mid-exchange
                                        break 'conn;
                                    }
                                    command_buf.extend(&pdv.data);
                                    if pdv.is_last {
                                        command = Some(CommandSet::read_from(&command_buf)?);
                                        command_buf.clear();
                                    }
                                }
                                PDataValueType::Data => {
                                    data_buf.extend(&pdv.data);
                                    if pdv.is_last {
                                        let cmd = command.take().expect("command before data");
                                        assert_eq!(cmd.command_field, CommandField::CStoreRq);
                                        let ts_uid = accepted
                                            .get(&pdv.presentation_context_id)
                                            .expect("data on an accepted context");
                                        // the data set must parse under the accepted syntax
                                        let parsed = InMemDicomObject::read_dataset_with_ts(
                                            data_buf.as_slice(),
                                            TransferSyntaxRegistry.get(ts_uid).unwrap(),
                                        )?;
                                        let instance = parsed
                                            .element(tags::SOP_INSTANCE_UID)?
                                            .to_str()?
                                            .trim_end_matches('\0')
                                            .to_string();
                                        report.stores.push((instance, ts_uid.clone()));
                                        data_buf.clear();

                                        let mut rsp = Vec::new();
                                        CommandSet::c_store_rsp(
                                            cmd.message_id.unwrap(),
                                            cmd.affected_sop_class_uid.as_deref().unwrap(),
                                            cmd.affected_sop_instance_uid.as_deref().unwrap(),
                                            0x0000,
                                        )
                                        .write_to(&mut rsp)?;
                                        send_to(
                                            &mut stream,
                                            &Pdu::PData {
                                                data: vec![PDataValue {
                                                    presentation_context_id: pdv
                                                        .presentation_context_id,
                                                    value_type: PDataValueType::Command,
                                                    is_last: true,
                                                    data: rsp,
                                                }],
                                            },
                                        )?;
                                    }
                                }
                            }
                        }
                    }
                    Ok(Pdu::ReleaseRQ) => {
                        send_to(&mut stream, &Pdu::ReleaseRP)?;
                        report.releases += 1;
                        break;
                    }
                    Ok(Pdu::AbortRQ { .. }) | Err(_) => break,
                    Ok(pdu) => panic!("SCP got unexpected {:?}", pdu),
                }
            }
        }

        Ok(report)
    });

    (handle, addr)
}

// ---------------------------------------------------------------- observer

#[derive(Default)]
struct Recorder {
    begins: AtomicUsize,
    responses: Mutex<Vec<u16>>,
    failures: Mutex<Vec<String>>,
    completes: AtomicUsize,
    closes: AtomicUsize,
    network_errors: AtomicUsize,
}

impl Recorder {
    fn responses(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl StoreObserver for Recorder {
    fn on_request_begin(&self, _request: &CStoreHandle) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn on_request_failed(&self, _request: &CStoreHandle, reason: &str) {
        self.failures.lock().unwrap().push(reason.to_string());
    }

    fn on_response(&self, _request: &CStoreHandle, status: u16) {
        self.responses.lock().unwrap().push(status);
    }

    fn on_complete(&self) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_network_error(&self, _error: &str) {
        self.network_errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn target(addr: SocketAddr) -> AeAddr {
    format!("TEST-SCP@{}", addr).parse().unwrap()
}

// ---------------------------------------------------------------- tests

#[test]
fn stores_single_file_over_matching_syntax() {
    let dir = tempfile::tempdir().unwrap();
    let file = create_dicom_file(dir.path(), "ct.dcm", CT_IMAGE_STORAGE, "1.2.3.1");

    let (scp, addr) = spawn_scp(ScpOptions {
        accept: vec![(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])],
        drop_first_store: false,
        connections: 1,
    });

    let recorder = Arc::new(Recorder::default());
    let client = CStoreClient::with_observer(
        target(addr),
        CStoreClientOptions::default().calling_ae_title("TEST-SCU"),
        recorder.clone(),
    );

    let request = client.add_file(&file);
    client.wait();

    assert_eq!(request.status(), RequestStatus::Success);
    assert!(!request.is_loaded());
    assert_eq!(request.transfer_syntax(), EXPLICIT_VR_LE);
    assert_eq!(client.queue_len(), 0);
    assert_eq!(recorder.begins.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.responses.lock().unwrap(), vec![0x0000]);
    assert_eq!(recorder.completes.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);

    let report = scp.join().unwrap().unwrap();
    assert_eq!(report.stores, vec![("1.2.3.1".to_string(), EXPLICIT_VR_LE.to_string())]);
    assert_eq!(report.releases, 1);
}

#[test]
fn falls_back_to_implicit_vr() {
    let dir = tempfile::tempdir().unwrap();
    let file = create_dicom_file(dir.path(), "ct.dcm", CT_IMAGE_STORAGE, "1.2.3.2");

    let (scp, addr) = spawn_scp(ScpOptions {
        accept: vec![(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])],
        drop_first_store: false,
        connections: 1,
    });

    let client = CStoreClient::new(
        target(addr),
        CStoreClientOptions::default().calling_ae_title("TEST-SCU"),
    );

    let request = client.add_file(&file);
    client.wait();

    assert_eq!(request.status(), RequestStatus::Success);
    // after unload the effective syntax reverts to the file's own
    assert_eq!(request.transfer_syntax(), EXPLICIT_VR_LE);

    let report = scp.join().unwrap().unwrap();
    assert_eq!(report.stores, vec![("1.2.3.2".to_string(), IMPLICIT_VR_LE.to_string())]);
}

#[test]
fn unsupported_sop_class_fails_only_that_request() {
    let dir = tempfile::tempdir().unwrap();
    let ct = create_dicom_file(dir.path(), "ct.dcm", CT_IMAGE_STORAGE, "1.2.3.3");
    let mr = create_dicom_file(dir.path(), "mr.dcm", MR_IMAGE_STORAGE, "1.2.3.4");

    let (scp, addr) = spawn_scp(ScpOptions {
        accept: vec![(MR_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])],
        drop_first_store: false,
        connections: 1,
    });

    let recorder = Arc::new(Recorder::default());
    let client = CStoreClient::with_observer(
        target(addr),
        CStoreClientOptions::default().calling_ae_title("TEST-SCU"),
        recorder.clone(),
    );

    // hold the sender until both files are known,
    // so a single association carries both proposals
    client.cancel(true);
    let ct_request = client.add_file(&ct);
    let mr_request = client.add_file(&mr);
    client.reconnect();
    assert!(wait_until(Duration::from_secs(10), || {
        mr_request.status() == RequestStatus::Success
    }));
    client.wait();

    assert_eq!(ct_request.status(), RequestStatus::SopClassNotSupported);
    assert!(ct_request.last_error().is_some());
    assert_eq!(mr_request.status(), RequestStatus::Success);
    assert_eq!(recorder.failures.lock().unwrap().len(), 1);
    assert_eq!(recorder.responses(), 1);

    let report = scp.join().unwrap().unwrap();
    assert_eq!(report.stores, vec![("1.2.3.4".to_string(), EXPLICIT_VR_LE.to_string())]);
}

#[test]
fn reconnects_and_retries_after_transport_loss() {
    let dir = tempfile::tempdir().unwrap();
    let file = create_dicom_file(dir.path(), "ct.dcm", CT_IMAGE_STORAGE, "1.2.3.5");

    let (scp, addr) = spawn_scp(ScpOptions {
        accept: vec![(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])],
        drop_first_store: true,
        connections: 2,
    });

    let recorder = Arc::new(Recorder::default());
    let client = CStoreClient::with_observer(
        target(addr),
        CStoreClientOptions::default().calling_ae_title("TEST-SCU"),
        recorder.clone(),
    );

    let request = client.add_file(&file);
    assert!(wait_until(Duration::from_secs(30), || {
        request.status() == RequestStatus::Success
    }));
    client.wait();

    // lost once, stored exactly once on the second association
    assert_eq!(recorder.network_errors.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.responses(), 1);

    let report = scp.join().unwrap().unwrap();
    assert_eq!(report.connections, 2);
    assert_eq!(report.stores, vec![("1.2.3.5".to_string(), EXPLICIT_VR_LE.to_string())]);
}

#[test]
fn cancel_during_linger_skips_complete() {
    let dir = tempfile::tempdir().unwrap();
    let a = create_dicom_file(dir.path(), "a.dcm", CT_IMAGE_STORAGE, "1.2.3.6");
    let b = create_dicom_file(dir.path(), "b.dcm", CT_IMAGE_STORAGE, "1.2.3.7");

    let (scp, addr) = spawn_scp(ScpOptions {
        accept: vec![(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])],
        drop_first_store: false,
        connections: 1,
    });

    let recorder = Arc::new(Recorder::default());
    let client = CStoreClient::with_observer(
        target(addr),
        CStoreClientOptions::default()
            .calling_ae_title("TEST-SCU")
            .linger(Duration::from_secs(30)),
        recorder.clone(),
    );

    client.add_file(&a);
    client.add_file(&b);
    assert!(wait_until(Duration::from_secs(10), || recorder.responses() == 2));

    // the association is now lingering; stop the works
    client.cancel(true);

    assert_eq!(recorder.completes.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);

    let report = scp.join().unwrap().unwrap();
    assert_eq!(report.stores.len(), 2);
    assert_eq!(report.releases, 1);
}

#[test]
fn cancel_then_reconnect_preserves_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let files: Vec<_> = (0..3)
        .map(|i| {
            create_dicom_file(
                dir.path(),
                &format!("f{}.dcm", i),
                CT_IMAGE_STORAGE,
                &format!("1.2.4.{}", i),
            )
        })
        .collect();

    let (scp, addr) = spawn_scp(ScpOptions {
        accept: vec![(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])],
        drop_first_store: false,
        connections: 1,
    });

    let recorder = Arc::new(Recorder::default());
    let client = CStoreClient::with_observer(
        target(addr),
        CStoreClientOptions::default().calling_ae_title("TEST-SCU"),
        recorder.clone(),
    );

    // cancellation holds before any request is taken up
    client.cancel(true);
    let handles: Vec<_> = files.iter().map(|f| client.add_file(f)).collect();

    assert!(wait_until(Duration::from_secs(5), || !client.is_running()));
    assert_eq!(client.queue_len(), 3);
    assert_eq!(recorder.responses(), 0);

    // no request was lost or duplicated across the restart
    client.reconnect();
    assert!(wait_until(Duration::from_secs(10), || recorder.responses() == 3));
    client.wait();

    assert_eq!(client.queue_len(), 0);
    for handle in &handles {
        assert_eq!(handle.status(), RequestStatus::Success);
    }

    let report = scp.join().unwrap().unwrap();
    assert_eq!(report.stores.len(), 3);
}
