//! Reassembly of DIMSE messages from presentation data value fragments.
//!
//! The assembler collects command fragments until the command set
//! can be decoded, then collects the accompanying data set, if any,
//! either in memory or spilled to a file on disk.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dicom_object::FileMetaTableBuilder;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};

use super::{CommandField, CommandSet, TransferMonitor, TransferProgress};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to decode the completed command set
    DecodeCommand {
        #[snafu(backtrace)]
        source: Box<super::Error>,
    },

    /// received a data set fragment with no preceding command
    DataSetWithoutCommand { backtrace: Backtrace },

    #[snafu(display(
        "presentation context changed mid-message (expected {}, got {})",
        expected,
        got
    ))]
    PresentationContextChanged {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context #{} was not negotiated", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    /// could not create the data set spill file
    CreateSpillFile {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not build the file meta group for the spill file
    BuildSpillMeta {
        #[snafu(source(from(dicom_object::meta::Error, Box::from)))]
        source: Box<dicom_object::meta::Error>,
    },

    /// could not write to the data set spill file
    WriteSpillFile {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How inbound data sets should be buffered.
#[derive(Debug, Clone, Default)]
pub struct ReceivePolicy {
    /// buffer data sets in a file instead of memory
    pub use_file_buffer: bool,
    /// where spill files go; the system temp directory when unset
    pub spill_dir: Option<PathBuf>,
}

/// A completed inbound DIMSE message.
#[derive(Debug)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub data_set: DimseDataset,
}

/// The data set portion of a completed DIMSE message.
#[derive(Debug, PartialEq, Eq)]
pub enum DimseDataset {
    /// the command announced no data set
    None,
    /// the data set bytes, in the transfer syntax of the context
    InMemory(Vec<u8>),
    /// the data set was written to a DICOM file at this path
    Spilled(PathBuf),
}

enum DatasetSink {
    Memory(Vec<u8>),
    File {
        path: PathBuf,
        file: BufWriter<File>,
    },
}

struct Exchange {
    presentation_context_id: u8,
    command_buf: Vec<u8>,
    command: Option<CommandSet>,
    sink: Option<DatasetSink>,
    bytes_transferred: u64,
    estimated_command_length: u64,
    started: bool,
}

impl Exchange {
    fn new(presentation_context_id: u8) -> Self {
        Exchange {
            presentation_context_id,
            command_buf: Vec::with_capacity(128),
            command: None,
            sink: None,
            bytes_transferred: 0,
            estimated_command_length: 0,
            started: false,
        }
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            presentation_context_id: self.presentation_context_id,
            bytes_transferred: self.bytes_transferred,
            estimated_command_length: self.estimated_command_length,
            estimated_data_set_length: 0,
        }
    }

    /// Throw the exchange away, removing its spill file if one exists.
    fn discard(self) {
        if let Some(DatasetSink::File { path, file }) = self.sink {
            drop(file);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("could not remove spill file {}: {}", path.display(), e);
            }
        }
    }
}

/// Reassembles one DIMSE message at a time
/// from the PDV fragments of an association.
///
/// Feed every inbound presentation data value through
/// [`feed`](DimseAssembler::feed);
/// a completed message is returned once its final fragment arrives.
pub struct DimseAssembler {
    policy: ReceivePolicy,
    exchange: Option<Exchange>,
    /// chooses a destination file for an inbound C-STORE data set;
    /// consulted after the command set completes
    /// and before any data set byte arrives
    destination_hook: Option<Box<dyn FnMut(&CommandSet) -> Option<PathBuf> + Send>>,
}

impl std::fmt::Debug for DimseAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimseAssembler")
            .field("policy", &self.policy)
            .field("in_flight", &self.exchange.is_some())
            .finish()
    }
}

impl DimseAssembler {
    pub fn new(policy: ReceivePolicy) -> Self {
        DimseAssembler {
            policy,
            exchange: None,
            destination_hook: None,
        }
    }

    /// Install a hook that picks the destination file
    /// for inbound C-STORE data sets.
    /// Returning `None` falls back to the receive policy.
    pub fn destination_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&CommandSet) -> Option<PathBuf> + Send + 'static,
    {
        self.destination_hook = Some(Box::new(hook));
        self
    }

    /// Whether a message is currently being assembled.
    pub fn in_flight(&self) -> bool {
        self.exchange.is_some()
    }

    /// Process one inbound presentation data value.
    ///
    /// Returns the completed message when this fragment was its last.
    /// On error the exchange is torn down
    /// and any spill file is removed.
    pub fn feed(
        &mut self,
        pdv: PDataValue,
        contexts: &[PresentationContextNegotiated],
        monitor: &mut dyn TransferMonitor,
    ) -> Result<Option<DimseMessage>> {
        match self.feed_inner(pdv, contexts, monitor) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.abort_exchange();
                Err(e)
            }
        }
    }

    fn feed_inner(
        &mut self,
        pdv: PDataValue,
        contexts: &[PresentationContextNegotiated],
        monitor: &mut dyn TransferMonitor,
    ) -> Result<Option<DimseMessage>> {
        let mut exchange = self
            .exchange
            .take()
            .unwrap_or_else(|| Exchange::new(pdv.presentation_context_id));

        if exchange.presentation_context_id != pdv.presentation_context_id {
            let expected = exchange.presentation_context_id;
            self.exchange = Some(exchange);
            return PresentationContextChangedSnafu {
                expected,
                got: pdv.presentation_context_id,
            }
            .fail();
        }

        if !exchange.started {
            exchange.started = true;
            monitor.on_receive_begin(&exchange.progress());
        }

        match pdv.value_type {
            PDataValueType::Command => {
                exchange.command_buf.extend_from_slice(&pdv.data);
                exchange.bytes_transferred += pdv.data.len() as u64;
                monitor.on_receive_progress(&exchange.progress());

                if !pdv.is_last {
                    self.exchange = Some(exchange);
                    return Ok(None);
                }

                let decoded = CommandSet::read_from(&exchange.command_buf)
                    .map_err(Box::from)
                    .context(DecodeCommandSnafu);
                let command = match decoded {
                    Ok(command) => command,
                    Err(e) => {
                        self.exchange = Some(exchange);
                        return Err(e);
                    }
                };
                exchange.estimated_command_length = exchange.command_buf.len() as u64;

                if !command.has_data_set() {
                    monitor.on_receive_complete(&exchange.progress());
                    return Ok(Some(DimseMessage {
                        presentation_context_id: exchange.presentation_context_id,
                        command,
                        data_set: DimseDataset::None,
                    }));
                }

                // a data set follows; decide where it goes
                // before its first byte arrives
                let destination = match &mut self.destination_hook {
                    Some(hook) if command.command_field == CommandField::CStoreRq => hook(&command),
                    _ => None,
                };

                let pcid = exchange.presentation_context_id;
                let sink = if let Some(path) = destination {
                    open_spill_file(&command, pcid, contexts, path)
                } else if self.policy.use_file_buffer {
                    let path = self.synthetic_spill_path(&command);
                    open_spill_file(&command, pcid, contexts, path)
                } else {
                    Ok(DatasetSink::Memory(Vec::new()))
                };
                let sink = match sink {
                    Ok(sink) => sink,
                    Err(e) => {
                        self.exchange = Some(exchange);
                        return Err(e);
                    }
                };
                exchange.sink = Some(sink);
                exchange.command = Some(command);
                self.exchange = Some(exchange);
                Ok(None)
            }
            PDataValueType::Data => {
                if exchange.command.is_none() {
                    self.exchange = Some(exchange);
                    return DataSetWithoutCommandSnafu.fail();
                }

                let written = match exchange
                    .sink
                    .get_or_insert_with(|| DatasetSink::Memory(Vec::new()))
                {
                    DatasetSink::Memory(buffer) => {
                        buffer.extend_from_slice(&pdv.data);
                        Ok(())
                    }
                    DatasetSink::File { file, .. } => {
                        // append only; the file is reopened by the consumer
                        file.write_all(&pdv.data).context(WriteSpillFileSnafu)
                    }
                };
                if let Err(e) = written {
                    self.exchange = Some(exchange);
                    return Err(e);
                }
                exchange.bytes_transferred += pdv.data.len() as u64;
                monitor.on_receive_progress(&exchange.progress());

                if !pdv.is_last {
                    self.exchange = Some(exchange);
                    return Ok(None);
                }

                let command = match exchange.command.take() {
                    Some(command) => command,
                    None => {
                        self.exchange = Some(exchange);
                        return DataSetWithoutCommandSnafu.fail();
                    }
                };
                let data_set = match exchange.sink.take() {
                    Some(DatasetSink::Memory(buffer)) => DimseDataset::InMemory(buffer),
                    Some(DatasetSink::File { path, mut file }) => {
                        if let Err(e) = file.flush().context(WriteSpillFileSnafu) {
                            exchange.sink = Some(DatasetSink::File { path, file });
                            self.exchange = Some(exchange);
                            return Err(e);
                        }
                        debug!("data set spilled to {}", path.display());
                        DimseDataset::Spilled(path)
                    }
                    None => DimseDataset::InMemory(Vec::new()),
                };

                monitor.on_receive_complete(&TransferProgress {
                    presentation_context_id: exchange.presentation_context_id,
                    bytes_transferred: exchange.bytes_transferred,
                    estimated_command_length: exchange.estimated_command_length,
                    estimated_data_set_length: exchange.bytes_transferred
                        - exchange.estimated_command_length,
                });

                Ok(Some(DimseMessage {
                    presentation_context_id: exchange.presentation_context_id,
                    command,
                    data_set,
                }))
            }
        }
    }

    /// Tear down the exchange in flight, removing any spill file.
    pub fn abort_exchange(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            exchange.discard();
        }
    }

    fn synthetic_spill_path(&self, command: &CommandSet) -> PathBuf {
        static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);
        let dir = self
            .policy
            .spill_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "dimse-{}-{}-{}.dcm",
            std::process::id(),
            seq,
            command.message_id.unwrap_or(0),
        );
        dir.join(name)
    }
}

/// Create a spill file and pre-write a valid DICOM file head:
/// preamble, magic code
/// and a file meta group synthesized from the command set
/// and the transfer syntax of the accepted presentation context.
fn open_spill_file(
    command: &CommandSet,
    presentation_context_id: u8,
    contexts: &[PresentationContextNegotiated],
    path: PathBuf,
) -> Result<DatasetSink> {
    let context = contexts
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .context(UnknownPresentationContextSnafu {
            id: presentation_context_id,
        })?;

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(command.affected_sop_class_uid.as_deref().unwrap_or_default())
        .media_storage_sop_instance_uid(
            command
                .affected_sop_instance_uid
                .as_deref()
                .unwrap_or_default(),
        )
        .transfer_syntax(&context.transfer_syntax)
        .build()
        .context(BuildSpillMetaSnafu)?;

    let file = File::create(&path).with_context(|_| CreateSpillFileSnafu { path: path.clone() })?;
    let mut file = BufWriter::new(file);

    file.write_all(&[0u8; 128]).context(WriteSpillFileSnafu)?;
    file.write_all(b"DICM").context(WriteSpillFileSnafu)?;
    meta.write(&mut file)
        .context(BuildSpillMetaSnafu)?;

    Ok(DatasetSink::File { path, file })
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use crate::pdu::{
        PDataValue, PDataValueType, PresentationContextNegotiated, PresentationContextResultReason,
    };

    use super::super::{CommandSet, NullMonitor, Priority, TransferMonitor, TransferProgress};
    use super::{DimseAssembler, DimseDataset, ReceivePolicy};

    /// Captures the counters of the last completion event.
    #[derive(Default)]
    struct LastProgress(Option<TransferProgress>);

    impl TransferMonitor for LastProgress {
        fn on_receive_complete(&mut self, progress: &TransferProgress) {
            self.0 = Some(*progress);
        }
    }

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn negotiated() -> Vec<PresentationContextNegotiated> {
        vec![PresentationContextNegotiated {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            abstract_syntax: CT_IMAGE_STORAGE.to_string(),
            transfer_syntax: EXPLICIT_VR_LE.to_string(),
        }]
    }

    fn command_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        CommandSet::c_store_rq(1, CT_IMAGE_STORAGE, "1.2.3.4", Priority::Medium)
            .write_to(&mut bytes)
            .unwrap();
        bytes
    }

    #[test]
    fn assembles_command_and_data_across_fragments() {
        let mut assembler = DimseAssembler::new(ReceivePolicy::default());
        let contexts = negotiated();
        let cmd = command_bytes();
        let (cmd_a, cmd_b) = cmd.split_at(cmd.len() / 2);

        let out = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: false,
                    data: cmd_a.to_vec(),
                },
                &contexts,
                &mut NullMonitor,
            )
            .unwrap();
        assert!(out.is_none());

        let out = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_b.to_vec(),
                },
                &contexts,
                &mut NullMonitor,
            )
            .unwrap();
        // the command announces a data set, so the message is not done
        assert!(out.is_none());
        assert!(assembler.in_flight());

        let payload: Vec<u8> = (0..200u16).map(|x| x as u8).collect();
        let (data_a, data_b) = payload.split_at(77);

        let out = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: false,
                    data: data_a.to_vec(),
                },
                &contexts,
                &mut NullMonitor,
            )
            .unwrap();
        assert!(out.is_none());

        let mut monitor = LastProgress::default();
        let message = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: data_b.to_vec(),
                },
                &contexts,
                &mut monitor,
            )
            .unwrap()
            .expect("message must be complete");

        assert_eq!(message.presentation_context_id, 1);
        assert_eq!(message.command.message_id, Some(1));
        assert_eq!(message.data_set, DimseDataset::InMemory(payload));
        assert!(!assembler.in_flight());

        // every fragment byte is accounted for in the counters
        let progress = monitor.0.expect("completion must be reported");
        assert_eq!(
            progress.bytes_transferred,
            (cmd.len() + 200) as u64
        );
        assert_eq!(progress.estimated_command_length, cmd.len() as u64);
        assert_eq!(progress.estimated_data_set_length, 200);
    }

    #[test]
    fn spills_data_set_to_file_with_valid_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut assembler = DimseAssembler::new(ReceivePolicy {
            use_file_buffer: true,
            spill_dir: Some(dir.path().to_path_buf()),
        });
        let contexts = negotiated();

        assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: command_bytes(),
                },
                &contexts,
                &mut NullMonitor,
            )
            .unwrap();

        let message = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: vec![8; 64],
                },
                &contexts,
                &mut NullMonitor,
            )
            .unwrap()
            .expect("message must be complete");

        let path = match message.data_set {
            DimseDataset::Spilled(path) => path,
            other => panic!("expected a spilled data set, got {:?}", other),
        };

        let mut contents = Vec::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(&contents[128..132], b"DICM");
        // the appended payload sits at the very end
        assert_eq!(&contents[contents.len() - 64..], &[8; 64][..]);
    }

    #[test]
    fn data_without_command_is_a_protocol_error() {
        let mut assembler = DimseAssembler::new(ReceivePolicy::default());
        let contexts = negotiated();

        let result = assembler.feed(
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 8],
            },
            &contexts,
            &mut NullMonitor,
        );
        assert!(result.is_err());
        assert!(!assembler.in_flight());
    }
}
