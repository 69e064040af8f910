//! Emission of DIMSE messages as P-DATA-TF PDUs.
//!
//! A message whose command and data set fit in one PDU
//! travels whole; anything larger is fragmented
//! within the peer's maximum PDU length,
//! streaming from memory or straight from a DICOM file on disk.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dicom_object::meta::FileMetaTable;
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::debug;

use crate::association::client::ClientAssociation;
use crate::pdu::{PDataValue, PDataValueType, Pdu, DEFAULT_MAX_PDU};

use super::{CommandSet, TransferMonitor, TransferProgress};

/// Headroom subtracted from the peer's maximum PDU length
/// when deciding whether a whole message fits in a single PDU.
const SINGLE_PDU_HEADROOM: u32 = 100;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to encode the command set
    EncodeCommand {
        #[snafu(backtrace)]
        source: Box<super::Error>,
    },

    /// failed to send on the association
    Send {
        #[snafu(backtrace)]
        source: Box<crate::association::client::Error>,
    },

    /// failed to write data set fragments
    WriteFragments {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not open data set file {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read data set file {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("file {} is not a valid DICOM file", path.display()))]
    NotDicom { path: PathBuf, backtrace: Backtrace },

    /// could not read the file meta group
    ReadFileMeta {
        #[snafu(source(from(dicom_object::meta::Error, Box::from)))]
        source: Box<dicom_object::meta::Error>,
    },

    /// the send was cancelled between fragments
    Cancelled { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where the data set bytes of an outbound message come from.
#[derive(Debug)]
pub enum DatasetSource {
    /// the command has no data set
    None,
    /// data set bytes already encoded in the negotiated transfer syntax
    Mem(Vec<u8>),
    /// a DICOM file whose data set portion is streamed as is,
    /// skipping the preamble and file meta group
    File(PathBuf),
}

/// Send one DIMSE message over the association:
/// the command set, then the data set, if any.
///
/// The cancel flag is observed between data set fragments;
/// raising it mid-stream fails with [`Error::Cancelled`],
/// after which the association must be torn down
/// (the message cannot be resumed).
pub fn send_dimse(
    association: &mut ClientAssociation,
    presentation_context_id: u8,
    command: &CommandSet,
    data_set: DatasetSource,
    cancel: Option<&AtomicBool>,
    monitor: &mut dyn TransferMonitor,
) -> Result<()> {
    let mut cmd_data = Vec::with_capacity(128);
    command
        .write_to(&mut cmd_data)
        .map_err(Box::from)
        .context(EncodeCommandSnafu)?;

    let estimated_data_set_length = match &data_set {
        DatasetSource::None => 0,
        DatasetSource::Mem(data) => data.len() as u64,
        DatasetSource::File(path) => std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or_default(),
    };

    let mut progress = TransferProgress {
        presentation_context_id,
        bytes_transferred: 0,
        estimated_command_length: cmd_data.len() as u64,
        estimated_data_set_length,
    };
    monitor.on_send_begin(&progress);

    let single_pdu_limit = effective_max_pdu(association).saturating_sub(SINGLE_PDU_HEADROOM) as usize;

    match data_set {
        DatasetSource::None => {
            let cmd_len = cmd_data.len() as u64;
            association
                .send(&command_pdu(presentation_context_id, cmd_data))
                .map_err(Box::from)
                .context(SendSnafu)?;
            progress.bytes_transferred += cmd_len;
            monitor.on_send_progress(&progress);
        }
        DatasetSource::Mem(object_data) if cmd_data.len() + object_data.len() < single_pdu_limit => {
            // small enough for one PDU carrying both streams
            let total = (cmd_data.len() + object_data.len()) as u64;
            let pdu = Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: cmd_data,
                    },
                    PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: object_data,
                    },
                ],
            };
            association.send(&pdu).map_err(Box::from).context(SendSnafu)?;
            progress.bytes_transferred += total;
            monitor.on_send_progress(&progress);
        }
        DatasetSource::Mem(object_data) => {
            let cmd_len = cmd_data.len() as u64;
            association
                .send(&command_pdu(presentation_context_id, cmd_data))
                .map_err(Box::from)
                .context(SendSnafu)?;
            progress.bytes_transferred += cmd_len;
            monitor.on_send_progress(&progress);

            stream_fragments(
                association,
                presentation_context_id,
                &mut &object_data[..],
                cancel,
                monitor,
                &mut progress,
            )?;
        }
        DatasetSource::File(path) => {
            let mut reader = open_data_set(&path)?;
            // the file length counted the head we just skipped
            let skipped = reader
                .stream_position()
                .context(ReadFileSnafu { path: path.clone() })?;
            progress.estimated_data_set_length =
                progress.estimated_data_set_length.saturating_sub(skipped);

            let cmd_len = cmd_data.len() as u64;
            association
                .send(&command_pdu(presentation_context_id, cmd_data))
                .map_err(Box::from)
                .context(SendSnafu)?;
            progress.bytes_transferred += cmd_len;
            monitor.on_send_progress(&progress);

            debug!(
                "streaming data set from {} ({} bytes)",
                path.display(),
                progress.estimated_data_set_length
            );
            stream_fragments(
                association,
                presentation_context_id,
                &mut reader,
                cancel,
                monitor,
                &mut progress,
            )?;
        }
    }

    monitor.on_send_complete(&progress);
    Ok(())
}

/// The PDU length actually driving fragmentation:
/// an unbounded peer maximum falls back to a conservative cap.
fn effective_max_pdu(association: &ClientAssociation) -> u32 {
    match association.acceptor_max_pdu_length() {
        0 => DEFAULT_MAX_PDU,
        n => n,
    }
}

fn command_pdu(presentation_context_id: u8, cmd_data: Vec<u8>) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: cmd_data,
        }],
    }
}

/// Push data set bytes through the P-Data fragmenter,
/// checking the cancel flag and reporting progress
/// once per fragment-sized chunk.
fn stream_fragments<R: Read>(
    association: &mut ClientAssociation,
    presentation_context_id: u8,
    reader: &mut R,
    cancel: Option<&AtomicBool>,
    monitor: &mut dyn TransferMonitor,
    progress: &mut TransferProgress,
) -> Result<()> {
    let chunk_len =
        effective_max_pdu(association).saturating_sub(crate::pdu::PDU_HEADER_SIZE) as usize;
    let mut chunk = vec![0u8; chunk_len.max(1024)];

    let mut writer = association.send_pdata(presentation_context_id);
    loop {
        if let Some(cancel) = cancel {
            ensure!(!cancel.load(Ordering::Relaxed), CancelledSnafu);
        }
        let n = read_up_to(reader, &mut chunk).context(WriteFragmentsSnafu)?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).context(WriteFragmentsSnafu)?;
        progress.bytes_transferred += n as u64;
        monitor.on_send_progress(progress);
    }
    writer.finish().context(WriteFragmentsSnafu)?;
    Ok(())
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Open a DICOM file and position the reader at the start
/// of its data set, past the preamble and file meta group.
fn open_data_set(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|_| OpenFileSnafu {
        path: path.to_path_buf(),
    })?;
    let mut reader = BufReader::new(file);

    // the 128-byte preamble is optional; detect it by the magic code
    let mut head = [0u8; 132];
    reader
        .read_exact(&mut head)
        .with_context(|_| ReadFileSnafu {
            path: path.to_path_buf(),
        })?;
    let meta_start = if &head[128..132] == b"DICM" {
        128
    } else if &head[0..4] == b"DICM" {
        0
    } else {
        return NotDicomSnafu {
            path: path.to_path_buf(),
        }
        .fail();
    };
    reader
        .seek(std::io::SeekFrom::Start(meta_start))
        .with_context(|_| ReadFileSnafu {
            path: path.to_path_buf(),
        })?;

    // consumes the magic code and the whole meta group
    FileMetaTable::from_reader(&mut reader).context(ReadFileMetaSnafu)?;
    Ok(reader)
}
