use std::io::Write;

use crate::pdu::DEFAULT_MAX_PDU;

/// A P-Data value writer for data set fragments.
///
/// This exposes an API to iteratively construct and send data set bytes
/// to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one.
///
/// Call [`finish`](PDataWriter::finish) to flush the trailing fragment
/// with the last-fragment mark;
/// dropping the writer finishes it implicitly, discarding errors.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    presentation_context_id: u8,
    max_data_length: u32,
    /// number of P-DATA-TF PDUs flushed so far
    pdus_sent: u64,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// A `max_pdu_length` of zero means the peer did not bound the PDU
    /// length, in which case a conservative internal cap is applied.
    /// Values below the minimum of the standard are brought up to it.
    pub fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        let max_pdu_length = if max_pdu_length == 0 {
            DEFAULT_MAX_PDU
        } else {
            max_pdu_length.max(crate::pdu::MINIMUM_PDU_SIZE)
        };
        let max_data_length = calculate_max_data_len_single(max_pdu_length);
        PDataWriter {
            stream,
            presentation_context_id,
            max_data_length,
            buffer: Vec::with_capacity(max_data_length as usize),
            pdus_sent: 0,
            finished: false,
        }
    }

    /// The number of whole PDUs written to the stream so far.
    pub fn pdus_sent(&self) -> u64 {
        self.pdus_sent
    }

    /// Send the header of a single P-Data PDU,
    /// containing a single data set fragment of the given length.
    fn send_pdata_header(&mut self, data_len: u32, is_last: bool) -> std::io::Result<()> {
        let mut message_header = 0x00;
        if is_last {
            message_header |= 0x02;
        }

        let pdu_len_bytes = (data_len + 2 + 4).to_be_bytes();
        let data_len_bytes = (data_len + 2).to_be_bytes();
        let header = [
            // PDU type + reserved byte
            0x04,
            0x00,
            // full PDU length
            pdu_len_bytes[0],
            pdu_len_bytes[1],
            pdu_len_bytes[2],
            pdu_len_bytes[3],
            // presentation data item length (data + the 2 bytes below)
            data_len_bytes[0],
            data_len_bytes[1],
            data_len_bytes[2],
            data_len_bytes[3],
            // presentation context id
            self.presentation_context_id,
            // message control header
            message_header,
        ];

        self.stream.write_all(&header)
    }

    /// Flush the remaining bytes in a final PDU
    /// with the last-fragment mark set.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.dispatch_excess_data()?;
        // the last fragment must always be sent,
        // even if there are no bytes left for it
        self.send_pdata_header(self.buffer.len() as u32, true)?;
        self.stream.write_all(&self.buffer[..])?;
        self.buffer.clear();
        self.pdus_sent += 1;
        self.finished = true;
        Ok(())
    }

    fn dispatch_excess_data(&mut self) -> std::io::Result<()> {
        while self.buffer.len() > self.max_data_length as usize {
            self.send_pdata_header(self.max_data_length, false)?;
            self.stream
                .write_all(&self.buffer[..self.max_data_length as usize])?;
            self.buffer.drain(..self.max_data_length as usize);
            self.pdus_sent += 1;
        }
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend(buf);
        self.dispatch_excess_data()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // deliberately kept,
        // a proper flush only happens on `finish`
        Ok(())
    }
}

impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Determine the maximum length of actual data set bytes
/// within a PDU of the given maximum length:
/// the 4 bytes of item length and the 2 control bytes are overhead.
#[inline]
fn calculate_max_data_len_single(pdu_len: u32) -> u32 {
    pdu_len - 4 - 2
}
