//! Transport session module.
//!
//! A [`Transport`] owns one TCP connection to a DICOM node
//! and moves whole PDUs across it,
//! enforcing the connect, socket and DIMSE deadlines
//! and optionally throttling the outbound byte rate.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::trace;

use crate::pdu::{
    self, read_pdu, write_pdu, Pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
    PDU_HEADER_SIZE,
};

/// How often the receive loop wakes up to check for inbound bytes
/// and for the idle deadline.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not resolve the target address
    Resolve {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("no address resolved for the target node"))]
    NoAddress { backtrace: Backtrace },

    /// could not connect to the target node
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not configure the socket
    ConfigureSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not send PDU bytes
    WriteSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not receive PDU bytes
    ReadSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// connection closed by the peer
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("no data set fragment received for {:?}", elapsed))]
    DimseTimeout {
        elapsed: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("no socket activity for {:?} in the middle of a PDU", elapsed))]
    SocketTimeout {
        elapsed: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU of {} bytes exceeds the absolute maximum of {}",
        pdu_length,
        MAXIMUM_PDU_SIZE
    ))]
    PduTooLarge {
        pdu_length: u32,
        backtrace: Backtrace,
    },

    /// failed to decode incoming PDU
    DecodePdu {
        #[snafu(backtrace)]
        source: pdu::reader::Error,
    },

    /// failed to encode outgoing PDU
    EncodePdu {
        #[snafu(backtrace)]
        source: pdu::writer::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Deadlines and pacing applied to a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// bound on the TCP handshake
    pub connect_timeout: Duration,
    /// bound on any single socket send,
    /// and on receive progress in the middle of a PDU
    pub socket_timeout: Duration,
    /// bound on the idle gap between inbound PDUs;
    /// zero disables the deadline
    pub dimse_timeout: Duration,
    /// outbound bytes per second; zero means unthrottled
    pub throttle_bytes_per_sec: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(30),
            dimse_timeout: Duration::from_secs(180),
            throttle_bytes_per_sec: 0,
        }
    }
}

/// A handle that can force a transport closed from another thread,
/// tearing down both directions of the underlying socket.
#[derive(Debug)]
pub struct ShutdownHandle(TcpStream);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// A single TCP session speaking the upper layer protocol.
///
/// Outbound PDUs are serialized in full before hitting the socket.
/// Inbound bytes are collected in an internal buffer
/// until a whole PDU is available.
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    read_buf: BytesMut,
    options: TransportOptions,
    /// cap on inbound PDU lengths, from our side of the negotiation
    max_pdu_length: u32,
    strict: bool,
}

impl Transport {
    /// Open a connection to the given address,
    /// bounded by the configured connect timeout.
    pub fn connect<A: ToSocketAddrs>(address: A, options: &TransportOptions) -> Result<Self> {
        let addresses: Vec<SocketAddr> =
            address.to_socket_addrs().context(ResolveSnafu)?.collect();
        ensure!(!addresses.is_empty(), NoAddressSnafu);

        let mut last_err = None;
        for addr in &addresses {
            let r = if options.connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(addr, options.connect_timeout)
            };
            match r {
                Ok(stream) => return Self::from_stream(stream, options),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e).context(ConnectSnafu),
            None => NoAddressSnafu.fail(),
        }
    }

    /// Wrap an already connected stream into a transport session.
    pub fn from_stream(stream: TcpStream, options: &TransportOptions) -> Result<Self> {
        stream.set_nodelay(true).context(ConfigureSocketSnafu)?;
        stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .context(ConfigureSocketSnafu)?;
        stream
            .set_write_timeout(duration_opt(options.socket_timeout))
            .context(ConfigureSocketSnafu)?;

        Ok(Transport {
            stream,
            read_buf: BytesMut::with_capacity(DEFAULT_MAX_PDU as usize),
            options: options.clone(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: false,
        })
    }

    /// Set the maximum inbound PDU length used to validate incoming data,
    /// clamped to the bounds of the standard.
    pub fn set_max_pdu_length(&mut self, max_pdu_length: u32) {
        self.max_pdu_length = max_pdu_length.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE);
    }

    /// Enforce (or stop enforcing) the negotiated maximum
    /// on incoming PDU lengths.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Obtain a handle with which another thread can force this session
    /// closed.
    pub fn shutdown_handle(&self) -> std::io::Result<ShutdownHandle> {
        Ok(ShutdownHandle(self.stream.try_clone()?))
    }

    /// Serialize and send a single PDU.
    ///
    /// Sending blocks the calling thread,
    /// so the inbound idle deadline cannot fire
    /// while a long data set is being written out.
    pub fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let mut bytes = Vec::with_capacity(DEFAULT_MAX_PDU as usize);
        write_pdu(&mut bytes, pdu).context(EncodePduSnafu)?;
        trace!("-> {} ({} bytes)", pdu.short_description(), bytes.len());
        self.write_throttled(&bytes)?;
        Ok(())
    }

    /// Receive a single whole PDU.
    ///
    /// The socket is polled every [`READ_POLL_INTERVAL`].
    /// While waiting for the first byte of a PDU,
    /// the idle gap is bounded by the DIMSE timeout;
    /// once a PDU has started, progress is bounded by the socket timeout.
    pub fn recv_pdu(&mut self) -> Result<Pdu> {
        let mut last_progress = Instant::now();
        loop {
            if let Some(pdu) = self.try_decode()? {
                trace!("<- {}", pdu.short_description());
                return Ok(pdu);
            }

            let mut chunk = [0u8; 8192];
            match self.stream.read(&mut chunk) {
                Ok(0) => return ConnectionClosedSnafu.fail(),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    last_progress = Instant::now();
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    let elapsed = last_progress.elapsed();
                    if self.read_buf.is_empty() {
                        if !self.options.dimse_timeout.is_zero()
                            && elapsed >= self.options.dimse_timeout
                        {
                            return DimseTimeoutSnafu { elapsed }.fail();
                        }
                    } else if !self.options.socket_timeout.is_zero()
                        && elapsed >= self.options.socket_timeout
                    {
                        return SocketTimeoutSnafu { elapsed }.fail();
                    }
                }
                Err(e) => return Err(e).context(ReadSocketSnafu),
            }
        }
    }

    /// Close both directions of the connection. Idempotent.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn try_decode(&mut self) -> Result<Option<Pdu>> {
        if self.read_buf.len() < PDU_HEADER_SIZE as usize {
            return Ok(None);
        }
        let pdu_length = u32::from_be_bytes([
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
            self.read_buf[5],
        ]);
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu { pdu_length }
        );

        let frame_length = PDU_HEADER_SIZE as usize + pdu_length as usize;
        if self.read_buf.len() < frame_length {
            return Ok(None);
        }

        let frame = self.read_buf.split_to(frame_length);
        let mut bytes = frame.chunk();
        let pdu = read_pdu(&mut bytes, self.max_pdu_length, self.strict).context(DecodePduSnafu)?;
        Ok(Some(pdu))
    }

    fn write_throttled(&mut self, bytes: &[u8]) -> Result<()> {
        let rate = self.options.throttle_bytes_per_sec;
        if rate == 0 {
            return self.stream.write_all(bytes).context(WriteSocketSnafu);
        }

        // pace the stream in small slices,
        // sleeping for the time each slice is worth
        const SLICE: usize = 8_192;
        for piece in bytes.chunks(SLICE) {
            self.stream.write_all(piece).context(WriteSocketSnafu)?;
            let pause = Duration::from_secs_f64(piece.len() as f64 / rate as f64);
            std::thread::sleep(pause);
        }
        Ok(())
    }
}

/// Raw writes go through the same throttled path as whole PDUs,
/// which lets the P-Data fragmenter write directly to the session.
impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_throttled(buf)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

fn duration_opt(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;

    use super::{Transport, TransportOptions};
    use crate::pdu::{write_pdu, Pdu};

    #[test]
    fn receives_a_pdu_split_across_writes() {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let h = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut bytes = Vec::new();
            write_pdu(&mut bytes, &Pdu::ReleaseRQ).unwrap();
            let (head, tail) = bytes.split_at(3);
            stream.write_all(head).unwrap();
            stream.flush().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            stream.write_all(tail).unwrap();
        });

        let options = TransportOptions::default();
        let mut transport = Transport::connect(addr, &options).unwrap();
        let pdu = transport.recv_pdu().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);

        h.join().unwrap();
    }
}
