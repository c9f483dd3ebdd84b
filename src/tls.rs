//! Per-connection transport: plain TCP or TLS-terminated TCP.
//!
//! A TLS-capable listener still serves plaintext clients: the first byte of
//! a new connection is sniffed, and anything other than 0x16 (the TLS
//! handshake record type) permanently disables the engine for that
//! connection, forwarding bytes through the plain path. rustls drives the
//! handshake and steady-state record processing from the same feed loop.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;

use mio::net::TcpStream;
use rustls::ServerConnection;

use crate::accumulator::RecvAccumulator;
use crate::error::{Error, Result};

/// First byte of every TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Outcome of one socket read attempt.
pub(crate) enum ReadStep {
    /// `raw` ciphertext-or-plaintext bytes were pulled off the socket.
    /// Decrypted application bytes (possibly zero during a handshake) were
    /// appended to the accumulator.
    Data { raw: usize },
    WouldBlock,
    PeerClosed,
}

pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(TlsChannel),
}

impl Transport {
    pub fn read_step(&mut self, scratch: &mut [u8], acc: &mut RecvAccumulator) -> Result<ReadStep> {
        match self {
            Transport::Plain(stream) => {
                let step = raw_read(stream, scratch)?;
                if let ReadStep::Data { raw } = step {
                    acc.append(&scratch[..raw]);
                }
                Ok(step)
            }
            Transport::Tls(channel) => channel.read_step(scratch, acc),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => write_all_nonblocking(stream, data),
            Transport::Tls(channel) => channel.write(data),
        }
    }

    /// Whether this connection is actually speaking TLS (enabled and not
    /// sniffed down to plaintext).
    pub fn is_tls(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(channel) => !channel.disabled,
        }
    }

    /// The ALPN protocol negotiated during the handshake, if any.
    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(channel) if channel.disabled => None,
            Transport::Tls(channel) => channel.session.alpn_protocol().map(|p| p.to_vec()),
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(channel) => &mut channel.stream,
        }
    }

    /// Terminate the connection: close_notify for active TLS sessions, then
    /// a full socket shutdown. Best effort on an already-dead peer.
    pub fn shutdown(&mut self) {
        if let Transport::Tls(channel) = self
            && !channel.disabled
        {
            channel.session.send_close_notify();
            let _ = channel.flush_tls_output();
        }
        let _ = self.stream_mut().shutdown(std::net::Shutdown::Both);
    }
}

pub(crate) struct TlsChannel {
    stream: TcpStream,
    session: ServerConnection,
    /// Scratch for draining decrypted plaintext out of the engine.
    plain_buf: Vec<u8>,
    /// Plaintext is wrapped in chunks of this size on the write path.
    write_chunk: usize,
    sniffed: bool,
    disabled: bool,
    handshaken: bool,
    log_tls_errors: bool,
}

impl TlsChannel {
    pub fn new(
        stream: TcpStream,
        config: Arc<rustls::ServerConfig>,
        read_buffer_size: usize,
        write_buffer_size: usize,
        log_tls_errors: bool,
    ) -> Result<Self> {
        let session =
            ServerConnection::new(config).map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(TlsChannel {
            stream,
            session,
            plain_buf: vec![0u8; read_buffer_size],
            write_chunk: write_buffer_size,
            sniffed: false,
            disabled: false,
            handshaken: false,
            log_tls_errors,
        })
    }

    fn read_step(&mut self, scratch: &mut [u8], acc: &mut RecvAccumulator) -> Result<ReadStep> {
        let step = raw_read(&mut self.stream, scratch)?;
        let ReadStep::Data { raw } = step else {
            return Ok(step);
        };
        if !self.sniffed {
            self.sniffed = true;
            if scratch[0] != TLS_HANDSHAKE_RECORD {
                // Plaintext client on a TLS listener: disable the engine for
                // the connection's lifetime and pass bytes through untouched.
                self.disabled = true;
            }
        }
        if self.disabled {
            acc.append(&scratch[..raw]);
            return Ok(ReadStep::Data { raw });
        }
        if self.feed(&scratch[..raw], acc)? {
            return Ok(ReadStep::PeerClosed);
        }
        Ok(ReadStep::Data { raw })
    }

    /// Feed ciphertext into the engine, drain decrypted plaintext into the
    /// accumulator, and flush any pending TLS output (handshake records,
    /// alerts). Returns true when the peer sent close_notify.
    fn feed(&mut self, mut chunk: &[u8], acc: &mut RecvAccumulator) -> Result<bool> {
        while !chunk.is_empty() {
            let fed = self.session.read_tls(&mut chunk)?;
            if fed == 0 {
                break;
            }
            let state = match self.session.process_new_packets() {
                Ok(state) => state,
                Err(err) => {
                    // Push out the alert record before deciding anything.
                    let _ = self.flush_tls_output();
                    if !self.handshaken {
                        // Handshake failures are swallowed and the handshake
                        // marked finished; the connection dies on its own if
                        // the peer gives up. See DESIGN.md.
                        if self.log_tls_errors {
                            log::warn!("tls handshake failed: {err}");
                        }
                        self.handshaken = true;
                        return Ok(false);
                    }
                    return Err(Error::Encryption(err.to_string()));
                }
            };
            if state.plaintext_bytes_to_read() > 0 {
                loop {
                    match self.session.reader().read(&mut self.plain_buf) {
                        Ok(0) => break,
                        Ok(n) => acc.append(&self.plain_buf[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                }
            }
            self.flush_tls_output()?;
            if !self.handshaken && !self.session.is_handshaking() {
                self.handshaken = true;
                log::debug!(
                    "tls handshake complete, alpn {:?}",
                    self.session.alpn_protocol()
                );
            }
            if state.peer_has_closed() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.disabled {
            return write_all_nonblocking(&mut self.stream, data);
        }
        // Wrap in bounded chunks so engine-side buffering stays at the
        // configured write buffer size even for large messages.
        for chunk in data.chunks(self.write_chunk.max(1)) {
            self.session
                .writer()
                .write_all(chunk)
                .map_err(|e| Error::Encryption(e.to_string()))?;
            self.flush_tls_output()?;
        }
        Ok(())
    }

    fn flush_tls_output(&mut self) -> Result<()> {
        while self.session.wants_write() {
            self.session
                .write_tls(&mut DrainWrite(&mut self.stream))
                .map_err(Error::Io)?;
        }
        Ok(())
    }
}

/// One non-blocking read attempt, retrying only on EINTR.
fn raw_read(stream: &mut TcpStream, scratch: &mut [u8]) -> Result<ReadStep> {
    loop {
        match stream.read(scratch) {
            Ok(0) => return Ok(ReadStep::PeerClosed),
            Ok(n) => return Ok(ReadStep::Data { raw: n }),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStep::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drain a whole buffer into a non-blocking socket, yielding while the
/// kernel send buffer is full.
fn write_all_nonblocking(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    let mut off = 0;
    while off < data.len() {
        match stream.write(&data[off..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => off += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// `io::Write` adapter giving rustls a sink that rides out `WouldBlock`.
struct DrainWrite<'a>(&'a mut TcpStream);

impl Write for DrainWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.0.write(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
