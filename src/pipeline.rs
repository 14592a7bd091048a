//! A synchronous driver that runs one stage over a byte stream.
//!
//! [`Pipeline`] follows the sans-I/O style: it never blocks and never spawns.
//! Bind it to any reliable, ordered stream that implements [`Read`] and
//! [`Write`] and pump bytes with [`read_wire`](Pipeline::read_wire) and
//! [`write_wire`](Pipeline::write_wire).
//!
//! ```text
//!   write_plaintext --> pre_encrypt --> encrypt --> *_encode --> write_wire
//!   read_plaintext <-- post_decrypt <-- decrypt <-- *_decode <-- read_wire
//! ```
use core::fmt::Debug;
use std::io::{self, ErrorKind, Read, Write};

use log::debug;

use crate::{config::EndpointType, error::Error, stage::Stage};

const READ_CHUNK_LEN: usize = 16 * 1024;

/// The symmetric cipher that sits between framing and the outer envelope.
///
/// The cipher is supplied by the application; this crate only calls it.
pub trait CipherLayer: Debug + Send {
    /// Encrypts framed plaintext.
    fn encrypt(&mut self, buf: &[u8]) -> Vec<u8>;

    /// Decrypts ciphertext. Bytes may be buffered across calls.
    fn decrypt(&mut self, buf: &[u8]) -> Vec<u8>;
}

/// The identity cipher.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCipher;

impl CipherLayer for NoCipher {
    fn encrypt(&mut self, buf: &[u8]) -> Vec<u8> {
        buf.to_vec()
    }

    fn decrypt(&mut self, buf: &[u8]) -> Vec<u8> {
        buf.to_vec()
    }
}

/// One configured stage bound to one side of a connection.
#[derive(Debug)]
pub struct Pipeline {
    stage: Box<dyn Stage>,
    side: EndpointType,
    cipher: Box<dyn CipherLayer>,
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    outgoing: Vec<u8>,
    outgoing_pos: usize,
}

impl Pipeline {
    /// Creates a pipeline without a cipher.
    ///
    /// `stage` must already be configured with
    /// [`Stage::set_server_info`].
    pub fn new(stage: Box<dyn Stage>, side: EndpointType) -> Self {
        Self::with_cipher(stage, side, Box::new(NoCipher))
    }

    /// Creates a pipeline that encrypts with `cipher`.
    pub fn with_cipher(
        stage: Box<dyn Stage>,
        side: EndpointType,
        cipher: Box<dyn CipherLayer>,
    ) -> Self {
        Self {
            stage,
            side,
            cipher,
            plaintext: Vec::new(),
            plaintext_pos: 0,
            outgoing: Vec::new(),
            outgoing_pos: 0,
        }
    }

    /// The driven stage.
    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    /// The side this pipeline runs on.
    pub fn side(&self) -> EndpointType {
        self.side
    }

    /// Processes bytes received from the peer.
    ///
    /// # Errors
    ///
    /// Returns the error of [`Stage::post_decrypt`]. If the server side
    /// falls back to raw passthrough on the first frame,
    /// [`Error::ProtocolMismatch`] is returned instead of the `b"E"` marker.
    pub fn feed_wire(&mut self, wire: &[u8]) -> Result<(), Error> {
        let ciphertext = match self.side {
            EndpointType::Client => self.stage.client_decode(wire).data,
            EndpointType::Server => {
                let decoded = self.stage.server_decode(wire);
                if decoded.need_feedback {
                    let feedback = self.stage.server_encode(&[]);
                    self.queue_outgoing(&feedback);
                }
                decoded.data
            }
        };
        if ciphertext.is_empty() {
            return Ok(());
        }

        let was_passthrough = self.stage.is_passthrough();
        let decrypted = self.cipher.decrypt(&ciphertext);
        let plaintext = self.stage.post_decrypt(self.side, &decrypted)?;
        if !was_passthrough && self.stage.is_passthrough() {
            debug!(target: "verifywire", "peer does not speak {}", self.stage.name());
            return Err(Error::ProtocolMismatch);
        }

        if self.plaintext_pos == self.plaintext.len() {
            self.plaintext.clear();
            self.plaintext_pos = 0;
        }
        self.plaintext.extend_from_slice(&plaintext);
        Ok(())
    }

    /// Reads once from `rd` and processes what was read.
    ///
    /// Returns the number of wire bytes read; `Ok(0)` means EOF.
    ///
    /// # Errors
    ///
    /// I/O errors of `rd` are returned as is. Stage errors are wrapped in an
    /// [`io::Error`] of kind [`ErrorKind::Other`] carrying an [`Error`].
    pub fn read_wire(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        let mut buf = [0u8; READ_CHUNK_LEN];
        let n = rd.read(&mut buf)?;
        if n > 0 {
            self.feed_wire(&buf[..n])?;
        }
        Ok(n)
    }

    /// Copies decoded plaintext into `buf` and returns its length.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> usize {
        let pending = &self.plaintext[self.plaintext_pos..];
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.plaintext_pos += n;
        n
    }

    /// The number of decoded plaintext bytes not read yet.
    pub fn plaintext_len(&self) -> usize {
        self.plaintext.len() - self.plaintext_pos
    }

    /// Frames, encrypts and wraps `buf`, queueing it for
    /// [`write_wire`](Self::write_wire).
    pub fn write_plaintext(&mut self, buf: &[u8]) {
        let framed = self.stage.pre_encrypt(self.side, buf);
        if framed.is_empty() {
            return;
        }
        let ciphertext = self.cipher.encrypt(&framed);
        let wire = match self.side {
            EndpointType::Client => self.stage.client_encode(&ciphertext),
            EndpointType::Server => self.stage.server_encode(&ciphertext),
        };
        self.queue_outgoing(&wire);
    }

    /// Writes queued bytes to `wr` until the queue is empty.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Errors of `wr` (including [`ErrorKind::WouldBlock`]) are returned as
    /// is; bytes already written are not written again on the next call.
    pub fn write_wire(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        let mut written = 0;
        while self.outgoing_pos < self.outgoing.len() {
            match wr.write(&self.outgoing[self.outgoing_pos..])? {
                0 => return Err(ErrorKind::WriteZero.into()),
                n => {
                    self.outgoing_pos += n;
                    written += n;
                }
            }
        }
        self.outgoing.clear();
        self.outgoing_pos = 0;
        Ok(written)
    }

    /// Returns `true` if bytes are waiting for [`write_wire`](Self::write_wire).
    pub fn wants_write(&self) -> bool {
        self.outgoing_pos < self.outgoing.len()
    }

    fn queue_outgoing(&mut self, wire: &[u8]) {
        if !self.wants_write() {
            self.outgoing.clear();
            self.outgoing_pos = 0;
        }
        self.outgoing.extend_from_slice(wire);
    }
}
