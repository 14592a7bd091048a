use log::debug;

use crate::{
    codec::FrameCodec,
    config::EndpointType,
    error::{Error, IntegrityFailure},
    specification::{ERROR_MARKER, LEN_FIELD_LEN},
};

/// Inspects the payload of every verified frame before it is delivered.
pub(crate) trait PayloadGuard {
    /// Returns how many leading bytes of `payload` to strip, or an error that
    /// makes the receiver fall back to raw passthrough.
    fn check(&mut self, payload: &[u8]) -> Result<usize, Error>;

    /// Called once per `post_decrypt` call that delivered any bytes.
    fn delivered(&mut self) {}
}

/// Accepts every payload unchanged.
#[derive(Debug, Default)]
pub(crate) struct NoGuard;

impl PayloadGuard for NoGuard {
    fn check(&mut self, _payload: &[u8]) -> Result<usize, Error> {
        Ok(0)
    }
}

/// Streaming de-framer shared by all framing stages.
///
/// State Transition Diagram
/// ```text
///
///          |
///          V
///   +-- Framing <--+
///   |      |       |
///   |      +-------+
///   |
///   +--> Passthrough
///
/// ```
///
/// `Passthrough` is terminal: the receive buffer is released and every
/// later call returns its input unchanged.
#[derive(Debug)]
pub(crate) struct FrameReceiver {
    state: ReadState,
    recv_buf: Vec<u8>,
    decoded_frames: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ReadState {
    Framing,
    Passthrough,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReceiver {
    pub(crate) fn new() -> Self {
        Self {
            state: ReadState::Framing,
            recv_buf: Vec::new(),
            decoded_frames: 0,
        }
    }

    pub(crate) fn is_passthrough(&self) -> bool {
        self.state == ReadState::Passthrough
    }

    /// Appends `buf` to the receive buffer and returns the payload of every
    /// complete frame buffered so far.
    pub(crate) fn post_decrypt<C, G>(
        &mut self,
        codec: &C,
        guard: &mut G,
        side: EndpointType,
        buf: &[u8],
    ) -> Result<Vec<u8>, Error>
    where
        C: FrameCodec,
        G: PayloadGuard,
    {
        if self.state == ReadState::Passthrough {
            return Ok(buf.to_vec());
        }
        self.recv_buf.extend_from_slice(buf);

        let mut out = Vec::new();
        let mut pos = 0;
        while self.recv_buf.len() - pos > LEN_FIELD_LEN {
            let frame_len =
                usize::from(u16::from_be_bytes([self.recv_buf[pos], self.recv_buf[pos + 1]]));
            if frame_len >= C::LEN_LIMIT {
                let err = IntegrityFailure::LengthOutOfRange {
                    received: frame_len as u16,
                };
                return self.fall_back(side, err.into());
            }
            if frame_len > self.recv_buf.len() - pos {
                break;
            }

            let verdict = codec
                .open(&self.recv_buf[pos..pos + frame_len])
                .map_err(Error::from)
                .and_then(|payload| {
                    let skip = guard.check(&payload)?.min(payload.len());
                    out.extend_from_slice(&payload[skip..]);
                    Ok(())
                });
            if let Err(err) = verdict {
                return self.fall_back(side, err);
            }
            pos += frame_len;
        }
        self.recv_buf.drain(..pos);

        if !out.is_empty() {
            self.decoded_frames += 1;
            guard.delivered();
        }
        Ok(out)
    }

    fn fall_back(&mut self, side: EndpointType, err: Error) -> Result<Vec<u8>, Error> {
        debug!(
            target: "verifywire",
            "{:?} side falls back to raw passthrough after {} frames: {}",
            side, self.decoded_frames, err
        );
        self.state = ReadState::Passthrough;
        self.recv_buf = Vec::new();

        if matches!(err, Error::AdmissionRejected(_)) || self.decoded_frames > 0 {
            return Err(err);
        }
        match side {
            EndpointType::Client => Err(Error::ProtocolMismatch),
            EndpointType::Server => Ok(vec![ERROR_MARKER]),
        }
    }
}
