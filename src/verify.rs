//! Integrity-checking stages.
//!
//! [`VerifySimple`] seals each chunk of plaintext into a CRC32-checked frame
//! with random padding; [`VerifyDeflate`] compresses each chunk instead.
//!
//! Both parse the inbound stream incrementally. The first frame that fails
//! verification switches the receiver to raw passthrough for the rest of
//! the connection.
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    codec::{CrcCodec, DeflateCodec, FrameCodec},
    config::{EndpointType, ServerInfo},
    error::Error,
    stage::{Stage, build_sub_stage},
    state_machine::{FrameReceiver, NoGuard},
};

/// CRC32-verified framing with random padding.
///
/// ```text
/// +-----+---------+---------+---------+--------+
/// | len | hdr_len | padding | payload | crc32  |
/// +-----+---------+---------+---------+--------+
/// |  2  |    1    |  0..15  |  ..8100 |   4    |
/// +-----+---------+---------+---------+--------+
/// ```
#[derive(Debug)]
pub struct VerifySimple {
    info: Option<ServerInfo>,
    sub_stage: Option<Box<dyn Stage>>,
    codec: CrcCodec,
    receiver: FrameReceiver,
}

impl Default for VerifySimple {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifySimple {
    /// Creates a stage whose padding is drawn from an OS-seeded generator.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Creates a stage with deterministic padding.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::with_rng(StdRng::from_seed(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            info: None,
            sub_stage: None,
            codec: CrcCodec::with_rng(rng),
            receiver: FrameReceiver::new(),
        }
    }
}

impl Stage for VerifySimple {
    fn name(&self) -> &'static str {
        "verify_simple"
    }

    fn set_server_info(&mut self, info: ServerInfo) {
        self.sub_stage = build_sub_stage(&info);
        self.info = Some(info);
    }

    fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    fn sub_stage_mut(&mut self) -> Option<&mut (dyn Stage + 'static)> {
        self.sub_stage.as_deref_mut()
    }

    fn pre_encrypt(&mut self, _side: EndpointType, buf: &[u8]) -> Vec<u8> {
        self.codec.seal_all(buf)
    }

    fn post_decrypt(&mut self, side: EndpointType, buf: &[u8]) -> Result<Vec<u8>, Error> {
        self.receiver.post_decrypt(&self.codec, &mut NoGuard, side, buf)
    }

    fn is_passthrough(&self) -> bool {
        self.receiver.is_passthrough()
    }
}

/// DEFLATE-compressed framing.
///
/// ```text
/// +-----+-----------------------------+
/// | len | zlib stream without header  |
/// +-----+-----------------------------+
/// |  2  |          len - 2            |
/// +-----+-----------------------------+
/// ```
#[derive(Debug, Default)]
pub struct VerifyDeflate {
    info: Option<ServerInfo>,
    sub_stage: Option<Box<dyn Stage>>,
    codec: DeflateCodec,
    receiver: FrameReceiver,
}

impl VerifyDeflate {
    /// Creates a compressing stage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for VerifyDeflate {
    fn name(&self) -> &'static str {
        "verify_deflate"
    }

    fn set_server_info(&mut self, info: ServerInfo) {
        self.sub_stage = build_sub_stage(&info);
        self.info = Some(info);
    }

    fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    fn sub_stage_mut(&mut self) -> Option<&mut (dyn Stage + 'static)> {
        self.sub_stage.as_deref_mut()
    }

    fn pre_encrypt(&mut self, _side: EndpointType, buf: &[u8]) -> Vec<u8> {
        self.codec.seal_all(buf)
    }

    fn post_decrypt(&mut self, side: EndpointType, buf: &[u8]) -> Result<Vec<u8>, Error> {
        self.receiver.post_decrypt(&self.codec, &mut NoGuard, side, buf)
    }

    fn is_passthrough(&self) -> bool {
        self.receiver.is_passthrough()
    }
}
