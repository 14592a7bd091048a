use std::borrow::Cow;

use miniz_oxide::{deflate::compress_to_vec_zlib, inflate::decompress_to_vec_zlib_with_limit};
use rand::{Rng, rngs::StdRng};

use crate::{
    error::IntegrityFailure,
    specification::{
        CRC_FRAME_MIN_LEN, CRC_LEN_LIMIT, CRC_PAD_MAX_LEN, CRC_RESIDUE, CRC_TRAILER_LEN,
        CRC_UNIT_LEN, DEFLATE_FRAME_MIN_LEN, DEFLATE_LEN_LIMIT, DEFLATE_MAX_OUTPUT,
        DEFLATE_UNIT_LEN, LEN_FIELD_LEN, ZLIB_HEADER,
    },
};

const DEFLATE_LEVEL: u8 = 6;

/// A length-prefixed frame format.
///
/// Every frame starts with its total length as a big-endian `u16`.
pub(crate) trait FrameCodec: core::fmt::Debug + Send {
    /// The largest payload packed into one frame.
    const UNIT_LEN: usize;

    /// Any `len` field at or above this value is invalid.
    const LEN_LIMIT: usize;

    /// Appends one frame carrying `payload` to `out`. Empty payloads produce
    /// no frame.
    fn seal(&mut self, payload: &[u8], out: &mut Vec<u8>);

    /// Verifies a complete frame (including its `len` field) and returns
    /// its payload.
    fn open<'a>(&self, frame: &'a [u8]) -> Result<Cow<'a, [u8]>, IntegrityFailure>;

    /// Splits `buf` into `UNIT_LEN` chunks and seals each of them in order.
    fn seal_all(&mut self, buf: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(buf.len() + buf.len() / 64 + 32);
        for chunk in buf.chunks(Self::UNIT_LEN) {
            self.seal(chunk, &mut out);
        }
        out
    }
}

/// CRC32-verified frames with random padding.
#[derive(Debug)]
pub(crate) struct CrcCodec {
    rng: StdRng,
}

impl CrcCodec {
    pub(crate) fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }
}

impl FrameCodec for CrcCodec {
    const UNIT_LEN: usize = CRC_UNIT_LEN;
    const LEN_LIMIT: usize = CRC_LEN_LIMIT;

    fn seal(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        debug_assert!(payload.len() <= Self::UNIT_LEN);

        let pad_len = usize::from(self.rng.random::<u8>()) % (CRC_PAD_MAX_LEN + 1);
        let frame_len = LEN_FIELD_LEN + 1 + pad_len + payload.len() + CRC_TRAILER_LEN;

        let start = out.len();
        out.extend_from_slice(&(frame_len as u16).to_be_bytes());
        out.push(pad_len as u8 + 1);
        let pad_pos = out.len();
        out.resize(pad_pos + pad_len, 0);
        self.rng.fill(&mut out[pad_pos..]);
        out.extend_from_slice(payload);

        let crc = CRC_RESIDUE - crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
    }

    fn open<'a>(&self, frame: &'a [u8]) -> Result<Cow<'a, [u8]>, IntegrityFailure> {
        let frame_len = frame.len();
        if frame_len < CRC_FRAME_MIN_LEN {
            return Err(IntegrityFailure::FrameTooShort {
                received: frame_len as u16,
            });
        }

        // The trailer makes the CRC32 of a whole intact frame a constant.
        if crc32fast::hash(frame) != CRC_RESIDUE {
            return Err(IntegrityFailure::ChecksumMismatch);
        }

        let hdr_len = frame[LEN_FIELD_LEN];
        let payload_pos = LEN_FIELD_LEN + usize::from(hdr_len);
        let payload_end = frame_len - CRC_TRAILER_LEN;
        if hdr_len == 0 || payload_pos > payload_end {
            return Err(IntegrityFailure::HeaderLenInvalid { received: hdr_len });
        }
        Ok(Cow::Borrowed(&frame[payload_pos..payload_end]))
    }
}

/// DEFLATE-compressed frames.
#[derive(Debug, Default)]
pub(crate) struct DeflateCodec;

impl FrameCodec for DeflateCodec {
    const UNIT_LEN: usize = DEFLATE_UNIT_LEN;
    const LEN_LIMIT: usize = DEFLATE_LEN_LIMIT;

    fn seal(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        debug_assert!(payload.len() <= Self::UNIT_LEN);

        // The zlib header is replaced by the length of the whole zlib stream.
        let stream = compress_to_vec_zlib(payload, DEFLATE_LEVEL);
        out.extend_from_slice(&(stream.len() as u16).to_be_bytes());
        out.extend_from_slice(&stream[ZLIB_HEADER.len()..]);
    }

    fn open<'a>(&self, frame: &'a [u8]) -> Result<Cow<'a, [u8]>, IntegrityFailure> {
        if frame.len() < DEFLATE_FRAME_MIN_LEN {
            return Err(IntegrityFailure::FrameTooShort {
                received: frame.len() as u16,
            });
        }
        let mut stream = Vec::with_capacity(frame.len());
        stream.extend_from_slice(&ZLIB_HEADER);
        stream.extend_from_slice(&frame[LEN_FIELD_LEN..]);
        decompress_to_vec_zlib_with_limit(&stream, DEFLATE_MAX_OUTPUT)
            .map(Cow::Owned)
            .map_err(|_| IntegrityFailure::InflateFailed)
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;

    fn crc_codec() -> CrcCodec {
        CrcCodec::with_rng(StdRng::from_seed([0u8; 32]))
    }

    #[test]
    fn test_crc_frame_layout() {
        let mut codec = crc_codec();
        for _ in 0..256 {
            let mut out = Vec::new();
            codec.seal(b"hello", &mut out);

            let pad_len = usize::from(out[2]) - 1;
            assert!(pad_len <= CRC_PAD_MAX_LEN);
            assert_eq!(out.len(), 12 + pad_len);
            assert_eq!(usize::from(u16::from_be_bytes([out[0], out[1]])), out.len());
            assert_eq!(&out[3 + pad_len..out.len() - 4], b"hello");
            assert_eq!(crc32fast::hash(&out), CRC_RESIDUE);

            assert_eq!(codec.open(&out).unwrap().as_ref(), b"hello");
        }
    }

    #[test]
    fn test_crc_padding_varies() {
        let mut codec = crc_codec();
        let lens: std::collections::HashSet<usize> = (0..512)
            .map(|_| {
                let mut out = Vec::new();
                codec.seal(b"x", &mut out);
                out.len()
            })
            .collect();
        assert_eq!(lens.len(), CRC_PAD_MAX_LEN + 1);
    }

    #[test]
    fn test_empty_payload_emits_nothing() {
        let mut out = Vec::new();
        crc_codec().seal(b"", &mut out);
        DeflateCodec.seal(b"", &mut out);
        assert!(out.is_empty());
        assert!(crc_codec().seal_all(b"").is_empty());
        assert!(DeflateCodec.seal_all(b"").is_empty());
    }

    #[test]
    fn test_seal_all_splits_into_units() {
        let data = vec![0x5au8; CRC_UNIT_LEN * 2 + 1];
        let wire = crc_codec().seal_all(&data);

        let mut frames = 0;
        let mut pos = 0;
        let mut payload = Vec::new();
        while pos < wire.len() {
            let len = usize::from(u16::from_be_bytes([wire[pos], wire[pos + 1]]));
            assert!(len < CRC_LEN_LIMIT);
            payload.extend_from_slice(&crc_codec().open(&wire[pos..pos + len]).unwrap());
            pos += len;
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert_eq!(payload, data);
    }

    #[test]
    fn test_crc_rejects_bad_frames() {
        let codec = crc_codec();
        assert_eq!(
            codec.open(&[0, 3, 1]),
            Err(IntegrityFailure::FrameTooShort { received: 3 })
        );

        let mut out = Vec::new();
        crc_codec().seal(b"payload", &mut out);
        out[4] ^= 0x01;
        assert_eq!(codec.open(&out), Err(IntegrityFailure::ChecksumMismatch));
    }

    #[test]
    fn test_crc_rejects_header_len_past_payload() {
        // A checksum-valid frame whose hdr_len points into the trailer.
        let mut frame = vec![0u8, 8, 6, b'a'];
        let crc = CRC_RESIDUE - crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(
            crc_codec().open(&frame),
            Err(IntegrityFailure::HeaderLenInvalid { received: 6 })
        );
    }

    #[test]
    fn test_deflate_frame_layout() {
        let payload = b"hello hello hello hello hello".repeat(20);
        let mut out = Vec::new();
        DeflateCodec.seal(&payload, &mut out);

        let len = usize::from(u16::from_be_bytes([out[0], out[1]]));
        assert_eq!(len, out.len());
        assert!(len < payload.len());

        let mut stream = ZLIB_HEADER.to_vec();
        stream.extend_from_slice(&out[2..]);
        assert_eq!(miniz_oxide::inflate::decompress_to_vec_zlib(&stream).unwrap(), payload);

        assert_eq!(DeflateCodec.open(&out).unwrap().as_ref(), &payload[..]);
    }

    #[test]
    fn test_deflate_incompressible_unit_fits() {
        let mut rng = StdRng::from_seed([9u8; 32]);
        let mut payload = vec![0u8; DEFLATE_UNIT_LEN];
        rng.fill(&mut payload[..]);
        let mut out = Vec::new();
        DeflateCodec.seal(&payload, &mut out);
        assert!(out.len() < DEFLATE_LEN_LIMIT);
        assert_eq!(DeflateCodec.open(&out).unwrap().as_ref(), &payload[..]);
    }

    #[test]
    fn test_deflate_rejects_corruption() {
        let mut out = Vec::new();
        DeflateCodec.seal(b"some text that compresses", &mut out);
        let truncated = &out[..out.len() - 6];
        assert_eq!(DeflateCodec.open(truncated), Err(IntegrityFailure::InflateFailed));
        assert_eq!(
            DeflateCodec.open(&[0, 2]),
            Err(IntegrityFailure::FrameTooShort { received: 2 })
        );
    }
}
