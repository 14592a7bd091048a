//! The informal specification of the verifywire framing formats.

// CRC frame (`verify_simple`, `auth_simple`):
// ```text
// | len | hdr_len |  padding  | payload  | crc |
// |  2B |    1B   | hdr_len-1 | variable |  4B |
// |             <- frame (len bytes) ->        |
// ```
// `len` is big-endian and covers the whole frame. `crc` is little-endian and
// equals `0xffffffff - crc32(frame[..len-4])`, so that the CRC32 of the whole
// frame is `0xffffffff`.
pub(crate) const CRC_UNIT_LEN: usize = 8100;
pub(crate) const CRC_LEN_LIMIT: usize = 8192;
pub(crate) const CRC_PAD_MAX_LEN: usize = 15;
pub(crate) const CRC_TRAILER_LEN: usize = 4;
pub(crate) const CRC_FRAME_MIN_LEN: usize = LEN_FIELD_LEN + 1 + CRC_TRAILER_LEN; // 7
pub(crate) const CRC_RESIDUE: u32 = 0xffff_ffff;

// Deflate frame (`verify_deflate`):
// ```text
// | len | zlib stream without its 2-byte header |
// |  2B |              len-2 bytes              |
// |            <- frame (len bytes) ->          |
// ```
// `len` is big-endian and equals the length of the complete zlib stream.
pub(crate) const DEFLATE_UNIT_LEN: usize = 32700;
pub(crate) const DEFLATE_LEN_LIMIT: usize = 32768;
pub(crate) const DEFLATE_FRAME_MIN_LEN: usize = LEN_FIELD_LEN + 1;
pub(crate) const DEFLATE_MAX_OUTPUT: usize = 32768;
pub(crate) const ZLIB_HEADER: [u8; 2] = [0x78, 0x9c];

pub(crate) const LEN_FIELD_LEN: usize = 2;

// Authentication header carried at the front of the first `auth_simple`
// payload sent by a client:
// ```text
// | client_id | connection_id |
// |   4B LE   |     4B LE     |
// ```
pub(crate) const AUTH_HDR_LEN: usize = 8;
pub(crate) const AUTH_CONNECTION_ID_SPAN: u32 = 0x0100_0000;

/// Sent by the server side in place of payload when the first frame fails.
pub(crate) const ERROR_MARKER: u8 = b'E';

// Per-client admission window.
pub(crate) const CLIENT_ACTIVE_MILLIS: u64 = 180 * 1000;
pub(crate) const WINDOW_MAX_AHEAD: u64 = 0x4000;
pub(crate) const WINDOW_MAX_SPAN: u64 = 0x1000;
pub(crate) const TABLE_MAX_ACTIVE: usize = 16;
pub(crate) const TABLE_MAX_ENTRIES: usize = 256;
