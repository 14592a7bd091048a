//! Verifywire provides pluggable obfuscation stages for proxied byte
//! streams. A stage frames plaintext before it reaches the stream cipher and
//! de-frames it afterwards, and may wrap the cipher output in the envelope of
//! a chained sub-stage.
//!
//! ## Stages
//!
//! | name             | framing                                        |
//! |------------------|------------------------------------------------|
//! | `plain`          | none                                           |
//! | `verify_simple`  | length, random padding, CRC32 trailer          |
//! | `verify_deflate` | length, DEFLATE-compressed payload             |
//! | `auth_simple`    | as `verify_simple`, plus client admission      |
//!
//! Create a stage with [`new_stage`], configure it once per connection with
//! [`Stage::set_server_info`], then call [`Stage::pre_encrypt`] and
//! [`Stage::post_decrypt`] around the cipher.
//!
//! ## Fallback
//!
//! A stage that cannot parse the very first frame of a connection assumes
//! the peer does not speak it and switches to raw passthrough for the rest of
//! the connection. The client side reports [`Error::ProtocolMismatch`]; the
//! server side answers with the single byte `b"E"`. Corruption after the
//! first good frame is reported as [`Error::IntegrityFailure`].
//!
//! ## Anti-replay
//!
//! `auth_simple` prepends a client identifier and a per-connection
//! identifier to the first frame. The server admits each pair at most once
//! through a process-wide [`ClientTable`] of sliding windows, shared through
//! the [`SharedState`] returned by [`Stage::init_data`].
//!
//! ## Driving a stream
//!
//! * [`Pipeline`]
//!
//!   A sans-I/O driver binding one stage, one side and an optional
//!   [`CipherLayer`] to any stream implementing [`Read`] and [`Write`].
//!
//! * [`StagedStream`]
//!
//!   An asynchronous wrapper around `Pipeline` implementing [`AsyncRead`]
//!   and [`AsyncWrite`]. It requires the `tokio-stream-impl` feature.
//!
//! [`Read`]: std::io::Read
//! [`Write`]: std::io::Write
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod auth;
mod codec;
mod pipeline;
mod replay_window;
mod specification;
mod stage;
mod state_machine;
mod verify;

#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod tokio_stream_impl;

pub use auth::{AuthData, AuthSimple};
pub use config::{EndpointType, ServerInfo};
pub use error::Error;
pub use pipeline::{CipherLayer, NoCipher, Pipeline};
pub use replay_window::{ClientTable, ClientWindow};
pub use stage::{ClientDecoded, Plain, ServerDecoded, SharedState, Stage, new_stage, stage_names};
pub use verify::{VerifyDeflate, VerifySimple};

#[cfg(feature = "tokio-stream-impl")]
pub use tokio_stream_impl::StagedStream;

#[cfg(test)]
mod test {
    use std::{
        io::{self, ErrorKind, Read, Write},
        sync::Once,
    };

    use log::LevelFilter;

    static INIT_LOGGING: Once = Once::new();

    pub(crate) fn init_logging() {
        INIT_LOGGING.call_once(|| {
            env_logger::builder()
                .is_test(true)
                .filter_level(LevelFilter::Trace)
                .init();
        });
    }

    #[derive(Debug)]
    pub(crate) struct MockStream {
        pub(crate) buf: Vec<u8>,
        pub(crate) eof: bool,
    }

    impl MockStream {
        pub(crate) fn set_eof(&mut self) {
            self.buf.clear();
            self.eof = true;
        }

        pub(crate) fn clear(&mut self) {
            self.buf.clear();
            self.eof = false;
        }
    }

    impl Default for MockStream {
        fn default() -> Self {
            Self {
                buf: Vec::with_capacity(65536),
                eof: false,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.eof {
                return Ok(0);
            }
            if self.buf.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "empty buffer"));
            }
            let n = core::cmp::min(buf.len(), self.buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.eof {
                return Ok(0);
            }
            self.buf.extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
