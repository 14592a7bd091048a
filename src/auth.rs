//! The authenticated stage.
//!
//! `auth_simple` uses the same CRC32 framing as `verify_simple`, but the
//! first frame a client sends starts with an 8-byte identity header:
//!
//! ```text
//! +-----------+---------------+------------------
//! | client_id | connection_id |  application data
//! +-----------+---------------+------------------
//! |  4 (LE)   |     4 (LE)    |
//! +-----------+---------------+------------------
//! ```
//!
//! The server admits the pair through the process-wide [`ClientTable`], so
//! replayed or out-of-window connections are refused.
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    codec::{CrcCodec, FrameCodec},
    config::{EndpointType, ServerInfo},
    error::{Error, Rejection},
    replay_window::ClientTable,
    specification::{AUTH_CONNECTION_ID_SPAN, AUTH_HDR_LEN},
    stage::{SharedState, Stage, build_sub_stage},
    state_machine::{FrameReceiver, NoGuard, PayloadGuard},
};

/// Authentication state shared by all `auth_simple` connections of a
/// process.
///
/// On the client it hands out the identity of each new connection; on the
/// server it holds the table of admitted clients.
#[derive(Debug)]
pub struct AuthData {
    clients: ClientTable,
    client_id: u32,
    next_connection_id: AtomicU32,
}

impl Default for AuthData {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthData {
    /// Creates authentication state with a random client identity.
    pub fn new() -> Self {
        let mut rng = StdRng::from_os_rng();
        let client_id = rng.random();
        let first_connection_id = rng.random_range(0..AUTH_CONNECTION_ID_SPAN);
        Self::with_identity(client_id, first_connection_id)
    }

    /// Creates authentication state with a fixed client identity.
    pub fn with_identity(client_id: u32, first_connection_id: u32) -> Self {
        Self {
            clients: ClientTable::new(),
            client_id,
            next_connection_id: AtomicU32::new(first_connection_id),
        }
    }

    /// The table of admitted clients.
    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    /// The identity this process uses as a client.
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub(crate) fn next_connection_id(&self) -> u32 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// CRC32 framing plus client admission.
#[derive(Debug)]
pub struct AuthSimple {
    info: Option<ServerInfo>,
    sub_stage: Option<Box<dyn Stage>>,
    codec: CrcCodec,
    receiver: FrameReceiver,
    shared: SharedState,
    has_sent_header: bool,
    peer: Option<(u32, u32)>,
}

impl Default for AuthSimple {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSimple {
    /// Creates an unconfigured authenticated stage.
    pub fn new() -> Self {
        Self {
            info: None,
            sub_stage: None,
            codec: CrcCodec::with_rng(StdRng::from_os_rng()),
            receiver: FrameReceiver::new(),
            shared: SharedState::process_wide(),
            has_sent_header: false,
            peer: None,
        }
    }

    /// The `(client_id, connection_id)` pair admitted by the server side.
    pub fn peer(&self) -> Option<(u32, u32)> {
        self.peer
    }
}

impl Stage for AuthSimple {
    fn name(&self) -> &'static str {
        "auth_simple"
    }

    fn init_data(&self) -> SharedState {
        SharedState::with_auth(AuthData::new())
    }

    fn set_server_info(&mut self, info: ServerInfo) {
        self.sub_stage = build_sub_stage(&info);
        self.shared = info.shared().clone();
        self.info = Some(info);
    }

    fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    fn sub_stage_mut(&mut self) -> Option<&mut (dyn Stage + 'static)> {
        self.sub_stage.as_deref_mut()
    }

    fn pre_encrypt(&mut self, side: EndpointType, buf: &[u8]) -> Vec<u8> {
        if side == EndpointType::Server || self.has_sent_header {
            return self.codec.seal_all(buf);
        }
        self.has_sent_header = true;

        let auth = self.shared.auth();
        let mut first = Vec::with_capacity(AUTH_HDR_LEN + buf.len());
        first.extend_from_slice(&auth.client_id().to_le_bytes());
        first.extend_from_slice(&auth.next_connection_id().to_le_bytes());
        first.extend_from_slice(buf);
        self.codec.seal_all(&first)
    }

    fn post_decrypt(&mut self, side: EndpointType, buf: &[u8]) -> Result<Vec<u8>, Error> {
        match side {
            EndpointType::Client => {
                self.receiver.post_decrypt(&self.codec, &mut NoGuard, side, buf)
            }
            EndpointType::Server => {
                let mut guard = AuthGuard {
                    clients: self.shared.auth().clients(),
                    peer: &mut self.peer,
                };
                self.receiver.post_decrypt(&self.codec, &mut guard, side, buf)
            }
        }
    }

    fn is_passthrough(&self) -> bool {
        self.receiver.is_passthrough()
    }
}

/// Checks the identity header of the first frame and strips it.
struct AuthGuard<'a> {
    clients: &'a ClientTable,
    peer: &'a mut Option<(u32, u32)>,
}

impl PayloadGuard for AuthGuard<'_> {
    fn check(&mut self, payload: &[u8]) -> Result<usize, Error> {
        if self.peer.is_some() {
            return Ok(0);
        }
        let Some((client_id, connection_id)) = parse_header(payload) else {
            return Err(Rejection::MissingHeader {
                received: payload.len(),
            }
            .into());
        };
        if !self.clients.insert(client_id, connection_id) {
            return Err(Rejection::Denied {
                client_id,
                connection_id,
            }
            .into());
        }
        debug!(
            target: "verifywire",
            "admitted client {:#010x}, connection {:#010x}", client_id, connection_id
        );
        *self.peer = Some((client_id, connection_id));
        Ok(AUTH_HDR_LEN)
    }

    fn delivered(&mut self) {
        if let Some((client_id, connection_id)) = *self.peer {
            self.clients.update(client_id, connection_id);
        }
    }
}

fn parse_header(payload: &[u8]) -> Option<(u32, u32)> {
    let header: &[u8; AUTH_HDR_LEN] = payload.get(..AUTH_HDR_LEN)?.try_into().ok()?;
    let client_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let connection_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    Some((client_id, connection_id))
}
