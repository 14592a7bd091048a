//! The stage contract, shared state and the stage factory.
use core::fmt::Debug;
use std::sync::{Arc, LazyLock, OnceLock};

use log::warn;

use crate::{
    auth::{AuthData, AuthSimple},
    config::{EndpointType, ServerInfo, split_param},
    error::{ConfigError, Error},
    verify::{VerifyDeflate, VerifySimple},
};

/// One obfuscation transform applied to a connection.
///
/// A stage works on two independent axes:
///
/// ```text
///   outbound:  pre_encrypt --> [cipher] --> client_encode / server_encode --> wire
///   inbound:   wire --> client_decode / server_decode --> [cipher] --> post_decrypt
/// ```
///
/// * [`pre_encrypt`] and [`post_decrypt`] frame the plaintext before the
///   cipher and de-frame it after. Stages that do not frame pass bytes
///   through unchanged.
/// * The four `*_encode` / `*_decode` operations wrap the cipher output in an
///   outer envelope. They always delegate to the configured sub-stage, if
///   any, and are identity transforms otherwise.
///
/// A stage instance belongs to one connection and is never used
/// concurrently; state shared between connections lives in
/// [`SharedState`].
///
/// [`pre_encrypt`]: Stage::pre_encrypt
/// [`post_decrypt`]: Stage::post_decrypt
pub trait Stage: Debug + Send {
    /// The name this stage is registered under.
    fn name(&self) -> &'static str;

    /// Creates the process-wide shared state this stage type needs.
    ///
    /// Called once per process (per client-identifying key); the result is
    /// handed to every connection through [`ServerInfo`].
    fn init_data(&self) -> SharedState {
        SharedState::default()
    }

    /// Configures the stage for a connection.
    ///
    /// Parses the parameter string to build an optional sub-stage. Failure to
    /// build the sub-stage is logged and leaves the stage without one.
    fn set_server_info(&mut self, info: ServerInfo);

    /// The configuration set by [`set_server_info`](Stage::set_server_info).
    fn server_info(&self) -> Option<&ServerInfo>;

    /// The configured sub-stage, if any.
    fn sub_stage_mut(&mut self) -> Option<&mut (dyn Stage + 'static)>;

    /// Wraps data sent by the client.
    fn client_encode(&mut self, buf: &[u8]) -> Vec<u8> {
        match self.sub_stage_mut() {
            Some(sub) => sub.client_encode(buf),
            None => buf.to_vec(),
        }
    }

    /// Unwraps data received by the client.
    fn client_decode(&mut self, buf: &[u8]) -> ClientDecoded {
        match self.sub_stage_mut() {
            Some(sub) => sub.client_decode(buf),
            None => ClientDecoded {
                data: buf.to_vec(),
                need_more: false,
            },
        }
    }

    /// Wraps data sent by the server.
    fn server_encode(&mut self, buf: &[u8]) -> Vec<u8> {
        match self.sub_stage_mut() {
            Some(sub) => sub.server_encode(buf),
            None => buf.to_vec(),
        }
    }

    /// Unwraps data received by the server.
    fn server_decode(&mut self, buf: &[u8]) -> ServerDecoded {
        match self.sub_stage_mut() {
            Some(sub) => sub.server_decode(buf),
            None => ServerDecoded {
                data: buf.to_vec(),
                need_feedback: true,
                need_more: false,
            },
        }
    }

    /// Frames outbound plaintext before it reaches the cipher.
    fn pre_encrypt(&mut self, side: EndpointType, buf: &[u8]) -> Vec<u8> {
        let _ = side;
        buf.to_vec()
    }

    /// De-frames inbound data after the cipher, possibly across many calls.
    ///
    /// An empty result means more data is needed. Once a stage falls back to
    /// raw passthrough this becomes the identity function for good.
    ///
    /// # Errors
    ///
    /// * If no frame was decoded yet, the client side returns
    ///   [`Error::ProtocolMismatch`], while the server side returns the
    ///   single byte `b"E"` as its result instead of an error.
    /// * Once a frame was decoded, a bad frame yields
    ///   [`Error::IntegrityFailure`] on both sides.
    /// * The authenticated stage returns [`Error::AdmissionRejected`] when it
    ///   refuses the client.
    fn post_decrypt(&mut self, side: EndpointType, buf: &[u8]) -> Result<Vec<u8>, Error> {
        let _ = side;
        Ok(buf.to_vec())
    }

    /// Returns `true` once the stage has fallen back to raw passthrough.
    fn is_passthrough(&self) -> bool {
        false
    }
}

/// The result of [`Stage::client_decode`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientDecoded {
    /// The unwrapped bytes.
    pub data: Vec<u8>,
    /// The envelope is incomplete; more bytes must be read.
    pub need_more: bool,
}

/// The result of [`Stage::server_decode`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerDecoded {
    /// The unwrapped bytes.
    pub data: Vec<u8>,
    /// The server should send `server_encode(b"")` back to the client.
    pub need_feedback: bool,
    /// The envelope is incomplete; more bytes must be read.
    pub need_more: bool,
}

/// Process-wide state of a stage type, shared by all its connections.
///
/// Cloning yields another handle to the same state.
#[derive(Clone, Debug, Default)]
pub struct SharedState(Arc<SharedData>);

/// The state used by every connection configured without an explicit
/// [`SharedState`].
///
/// The admission table of `auth_simple` lives here, so replayed first frames
/// are refused across connections even if the caller never calls
/// [`Stage::init_data`].
static PROCESS_STATE: LazyLock<SharedState> = LazyLock::new(SharedState::default);

#[derive(Debug, Default)]
struct SharedData {
    auth: OnceLock<AuthData>,
    sub_state: OnceLock<SharedState>,
}

impl SharedState {
    /// Creates a shared state holding the given authentication data.
    pub fn with_auth(auth: AuthData) -> Self {
        let state = Self::default();
        let _ = state.0.auth.set(auth);
        state
    }

    /// The authentication data, created on first use.
    pub fn auth(&self) -> &AuthData {
        self.0.auth.get_or_init(AuthData::new)
    }

    /// A handle to the process-wide default state.
    pub fn process_wide() -> Self {
        PROCESS_STATE.clone()
    }

    /// Returns `true` if both handles refer to the same state.
    pub fn ptr_eq(&self, other: &SharedState) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The shared state of the configured sub-stage, created by `init` the
    /// first time any connection configures one.
    pub(crate) fn sub_state_or_init(&self, init: impl FnOnce() -> SharedState) -> SharedState {
        self.0.sub_state.get_or_init(init).clone()
    }
}

/// Builds the sub-stage named by `info.param`, if any.
pub(crate) fn build_sub_stage(info: &ServerInfo) -> Option<Box<dyn Stage>> {
    let (name, sub_param) = split_param(info.param())?;
    let mut sub_stage = match new_stage(name) {
        Ok(stage) => stage,
        Err(err) => {
            warn!(target: "verifywire", "cannot build sub-stage {:?}: {}", name, err);
            return None;
        }
    };
    let sub_shared = info.shared().sub_state_or_init(|| sub_stage.init_data());
    sub_stage.set_server_info(info.for_sub_stage(sub_param, sub_shared));
    Some(sub_stage)
}

/// A stage that changes nothing.
#[derive(Debug, Default)]
pub struct Plain {
    info: Option<ServerInfo>,
}

impl Plain {
    /// Creates a plain stage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for Plain {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn set_server_info(&mut self, info: ServerInfo) {
        self.info = Some(info);
    }

    fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    fn sub_stage_mut(&mut self) -> Option<&mut (dyn Stage + 'static)> {
        None
    }
}

type StageConstructor = fn() -> Box<dyn Stage>;

static STAGES: [(&str, StageConstructor); 4] = [
    ("plain", new_plain),
    ("verify_simple", new_verify_simple),
    ("verify_deflate", new_verify_deflate),
    ("auth_simple", new_auth_simple),
];

fn new_plain() -> Box<dyn Stage> {
    Box::new(Plain::new())
}

fn new_verify_simple() -> Box<dyn Stage> {
    Box::new(VerifySimple::new())
}

fn new_verify_deflate() -> Box<dyn Stage> {
    Box::new(VerifyDeflate::new())
}

fn new_auth_simple() -> Box<dyn Stage> {
    Box::new(AuthSimple::new())
}

/// Creates the stage registered under `name`.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownStage`] if no stage has this name.
pub fn new_stage(name: &str) -> Result<Box<dyn Stage>, Error> {
    STAGES
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, constructor)| constructor())
        .ok_or_else(|| {
            ConfigError::UnknownStage {
                name: name.to_owned(),
            }
            .into()
        })
}

/// The names of all registered stages.
pub fn stage_names() -> impl Iterator<Item = &'static str> {
    STAGES.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::init_logging;

    #[test]
    fn test_factory_knows_every_stage() {
        for name in stage_names() {
            assert_eq!(new_stage(name).unwrap().name(), name);
        }
        assert_eq!(
            new_stage("tls1.2_ticket_auth").unwrap_err(),
            Error::Config(ConfigError::UnknownStage {
                name: "tls1.2_ticket_auth".to_owned()
            })
        );
    }

    #[test]
    fn test_plain_is_identity() {
        let mut stage = Plain::new();
        stage.set_server_info(ServerInfo::builder("h", 1).with_param("verify_simple").build());
        assert_eq!(stage.client_encode(b"abc"), b"abc");
        assert_eq!(stage.server_encode(b"abc"), b"abc");
        assert_eq!(
            stage.client_decode(b"abc"),
            ClientDecoded { data: b"abc".to_vec(), need_more: false }
        );
        assert_eq!(
            stage.server_decode(b"abc"),
            ServerDecoded { data: b"abc".to_vec(), need_feedback: true, need_more: false }
        );
        assert_eq!(stage.pre_encrypt(EndpointType::Client, b"abc"), b"abc");
        assert_eq!(stage.post_decrypt(EndpointType::Server, b"abc").unwrap(), b"abc");
        // Plain ignores its parameter.
        assert!(stage.sub_stage_mut().is_none());
    }

    #[test]
    fn test_sub_stage_chain() {
        init_logging();
        let mut stage = VerifySimple::new();
        let shared = stage.init_data();
        stage.set_server_info(
            ServerInfo::builder("h", 1)
                .with_param("verify_deflate,plain")
                .with_shared(shared.clone())
                .build(),
        );
        let sub = stage.sub_stage_mut().unwrap();
        assert_eq!(sub.name(), "verify_deflate");
        assert_eq!(sub.server_info().unwrap().param(), "plain");
        let sub_sub = sub.sub_stage_mut().unwrap();
        assert_eq!(sub_sub.name(), "plain");
        assert!(sub_sub.sub_stage_mut().is_none());
    }

    #[test]
    fn test_sub_stage_shares_state_across_connections() {
        let shared = AuthSimple::new().init_data();
        let info = ServerInfo::builder("h", 1)
            .with_param("auth_simple")
            .with_shared(shared)
            .build();
        let mut first = VerifySimple::new();
        let mut second = VerifySimple::new();
        first.set_server_info(info.clone());
        second.set_server_info(info);
        let first_sub = first.sub_stage_mut().unwrap().server_info().unwrap().shared().clone();
        let second_sub = second.sub_stage_mut().unwrap().server_info().unwrap().shared().clone();
        assert!(first_sub.ptr_eq(&second_sub));
    }

    #[test]
    fn test_unknown_sub_stage_degrades_to_none() {
        init_logging();
        let mut stage = VerifySimple::new();
        stage.set_server_info(ServerInfo::builder("h", 1).with_param("no_such_stage,x").build());
        assert!(stage.sub_stage_mut().is_none());
        assert_eq!(stage.client_encode(b"xyz"), b"xyz");
    }

    #[test]
    fn test_encode_delegates_to_sub_stage() {
        let mut stage = VerifyDeflate::new();
        stage.set_server_info(ServerInfo::builder("h", 1).with_param("plain").build());
        assert_eq!(stage.client_encode(b"abc"), b"abc");
        let decoded = stage.server_decode(b"abc");
        assert!(decoded.need_feedback);
        assert_eq!(decoded.data, b"abc");
    }
}
