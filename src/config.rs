//! Per-connection configuration handed to a [`Stage`].
//!
//! A [`ServerInfo`] carries the remote endpoint, the TCP MSS, a free-form
//! parameter string and a handle to the process-wide [`SharedState`] of the
//! stage type. The parameter string selects an optional sub-stage:
//!
//! * `""`: no sub-stage;
//! * `"<name>"`: a sub-stage `name` with an empty parameter;
//! * `"<name>,<param>"`: a sub-stage `name` configured with `param`, which
//!   may itself name a further sub-stage.
//!
//! # Example
//!
//! ```
//! use verifywire::{ServerInfo, Stage, new_stage};
//!
//! let mut stage = new_stage("auth_simple").unwrap();
//!
//! // Created once per process and shared by every connection.
//! let shared = stage.init_data();
//!
//! stage.set_server_info(
//!     ServerInfo::builder("203.0.113.7", 8388)
//!         .with_tcp_mss(1448)
//!         .with_param("plain")
//!         .with_shared(shared.clone())
//!         .build(),
//! );
//! ```
//!
//! [`Stage`]: crate::Stage
use crate::stage::SharedState;

const DEFAULT_TCP_MSS: u16 = 1460;

/// Immutable per-connection parameters of a stage.
///
/// Cloning is cheap: the shared state is reference counted.
///
/// For details on building a `ServerInfo`, refer to the [`config`] module.
///
/// [`config`]: crate::config
#[derive(Clone, Debug)]
pub struct ServerInfo {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tcp_mss: u16,
    pub(crate) param: String,
    pub(crate) shared: SharedState,
}

/// A builder for creating a [`ServerInfo`] instance.
///
/// To get a [`ServerInfoBuilder`], use [`ServerInfo::builder`].
#[derive(Clone, Debug)]
pub struct ServerInfoBuilder {
    host: String,
    port: u16,
    tcp_mss: u16,
    param: String,
    shared: Option<SharedState>,
}

impl ServerInfo {
    /// Starts building the configuration of a connection to `host:port`.
    pub fn builder(host: impl Into<String>, port: u16) -> ServerInfoBuilder {
        ServerInfoBuilder {
            host: host.into(),
            port,
            tcp_mss: DEFAULT_TCP_MSS,
            param: String::new(),
            shared: None,
        }
    }

    /// The remote host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The maximum segment size of the underlying TCP connection.
    pub fn tcp_mss(&self) -> u16 {
        self.tcp_mss
    }

    /// The stage parameter string.
    pub fn param(&self) -> &str {
        &self.param
    }

    /// The shared state of the stage type.
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// Derives the configuration of a sub-stage: same endpoint, the
    /// remainder of the parameter string and the sub-stage's shared state.
    pub(crate) fn for_sub_stage(&self, param: &str, shared: SharedState) -> ServerInfo {
        ServerInfo {
            host: self.host.clone(),
            port: self.port,
            tcp_mss: self.tcp_mss,
            param: param.to_owned(),
            shared,
        }
    }
}

impl ServerInfoBuilder {
    /// Sets the maximum segment size. The default is 1460.
    pub fn with_tcp_mss(mut self, tcp_mss: u16) -> Self {
        self.tcp_mss = tcp_mss;
        self
    }

    /// Sets the parameter string used to select a sub-stage.
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }

    /// Sets the shared state, usually obtained once from
    /// [`Stage::init_data`](crate::Stage::init_data).
    ///
    /// Without it the connection uses [`SharedState::process_wide`].
    pub fn with_shared(mut self, shared: SharedState) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> ServerInfo {
        ServerInfo {
            host: self.host,
            port: self.port,
            tcp_mss: self.tcp_mss,
            param: self.param,
            shared: self.shared.unwrap_or_else(SharedState::process_wide),
        }
    }
}

/// The side of the connection a stage operates on.
///
/// The client initiates the connection; the server accepts it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EndpointType {
    /// The initiating side.
    Client,
    /// The accepting side.
    Server,
}

/// Splits a parameter string into the sub-stage name and its own parameter.
///
/// Returns `None` if no sub-stage is configured.
pub(crate) fn split_param(param: &str) -> Option<(&str, &str)> {
    if param.is_empty() {
        return None;
    }
    Some(param.split_once(',').unwrap_or((param, "")))
}
