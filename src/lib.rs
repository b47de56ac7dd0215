//! Run commands and transfer files on hosts that are only reachable through
//! one or more SSH jump servers.
//!
//! A [`Session`] is one SSH connection. [`Session::get_remote_session`]
//! returns a session to a host visible from it, tunneled through its
//! connection; chains can be arbitrarily deep.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod rest_client;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod tunnel;
pub mod utils;

pub use command::{CommandResult, OutputSink, RunOptions, Silent, SuccessCodes};
pub use config::{ConnectOptions, Credentials, HopSpec, HostKeyPolicy, OpenOptions, RetryLimit, SessionConfig};
pub use error::{JumpSshError, Result};
pub use logging::setup_logging;
pub use rest_client::{HttpResponse, RequestOptions, RestSshClient};
pub use session::{RemoteTarget, Session};
pub use sftp::TransferOptions;
pub use tunnel::{TunnelLease, TunnelRegistry};
