//! Test utilities for the warden workspace
//!
//! Runs real daemons in-process behind real sockets so the integration
//! tests exercise the same request path a CLI or dependent service would.

pub mod helpers;

pub use helpers::config_builder::TestConfigBuilder;
pub use helpers::counting_authority::CountingAuthority;
pub use helpers::daemon_harness::TestDaemonHarness;
pub use helpers::marker_files::MarkerFileHelper;
pub use helpers::wait_utils::{wait_for_hub_state, wait_for_socket, wait_until};
