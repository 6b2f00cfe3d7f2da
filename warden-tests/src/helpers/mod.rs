pub mod config_builder;
pub mod counting_authority;
pub mod daemon_harness;
pub mod marker_files;
pub mod wait_utils;
