use std::path::PathBuf;

pub mod audit;
pub mod config;
pub mod context;
pub mod controller;
pub mod errors;
pub mod gate;
pub mod handler;
pub mod hub;
pub mod manager;
pub mod roles;
pub mod session_store;
pub mod users;
pub mod validator;

use errors::{DaemonError, Result};

const GLOBAL_STATE_DIR: &str = ".warden";

pub fn global_state_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(GLOBAL_STATE_DIR))
        .ok_or_else(|| DaemonError::Config("could not determine home directory".into()))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(global_state_dir()?.join("warden.yaml"))
}

pub fn default_socket_path() -> Result<PathBuf> {
    Ok(global_state_dir()?.join("warden.sock"))
}
