//! Builders for daemon configs used by the integration tests

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use warden_daemon::config::{
    AuditConfig, AuthorityConfig, ControlConfig, HubConfig, Mode, ProcessManagerKind, ServiceEntry,
    SessionConfig, ValidatorConfig, WardenConfig,
};
use warden_daemon::roles::Role;

/// Builds a `WardenConfig` backed by the `command` process manager, so
/// services are plain shell scripts.
pub struct TestConfigBuilder {
    config: WardenConfig,
}

impl TestConfigBuilder {
    /// An authority daemon listening on `<dir>/<name>.sock`
    pub fn authority(dir: &Path, name: &str) -> Self {
        Self {
            config: WardenConfig {
                mode: Mode::Authority,
                socket_path: Some(dir.join(format!("{}.sock", name))),
                authority: None,
                sessions: SessionConfig::default(),
                validator: ValidatorConfig::default(),
                hub: HubConfig {
                    grace_period: Duration::from_millis(300),
                    stop_timeout: Duration::from_secs(1),
                    ..HubConfig::default()
                },
                control: ControlConfig::default(),
                audit: AuditConfig {
                    path: None,
                    tracing: false,
                },
                process_manager: ProcessManagerKind::Command,
                services: BTreeMap::new(),
            },
        }
    }

    /// A dependent daemon delegating to the authority at `authority_socket`
    pub fn dependent(dir: &Path, name: &str, authority_socket: &Path) -> Self {
        let mut builder = Self::authority(dir, name);
        builder.config.mode = Mode::Dependent;
        builder.config.authority = Some(AuthorityConfig {
            socket_path: authority_socket.to_path_buf(),
        });
        builder.config.validator = ValidatorConfig {
            timeout: Duration::from_secs(2),
            retries: 1,
            backoff: Duration::from_millis(20),
            reconnect_delay: Duration::from_millis(100),
            ..ValidatorConfig::default()
        };
        builder
    }

    /// Add a service whose log tail is `sh -c <log_script>` and whose
    /// restart is `sh -c <restart_script>`
    pub fn service(mut self, name: &str, log_script: &str, restart_script: &str) -> Self {
        self.config.services.insert(
            name.to_string(),
            ServiceEntry {
                display_name: None,
                description: format!("{} test service", name),
                log_query_args: sh(log_script),
                restart_command: Some(sh(restart_script)),
            },
        );
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.hub.grace_period = grace;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.hub.buffer_capacity = capacity;
        self
    }

    pub fn viewer_role(mut self, role: Role) -> Self {
        self.config.hub.viewer_role = role;
        self
    }

    pub fn reauth_interval(mut self, interval: Duration) -> Self {
        self.config.hub.reauth_interval = interval;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.validator.cache_ttl = ttl;
        self
    }

    pub fn restart_timeout(mut self, timeout: Duration) -> Self {
        self.config.control.restart_timeout = timeout;
        self
    }

    pub fn build(self) -> WardenConfig {
        self.config
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}
