use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that the daemon is reachable
    Ping,
    /// Show the identity behind the current session token
    Whoami,
    /// Follow live logs for a service until interrupted
    Logs {
        /// Service name as listed by `warden services`
        service: String,
    },
    /// Restart a managed service (moderator)
    Restart {
        service: String,
    },
    /// List the managed services (helper)
    Services,
    /// Show per-service log hub status (moderator)
    Status,
    /// Grant or remove roles
    Roles {
        #[command(subcommand)]
        command: RoleCommands,
    },
    /// Manage users (local operator, authority daemon only)
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Issue or revoke sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Control the daemon process (local operator)
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum RoleCommands {
    /// Grant a role to a user
    Assign {
        user_id: u64,
        /// superadmin, administrator, moderator, helper, captain or user
        role: String,
    },
    /// Remove a role from a user
    Remove {
        user_id: u64,
        role: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum UserCommands {
    /// Create a user record
    Create {
        #[arg(long)]
        name: Option<String>,
        /// SteamID64 of the linked Steam account
        #[arg(long = "steam-id")]
        steam_id64: Option<String>,
        #[arg(long = "discord-id")]
        discord_id: Option<String>,
        /// Role to seed (repeatable)
        #[arg(long = "role", value_name = "ROLE")]
        roles: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Issue a session token for a user (local operator)
    Issue {
        user_id: u64,
    },
    /// Revoke the current session token
    Logout,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Stop the running daemon
    Shutdown,
}
