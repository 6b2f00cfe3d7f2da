mod commands;
mod errors;

use std::path::PathBuf;

use crate::{
    commands::{Commands, DaemonCommands, RoleCommands, SessionCommands, UserCommands},
    errors::{CliError, Result},
};
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use colored::{Color, Colorize};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use warden_protocol::{
    client::Client,
    errors::ClientError,
    protocol::{
        HubStatusInfo, LogLine, Response, ResponseData, ServerEvent, ServiceSummary,
        SessionValidation, StreamState,
    },
};

/// Warden - session-gated log streaming and service control
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Daemon socket (default ~/.warden/warden.sock)
    #[arg(long, global = true, env = "WARDEN_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Session token used for authorized commands
    #[arg(long, global = true, env = "WARDEN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn require_token(&self) -> Result<&str> {
        self.token.as_deref().ok_or(CliError::MissingToken)
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let socket_path = match &cli.socket {
        Some(path) => path.clone(),
        None => warden_daemon::default_socket_path()
            .map_err(|e| CliError::SocketPath(e.to_string()))?,
    };
    debug!("Connecting to {}", socket_path.display());

    let client = match Client::connect(&socket_path).await {
        Ok(c) => c,
        Err(ClientError::Connect(_)) => {
            eprintln!("Daemon is not running (no socket at {})", socket_path.display());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    match &cli.command {
        Commands::Ping => {
            handle_response(client.ping().await?);
        }

        Commands::Whoami => {
            let response = client.validate_session(cli.require_token()?).await?;
            match expect_data(response)? {
                ResponseData::SessionValidation(validation) => print_identity(&validation),
                _ => return Err(CliError::UnexpectedResponse),
            }
        }

        Commands::Logs { service } => {
            follow_logs(&client, cli.require_token()?, service).await?;
        }

        Commands::Restart { service } => {
            println!("Restarting {}...", service);
            let response = client.restart_service(cli.require_token()?, service).await?;
            match expect_data(response)? {
                ResponseData::Restart(info) => {
                    println!("{} {}", "Restarted".green(), info.service);
                }
                _ => return Err(CliError::UnexpectedResponse),
            }
        }

        Commands::Services => {
            let response = client.list_services(cli.require_token()?).await?;
            match expect_data(response)? {
                ResponseData::Services(services) => print_service_table(&services),
                _ => return Err(CliError::UnexpectedResponse),
            }
        }

        Commands::Status => {
            let response = client.hub_status(cli.require_token()?).await?;
            match expect_data(response)? {
                ResponseData::HubStatus(hubs) => print_hub_table(&hubs),
                _ => return Err(CliError::UnexpectedResponse),
            }
        }

        Commands::Roles { command } => {
            let token = cli.require_token()?;
            let response = match command {
                RoleCommands::Assign { user_id, role } => client.assign_role(token, *user_id, role).await?,
                RoleCommands::Remove { user_id, role } => client.remove_role(token, *user_id, role).await?,
            };
            match expect_data(response)? {
                ResponseData::RoleChange(change) => {
                    let verb = match command {
                        RoleCommands::Assign { .. } => "granted to",
                        RoleCommands::Remove { .. } => "removed from",
                    };
                    if change.changed {
                        println!("Role {} {} user {}", change.role, verb, change.user_id);
                    } else {
                        println!("No change: user {} role {} already in place", change.user_id, change.role);
                    }
                }
                _ => return Err(CliError::UnexpectedResponse),
            }
        }

        Commands::User { command: UserCommands::Create { name, steam_id64, discord_id, roles } } => {
            let response = client
                .create_user(name.clone(), steam_id64.clone(), discord_id.clone(), roles.clone())
                .await?;
            match expect_data(response)? {
                ResponseData::User(user) => {
                    println!("Created user {}", user.id);
                    if !user.roles.is_empty() {
                        println!("  roles: {}", user.roles.join(", "));
                    }
                }
                _ => return Err(CliError::UnexpectedResponse),
            }
        }

        Commands::Session { command } => match command {
            SessionCommands::Issue { user_id } => {
                let response = client.issue_session(*user_id).await?;
                match expect_data(response)? {
                    ResponseData::Session(session) => {
                        println!("{}", session.token);
                        eprintln!("expires {}", format_millis(session.expires_at));
                    }
                    _ => return Err(CliError::UnexpectedResponse),
                }
            }
            SessionCommands::Logout => {
                handle_response(client.logout(cli.require_token()?).await?);
            }
        },

        Commands::Daemon { command: DaemonCommands::Shutdown } => {
            handle_response(client.shutdown().await?);
        }
    }

    Ok(())
}

fn handle_response(response: Response) {
    match response {
        Response::Ok { message, .. } => {
            if let Some(msg) = message {
                println!("{}", msg);
            }
        }
        Response::Error { kind, message } => {
            eprintln!("Error ({}): {}", kind, message);
            std::process::exit(1);
        }
    }
}

/// Unwrap the data payload of a successful response, exiting on an error
/// response.
fn expect_data(response: Response) -> Result<ResponseData> {
    match response {
        Response::Ok { data: Some(data), .. } => Ok(data),
        Response::Ok { data: None, .. } => Err(CliError::UnexpectedResponse),
        error => {
            handle_response(error);
            Err(CliError::UnexpectedResponse)
        }
    }
}

async fn follow_logs(client: &Client, token: &str, service: &str) -> Result<()> {
    let (request_id, (mut events, mut response)) = client.subscribe_logs(token, service)?;
    let mut interrupted = false;

    let final_response = loop {
        tokio::select! {
            result = &mut response => break result?,
            Some(event) = events.recv() => print_stream_event(&event),
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                debug!("Interrupted, unsubscribing stream {}", request_id);
                client.unsubscribe(request_id).await?;
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        print_stream_event(&event);
    }

    if interrupted && final_response.error_kind().is_none() {
        return Ok(());
    }
    handle_response(final_response);
    Ok(())
}

fn print_stream_event(event: &ServerEvent) {
    match event {
        ServerEvent::Log { line, .. } => println!("{}", format_log_line(line)),
        ServerEvent::StreamState { state, .. } => eprintln!("{}", stream_state_message(state)),
        ServerEvent::SessionRevoked { .. } => {}
    }
}

fn priority_color(priority: Option<u8>) -> Option<Color> {
    match priority? {
        0..=3 => Some(Color::Red),
        4 => Some(Color::Yellow),
        _ => None,
    }
}

fn format_log_line(line: &LogLine) -> String {
    let message = match (line.priority, priority_color(line.priority)) {
        (_, Some(color)) => line.message.color(color).to_string(),
        (Some(7), None) => line.message.dimmed().to_string(),
        _ => line.message.clone(),
    };

    let timestamp = line
        .timestamp
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|dt| {
            let local: DateTime<Local> = dt.into();
            local.format("%Y-%m-%d %H:%M:%S").to_string()
        });

    match timestamp {
        Some(ts) => format!("{} | {}", ts.dimmed(), message),
        None => message,
    }
}

fn stream_state_message(state: &StreamState) -> String {
    match state {
        StreamState::Connected { service } => format!("-- streaming {} (ctrl-c to stop) --", service),
        StreamState::ServiceUnavailable { reason } => format!("-- service unavailable: {} --", reason),
        StreamState::OverflowDisconnect => "-- disconnected: too far behind, resubscribe to continue --".to_string(),
        StreamState::Unauthorized => "-- session is no longer authorized --".to_string(),
        StreamState::Shutdown => "-- daemon is shutting down --".to_string(),
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| {
            let local: DateTime<Local> = dt.into();
            local.format("%Y-%m-%d %H:%M:%S").to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}

fn print_identity(validation: &SessionValidation) {
    if !validation.valid {
        eprintln!("Session is not valid");
        std::process::exit(1);
    }
    let user = validation.user_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    println!("user:    {}", user);
    println!("roles:   {}", if validation.roles.is_empty() { "-".to_string() } else { validation.roles.join(", ") });
    println!("expires: {}", validation.expires_at.map(format_millis).unwrap_or_else(|| "-".to_string()));
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DISPLAY NAME")]
    display_name: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

fn service_rows(services: &[ServiceSummary]) -> Vec<ServiceRow> {
    let mut sorted: Vec<_> = services.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
        .into_iter()
        .map(|s| ServiceRow {
            name: s.name.clone(),
            display_name: s.display_name.clone(),
            description: if s.description.is_empty() { "-".to_string() } else { s.description.clone() },
        })
        .collect()
}

fn print_service_table(services: &[ServiceSummary]) {
    if services.is_empty() {
        println!("No services configured");
        return;
    }
    let table = Table::new(service_rows(services)).with(Style::blank()).to_string();
    println!("{table}");
}

#[derive(Tabled)]
struct HubRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "SUBSCRIBERS")]
    subscribers: usize,
    #[tabled(rename = "PID")]
    pid: String,
}

fn hub_row(info: &HubStatusInfo) -> HubRow {
    HubRow {
        service: info.service.clone(),
        state: info.state.clone(),
        subscribers: info.subscribers,
        pid: info.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
    }
}

fn print_hub_table(hubs: &[HubStatusInfo]) {
    let rows: Vec<HubRow> = hubs.iter().map(hub_row).collect();
    let table = Table::new(rows).with(Style::blank()).to_string();
    println!("{table}");
}

#[cfg(test)]
mod tests;
