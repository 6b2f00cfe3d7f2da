//! Request dispatch.
//!
//! Every token-bearing request goes through the gate first; nothing is
//! executed for a request the gate refused. Requests that bootstrap users
//! and sessions are reserved to local operators (root or the daemon's own
//! uid, as reported by the socket's peer credentials).

use std::sync::Arc;

use tracing::{debug, info, warn};
use warden_protocol::protocol::{
    ErrorKind, Request, Response, ResponseData, RestartInfo, RoleChangeInfo, ServerEvent,
    ServiceSummary, SessionInfo, SessionValidation, StreamState, UserInfo,
};
use warden_protocol::server::{PeerInfo, RequestContext};

use crate::audit::{ACTION_ROLE_ASSIGN, ACTION_ROLE_REMOVE, AuditEntry, AuditOutcome};
use crate::context::{AuthorityState, DaemonContext};
use crate::errors::AuthError;
use crate::hub::{CloseReason, SubscriptionEvent};
use crate::roles::{Role, RoleChange};
use crate::users::{ExternalIds, User, UserId};

/// Rank needed to list the managed services.
const LIST_SERVICES_RANK: u8 = Role::Helper.rank();

/// Rank needed to inspect hub state.
const HUB_STATUS_RANK: u8 = Role::Moderator.rank();

pub async fn handle_request(daemon: Arc<DaemonContext>, request: Request, ctx: RequestContext) -> Response {
    match request {
        Request::Ping => Response::ok_with_message("pong"),

        Request::Shutdown => {
            if let Err(response) = require_operator(&daemon, ctx.peer()) {
                return response;
            }
            info!("Shutdown requested by uid {}", ctx.peer().uid);
            let _ = ctx.shutdown_tx().send(()).await;
            Response::ok_with_message("Daemon shutting down")
        }

        Request::CreateUser {
            name,
            steam_id64,
            discord_id,
            roles,
        } => {
            let authority = match operator_authority(&daemon, ctx.peer()) {
                Ok(authority) => authority,
                Err(response) => return response,
            };
            create_user(authority, name, ExternalIds { steam_id64, discord_id }, roles)
        }

        Request::IssueSession { user_id } => {
            let authority = match operator_authority(&daemon, ctx.peer()) {
                Ok(authority) => authority,
                Err(response) => return response,
            };
            let user_id = UserId(user_id);
            if !authority.users.contains(user_id) {
                return Response::error(ErrorKind::NotFound, format!("user {} not found", user_id));
            }
            match authority.sessions.issue(user_id) {
                Ok((token, session)) => Response::ok_with_data(ResponseData::Session(SessionInfo {
                    token: token.to_hex(),
                    user_id: user_id.0,
                    expires_at: session.expires_at.timestamp_millis(),
                })),
                Err(e) => Response::error(ErrorKind::Internal, e.to_string()),
            }
        }

        Request::ValidateSession { token } => match daemon.gate.validate(&token).await {
            Ok(identity) => Response::ok_with_data(ResponseData::SessionValidation(identity.to_validation())),
            Err(AuthError::ServiceUnavailable(reason)) => {
                Response::error(ErrorKind::ServiceUnavailable, reason)
            }
            Err(_) => Response::ok_with_data(ResponseData::SessionValidation(SessionValidation::invalid())),
        },

        Request::Logout { token } => {
            let Some(authority) = daemon.authority.as_ref() else {
                return not_authority();
            };
            if authority.sessions.revoke(&token) {
                Response::ok_with_message("Logged out")
            } else {
                auth_error(AuthError::Unauthorized)
            }
        }

        Request::WatchRevocations => watch_revocations(&daemon, &ctx).await,

        Request::AssignRole { token, user_id, role } => {
            change_role(&daemon, &token, UserId(user_id), &role, ACTION_ROLE_ASSIGN).await
        }

        Request::RemoveRole { token, user_id, role } => {
            change_role(&daemon, &token, UserId(user_id), &role, ACTION_ROLE_REMOVE).await
        }

        Request::ListServices { token } => {
            if let Err(e) = daemon.gate.require_min_rank(&token, LIST_SERVICES_RANK).await {
                return auth_error(e);
            }
            let services = daemon
                .catalog
                .iter()
                .map(|s| ServiceSummary {
                    name: s.name.clone(),
                    display_name: s.display_name.clone(),
                    description: s.description.clone(),
                })
                .collect();
            Response::ok_with_data(ResponseData::Services(services))
        }

        Request::HubStatus { token } => {
            if let Err(e) = daemon.gate.require_min_rank(&token, HUB_STATUS_RANK).await {
                return auth_error(e);
            }
            let statuses = daemon.hubs.statuses().await.into_iter().map(Into::into).collect();
            Response::ok_with_data(ResponseData::HubStatus(statuses))
        }

        Request::SubscribeLogs { token, service } => stream_logs(&daemon, &ctx, token, service).await,

        Request::Unsubscribe { request_id } => {
            if ctx.cancel_stream(request_id) {
                Response::ok_with_message(format!("Stream {} closed", request_id))
            } else {
                Response::ok_with_message(format!("Stream {} was not open", request_id))
            }
        }

        Request::RestartService { token, service } => match daemon.controller.restart(&token, &service).await {
            Ok(outcome) => Response::ok_with_data(ResponseData::Restart(RestartInfo {
                service,
                exit_code: outcome.exit_code.unwrap_or_default(),
            })),
            Err(e) => Response::error(e.kind(), e.to_string()),
        },
    }
}

fn auth_error(err: AuthError) -> Response {
    Response::error(err.kind(), err.to_string())
}

fn not_authority() -> Response {
    Response::error(
        ErrorKind::BadRequest,
        "this daemon is not the session authority",
    )
}

fn require_operator(daemon: &DaemonContext, peer: PeerInfo) -> Result<(), Response> {
    if peer.uid == 0 || peer.uid == daemon.daemon_uid {
        Ok(())
    } else {
        warn!("Rejected operator request from uid {}", peer.uid);
        Err(Response::error(
            ErrorKind::PermissionDenied,
            "only local operators may do this",
        ))
    }
}

fn operator_authority(daemon: &DaemonContext, peer: PeerInfo) -> Result<&AuthorityState, Response> {
    require_operator(daemon, peer)?;
    daemon.authority.as_ref().ok_or_else(not_authority)
}

fn user_info(user: &User, roles: &[Role]) -> UserInfo {
    UserInfo {
        id: user.id.0,
        name: user.name.clone(),
        steam_id64: user.external.steam_id64.clone(),
        discord_id: user.external.discord_id.clone(),
        roles: roles.iter().map(|r| r.name().to_string()).collect(),
        created_at: user.created_at.timestamp_millis(),
    }
}

fn create_user(
    authority: &AuthorityState,
    name: Option<String>,
    external: ExternalIds,
    role_names: Vec<String>,
) -> Response {
    // Reject unknown role names before creating anything
    let roles = match role_names.iter().map(|r| r.parse::<Role>()).collect::<Result<Vec<_>, _>>() {
        Ok(roles) => roles,
        Err(e) => return Response::error(e.kind(), e.to_string()),
    };

    let user = match authority.users.create(name, external) {
        Ok(user) => user,
        Err(e) => return Response::error(ErrorKind::BadRequest, e.to_string()),
    };
    for role in roles {
        if let Err(e) = authority.roles.seed(user.id, role) {
            return Response::error(e.kind(), e.to_string());
        }
    }
    info!("Created user {}", user.id);
    Response::ok_with_data(ResponseData::User(user_info(&user, &authority.roles.roles_of(user.id))))
}

async fn change_role(
    daemon: &DaemonContext,
    token: &str,
    target: UserId,
    role_name: &str,
    action: &'static str,
) -> Response {
    let Some(authority) = daemon.authority.as_ref() else {
        return not_authority();
    };

    // Attempts that never reach the registry are audited here
    let audit_target = format!("user:{}/{}", target, role_name);

    let identity = match daemon.gate.validate(token).await {
        Ok(identity) => identity,
        Err(e) => {
            daemon.audit.record(AuditEntry::new(
                None,
                action,
                audit_target,
                AuditOutcome::Denied { reason: e.to_string() },
            ));
            return auth_error(e);
        }
    };

    let role = match role_name.parse::<Role>() {
        Ok(role) => role,
        Err(e) => {
            daemon.audit.record(AuditEntry::new(
                Some(identity.user_id),
                action,
                audit_target,
                AuditOutcome::Failure { reason: e.to_string() },
            ));
            return Response::error(e.kind(), e.to_string());
        }
    };

    let result = if action == ACTION_ROLE_ASSIGN {
        authority.roles.assign(identity.user_id, target, role)
    } else {
        authority.roles.remove(identity.user_id, target, role)
    };
    match result {
        Ok(change) => Response::ok_with_data(ResponseData::RoleChange(RoleChangeInfo {
            user_id: target.0,
            role: role.name().to_string(),
            changed: change == RoleChange::Applied,
        })),
        Err(e) => Response::error(e.kind(), e.to_string()),
    }
}

async fn watch_revocations(daemon: &DaemonContext, ctx: &RequestContext) -> Response {
    let Some(authority) = daemon.authority.as_ref() else {
        return not_authority();
    };
    let mut revocations = authority.sessions.subscribe_revocations();
    debug!("Revocation watcher attached (uid {})", ctx.peer().uid);

    loop {
        tokio::select! {
            revoked = revocations.recv() => match revoked {
                Ok(digest) => {
                    let event = ServerEvent::SessionRevoked {
                        request_id: ctx.request_id(),
                        digest,
                    };
                    if !ctx.events().send(event).await {
                        return Response::ok_with_message("watcher disconnected");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // The watcher can no longer trust its cache; end the
                    // feed so it reconnects and starts clean.
                    warn!("Revocation watcher lagged by {} event(s), closing feed", missed);
                    return Response::error(ErrorKind::ServiceUnavailable, "revocation feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Response::ok_with_message("revocation feed closed");
                }
            },
            _ = ctx.closed() => return Response::ok_with_message("watcher disconnected"),
        }
    }
}

enum StreamEnd {
    Unsubscribed,
    Disconnected,
    Closed(CloseReason),
    Revoked(AuthError),
}

async fn stream_logs(daemon: &DaemonContext, ctx: &RequestContext, token: String, service: String) -> Response {
    // Registered up front so an Unsubscribe sent while we authorize and
    // join the hub is not lost
    let guard = ctx.open_stream();

    if let Err(e) = daemon.gate.require_min_rank(&token, daemon.viewer_rank).await {
        debug!("Log stream for {} refused: {}", service, e);
        return auth_error(e);
    }

    let mut subscription = match daemon.hubs.subscribe(&service).await {
        Ok(subscription) => subscription,
        Err(e) => return Response::error(e.kind(), e.to_string()),
    };
    if guard.is_cancelled() {
        subscription.unsubscribe().await;
        return Response::ok_with_message(format!("Unsubscribed from {}", service));
    }
    let events = ctx.events();
    let request_id = ctx.request_id();

    let connected = ServerEvent::StreamState {
        request_id,
        state: StreamState::Connected { service: service.clone() },
    };
    let end = if !events.send(connected).await {
        StreamEnd::Disconnected
    } else {
        let mut reauth = tokio::time::interval(daemon.reauth_interval);
        // The first tick completes immediately and the token was just checked
        reauth.tick().await;

        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    SubscriptionEvent::Line(line) => {
                        if !events.send(ServerEvent::Log { request_id, line }).await {
                            break StreamEnd::Disconnected;
                        }
                    }
                    SubscriptionEvent::Closed(reason) => break StreamEnd::Closed(reason),
                },
                _ = guard.cancelled() => break StreamEnd::Unsubscribed,
                _ = ctx.closed() => break StreamEnd::Disconnected,
                _ = reauth.tick() => {
                    if let Err(e) = daemon.gate.require_min_rank(&token, daemon.viewer_rank).await {
                        break StreamEnd::Revoked(e);
                    }
                }
            }
        }
    };

    subscription.unsubscribe().await;
    drop(guard);

    match end {
        StreamEnd::Unsubscribed | StreamEnd::Closed(CloseReason::Unsubscribed) => {
            Response::ok_with_message(format!("Unsubscribed from {}", service))
        }
        StreamEnd::Disconnected => {
            debug!("Log stream {} for {} ended by disconnect", request_id, service);
            Response::ok_with_message("disconnected")
        }
        StreamEnd::Closed(reason) => {
            if let Some(state) = reason.stream_state() {
                events.send(ServerEvent::StreamState { request_id, state }).await;
            }
            let message = match &reason {
                CloseReason::Overflow => format!("log stream for {} fell behind and was disconnected", service),
                CloseReason::ServiceUnavailable(why) => format!("log stream for {} ended: {}", service, why),
                _ => "daemon is shutting down".to_string(),
            };
            Response::error(ErrorKind::StreamUnavailable, message)
        }
        StreamEnd::Revoked(e) => {
            info!("Closing log stream {} for {}: {}", request_id, service, e);
            events
                .send(ServerEvent::StreamState {
                    request_id,
                    state: StreamState::Unauthorized,
                })
                .await;
            auth_error(e)
        }
    }
}
