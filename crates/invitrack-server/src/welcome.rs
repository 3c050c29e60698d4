use invitrack_core::events::TrackerEvent;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const WELCOME_TEMPLATE: &str = "{user} joined server {server} via {invite}";

pub fn spawn_welcome_logger(
    mut rx: broadcast::Receiver<TrackerEvent>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Welcome logger started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("Welcome logger shutting down");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "welcome logger fell behind, events lost");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn handle_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::InviteUpdate {
            member, ambiguous, ..
        } => {
            if member.bot {
                return;
            }
            if let Some(line) = render_welcome(event) {
                tracing::info!(
                    server_id = member.server_id,
                    user_id = member.user_id,
                    "{}",
                    line
                );
            }
            if !ambiguous.is_empty() {
                let codes: Vec<&str> = ambiguous.iter().map(|i| i.code.as_str()).collect();
                tracing::debug!(
                    server_id = member.server_id,
                    candidates = ?codes,
                    "several invites were used at once"
                );
            }
        }
        TrackerEvent::InviteExpired { invite } => {
            tracing::debug!(server_id = invite.server_id, code = %invite.code, "invite expired");
        }
        _ => {}
    }
}

/// Human-readable line for an `invite_update` event.
pub fn render_welcome(event: &TrackerEvent) -> Option<String> {
    let TrackerEvent::InviteUpdate { member, invite, .. } = event else {
        return None;
    };

    let user = member
        .username
        .clone()
        .unwrap_or_else(|| member.user_id.to_string());
    let invite = match invite {
        Some(invite) => match invite.inviter_id {
            Some(inviter) => format!("invite {} from {}", invite.code, inviter),
            None => format!("invite {}", invite.code),
        },
        None => "unknown invite".to_string(),
    };

    Some(
        WELCOME_TEMPLATE
            .replace("{user}", &user)
            .replace("{server}", &member.server_id.to_string())
            .replace("{invite}", &invite),
    )
}
