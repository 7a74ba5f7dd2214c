use axum::{extract::State, Json};
use live_proto::{NotificationRecord, Scope};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{ApiError, ApiResult, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationsRequest {
    pub recipient_ids: Vec<String>,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptFriendRequest {
    pub requester_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub recipient_id: String,
    pub body: String,
}

pub async fn create_notifications(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateNotificationsRequest>,
) -> ApiResult<Vec<NotificationRecord>> {
    if request.kind.trim().is_empty() {
        return Err(ApiError::BadRequest("kind is required".into()));
    }
    let mut recipients: Vec<String> = request
        .recipient_ids
        .into_iter()
        .filter(|id| !id.trim().is_empty())
        .collect();
    recipients.sort();
    recipients.dedup();
    if recipients.is_empty() {
        return Err(ApiError::BadRequest("at least one recipient is required".into()));
    }

    let mut records = Vec::with_capacity(recipients.len());
    for recipient in &recipients {
        let record = state
            .store
            .create_notification(Scope::Notifications, recipient, &request.kind, request.data.clone())
            .await?;
        records.push(record);
    }
    let delivered = state.fanout.notify_all(Scope::Notifications, records.clone());
    info!(
        target = "live.routes",
        sender = user.id(),
        kind = %request.kind,
        recipients = recipients.len(),
        delivered,
        "notifications created"
    );
    Ok(Json(records))
}

/// The session user accepts `requester_id`'s friend request; both users are notified.
pub async fn accept_friend_request(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<AcceptFriendRequest>,
) -> ApiResult<Vec<NotificationRecord>> {
    let requester = request.requester_id.trim();
    if requester.is_empty() || requester == user.id() {
        return Err(ApiError::BadRequest("requesterId must name another user".into()));
    }

    let to_requester = state
        .store
        .create_notification(
            Scope::Notifications,
            requester,
            "friend_request_accepted",
            json!({ "friendId": user.id() }),
        )
        .await?;
    let to_accepter = state
        .store
        .create_notification(
            Scope::Notifications,
            user.id(),
            "friend_added",
            json!({ "friendId": requester }),
        )
        .await?;

    let records = vec![to_requester, to_accepter];
    state.fanout.notify_all(Scope::Notifications, records.clone());
    Ok(Json(records))
}

/// Stores the message for both participants and pushes it to both `messages` sessions.
pub async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Vec<NotificationRecord>> {
    let recipient = request.recipient_id.trim();
    if recipient.is_empty() {
        return Err(ApiError::BadRequest("recipientId is required".into()));
    }
    if request.body.trim().is_empty() {
        return Err(ApiError::BadRequest("message body is empty".into()));
    }

    let data = json!({
        "senderId": user.id(),
        "recipientId": recipient,
        "body": request.body,
    });
    let mut records = vec![
        state
            .store
            .create_notification(Scope::Messages, recipient, "message_received", data.clone())
            .await?,
    ];
    if recipient != user.id() {
        records.push(
            state
                .store
                .create_notification(Scope::Messages, user.id(), "message_sent", data)
                .await?,
        );
    }
    state.fanout.notify_all(Scope::Messages, records.clone());
    Ok(Json(records))
}
