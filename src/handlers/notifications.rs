use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::AuthenticatedUser;
use crate::notifications::Notification;
use crate::AppState;

fn to_sse(notification: Notification) -> Option<Event> {
    let name = notification.payload.event_name();
    match Event::default().event(name).json_data(&notification) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, event = name, "Failed to encode notification");
            None
        }
    }
}

/// Server-sent events carrying the caller's purchase and payment notifications
#[utoipa::path(
    get,
    path = "/api/v1/notifications/stream",
    summary = "Notification stream",
    responses(
        (status = 200, description = "text/event-stream of notifications", body = Notification, content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid identity", body = crate::errors::ErrorResponse),
    ),
    tag = "notifications"
)]
pub async fn notification_stream(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(user_id = %user.user_id, "Notification stream opened");

    let stream = state
        .notifications
        .user_stream(user.user_id)
        .filter_map(|notification| async move { to_sse(notification).map(Ok) });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

pub fn notification_routes() -> Router<AppState> {
    Router::new().route("/stream", get(notification_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn encodes_notifications_as_named_events() {
        let event = to_sse(Notification::payment_status(
            Uuid::new_v4(),
            "pay_1",
            "completed",
            json!({"amount": 2500}),
        ));
        assert!(event.is_some());
    }
}
