use std::sync::Arc;

use poem::http::StatusCode;
use poem::web::Data;
use poem::{handler, Body, Request, Response};
use tracing::debug;

use crate::controller::{Controller, WebhookError};

/// Raw-body webhook ingress. The HMAC is computed over the exact bytes as
/// received, so this handler never re-serializes the payload.
#[handler]
pub async fn handle_webhook(
    req: &Request,
    body: Body,
    Data(controller): Data<&Arc<Controller>>,
) -> poem::Result<Response> {
    let raw = body
        .into_bytes()
        .await
        .map_err(|e| poem::Error::from_string(e.to_string(), StatusCode::BAD_REQUEST))?;

    let event_type = req
        .header("X-GitHub-Event")
        .or_else(|| req.header("X-Gitea-Event"))
        .unwrap_or_default()
        .to_string();
    let signature = req
        .header("X-Hub-Signature-256")
        .map(|s| s.to_string());

    match controller
        .dispatch_webhook(&event_type, signature.as_deref(), &raw)
        .await
    {
        Ok(()) => Ok(Response::builder().status(StatusCode::OK).finish()),
        Err(WebhookError::BadSignature) => Ok(Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body("signature verification failed")),
        Err(WebhookError::UnknownEntity) => {
            debug!("webhook for unknown entity");
            Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body("no entity matches this delivery"))
        }
        Err(WebhookError::Busy) => Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body("event queue is full, please redeliver")),
        Err(WebhookError::Invalid(message)) => Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(message)),
        Err(WebhookError::Internal(message)) => Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(message)),
    }
}
