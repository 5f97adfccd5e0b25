//! WebSocket session state machine
//!
//! Opened → first frame must be `authentication` (within the configured
//! timeout) → Authenticated → `subscribe` frames attach the socket to stream
//! channels → Closed removes every subscription. Writes to one socket are
//! strictly ordered through its writer task; every response carries `replyTo`.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    api::ApiContext,
    clock::Clock,
    config::PushConfig,
    model::ActivityFormat,
    push::channels::PushChannels,
    push::frames::{
        push_channel, AuthenticationPayload, ClientFrame, ServerFrame, SubscribePayload,
    },
    registry::Registry,
    signing::verify_expiring_signature,
    tenant::TenantService,
};

/// The push service: authenticates sockets and manages their subscriptions
pub struct PushService {
    registry: Arc<Registry>,
    tenants: Arc<dyn TenantService>,
    clock: Arc<dyn Clock>,
    channels: Arc<PushChannels>,
    config: PushConfig,
}

impl PushService {
    /// Create a push service
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        tenants: Arc<dyn TenantService>,
        clock: Arc<dyn Clock>,
        channels: Arc<PushChannels>,
        config: PushConfig,
    ) -> Self {
        Self {
            registry,
            tenants,
            clock,
            channels,
            config,
        }
    }

    /// Drive one socket through its lifecycle
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let connection_id = Uuid::new_v4();
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.channel_capacity);

        // All writes to the socket flow through one task, so they are
        // strictly ordered
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        if let Some(ctx) = self.authenticate(&mut stream, &tx).await {
            tracing::debug!(
                connection_id = %connection_id,
                user_id = ctx.user_id.as_deref().unwrap_or_default(),
                "Push socket authenticated"
            );
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        let response = self
                            .process_frame(&ctx, connection_id, &text, &tx)
                            .await;
                        send_frame(&tx, &response).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }

        self.channels.remove_connection(connection_id);
        drop(tx);
        let _ = writer.await;
        tracing::debug!(connection_id = %connection_id, "Push socket closed");
    }

    /// Wait for the authentication frame, closing on timeout or rejection
    async fn authenticate(
        &self,
        stream: &mut SplitStream<WebSocket>,
        tx: &mpsc::Sender<Message>,
    ) -> Option<ApiContext> {
        let deadline =
            tokio::time::sleep(Duration::from_secs(self.config.authentication_timeout_secs));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => {
                    send_frame(
                        tx,
                        &ServerFrame::error(json!(0), 400, "authentication timeout"),
                    )
                    .await;
                    return None;
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let (response, ctx) = self.verify_authentication_frame(&text).await;
                            send_frame(tx, &response).await;
                            return ctx;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Check the first frame: it must be a valid authentication frame whose
    /// signature verifies against the tenant's signing key
    pub async fn verify_authentication_frame(
        &self,
        text: &str,
    ) -> (ServerFrame, Option<ApiContext>) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                return (
                    ServerFrame::error(json!(0), 400, "malformed frame"),
                    None,
                );
            }
        };

        if frame.name != "authentication" {
            return (
                ServerFrame::error(frame.id, 400, "first frame must be authentication"),
                None,
            );
        }

        let payload: AuthenticationPayload = match serde_json::from_value(frame.payload) {
            Ok(payload) => payload,
            Err(_) => {
                return (
                    ServerFrame::error(frame.id, 400, "malformed authentication payload"),
                    None,
                );
            }
        };

        let tenant = match self.tenants.get_tenant(&payload.tenant_alias).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                return (
                    ServerFrame::error(frame.id, 401, "unknown tenant"),
                    None,
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Tenant lookup failed during push authentication");
                return (ServerFrame::error(frame.id, 500, "storage"), None);
            }
        };

        if let Err(e) = verify_expiring_signature(
            &tenant.signing_key,
            &payload.user_id,
            &payload.signature,
            self.clock.now_millis(),
        ) {
            return (ServerFrame::error(frame.id, e.code(), "invalid signature"), None);
        }

        let ctx = ApiContext {
            user_id: Some(payload.user_id),
            tenant_alias: Some(payload.tenant_alias),
            is_admin: false,
        };
        (ServerFrame::ok(frame.id), Some(ctx))
    }

    /// Handle one frame of an authenticated socket
    pub async fn process_frame(
        &self,
        ctx: &ApiContext,
        connection_id: Uuid,
        text: &str,
        tx: &mpsc::Sender<Message>,
    ) -> ServerFrame {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => return ServerFrame::error(json!(0), 400, "malformed frame"),
        };

        match frame.name.as_str() {
            "subscribe" => {
                let payload: SubscribePayload = match serde_json::from_value(frame.payload) {
                    Ok(payload) => payload,
                    Err(_) => {
                        return ServerFrame::error(frame.id, 400, "malformed subscribe payload");
                    }
                };
                self.handle_subscribe(ctx, connection_id, frame.id, payload, tx)
                    .await
            }
            "authentication" => {
                ServerFrame::error(frame.id, 400, "already authenticated")
            }
            _ => ServerFrame::error(frame.id, 400, "unknown frame"),
        }
    }

    async fn handle_subscribe(
        &self,
        ctx: &ApiContext,
        connection_id: Uuid,
        frame_id: Value,
        payload: SubscribePayload,
        tx: &mpsc::Sender<Message>,
    ) -> ServerFrame {
        let Some(options) = self.registry.stream_type(&payload.stream.stream_type) else {
            return ServerFrame::error(
                frame_id,
                404,
                format!("unknown stream type {}", payload.stream.stream_type),
            );
        };

        let format = match payload.format.as_deref() {
            None => ActivityFormat::Internal,
            Some(name) => match ActivityFormat::parse(name) {
                Some(format) => format,
                None => {
                    return ServerFrame::error(frame_id, 400, format!("unknown format {}", name));
                }
            },
        };

        if let Err(e) = options
            .authorizer
            .authorize(ctx, &payload.stream.resource_id, payload.token.as_ref())
            .await
        {
            return ServerFrame::error(frame_id, e.code(), "subscription not authorized");
        }

        let channel = push_channel(&payload.stream.resource_id, &payload.stream.stream_type);
        match self
            .channels
            .subscribe(&channel, connection_id, format, tx.clone())
            .await
        {
            Ok(()) => ServerFrame::ok(frame_id),
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Channel subscription failed");
                ServerFrame::error(frame_id, 500, "storage")
            }
        }
    }
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into())).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server frame");
        }
    }
}
