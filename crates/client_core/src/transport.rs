//! Socket.io websocket pump feeding realtime envelopes into a [`ChatSession`].

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use shared::domain::ChannelId;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    decoder::{parse_frame, Frame},
    error::ClientError,
    session::{ChatSession, SessionEvent},
};

const ENGINE_IO_OPEN_PREFIX: char = '0';
const SOCKET_IO_CONNECT: &str = "40";
const SUBSCRIBE_EVENT: &str = "doc_subscribe";
const UNSUBSCRIBE_EVENT: &str = "doc_unsubscribe";
/// Message events are published to the document room of their channel.
const CHANNEL_DOCTYPE: &str = "Raven Channel";

pub(crate) fn room_frame(event: &str, channel_id: &ChannelId) -> String {
    format!("42{}", json!([event, CHANNEL_DOCTYPE, channel_id.as_str()]))
}

/// Connects to the realtime endpoint and spawns the read loop. The task ends
/// when the server closes the socket or a send or receive fails.
pub async fn connect_realtime(
    session: &Arc<ChatSession>,
    settings: &Settings,
) -> Result<JoinHandle<()>> {
    let url = settings.realtime_endpoint()?;
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid realtime url: {url}"))?;
    if let Some(auth) = settings.auth_header() {
        let value = HeaderValue::from_str(&auth).context("invalid api credentials")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|err| ClientError::Realtime(format!("failed to connect websocket {url}: {err}")))?;
    info!(%url, "realtime: connected");
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let session = Arc::clone(session);
    let mut active = session.watch_active_channel();
    Ok(tokio::spawn(async move {
        let mut joined = false;
        let mut room: Option<ChannelId> = None;
        loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    let Some(msg) = msg else { break };
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            report(&session, format!("websocket receive failed: {err}"));
                            break;
                        }
                    };
                    if text.starts_with(ENGINE_IO_OPEN_PREFIX) {
                        if let Err(err) = ws_writer.send(Message::Text(SOCKET_IO_CONNECT.into())).await {
                            report(&session, format!("websocket handshake failed: {err}"));
                            break;
                        }
                        continue;
                    }
                    if text.starts_with(SOCKET_IO_CONNECT) {
                        joined = true;
                        let current = active.borrow_and_update().clone();
                        if let Err(err) = follow_room(&mut ws_writer, &mut room, current).await {
                            report(&session, err);
                            break;
                        }
                        continue;
                    }
                    match parse_frame(&text) {
                        Frame::Event(envelope) => session.handle_envelope(&envelope).await,
                        Frame::Ping { reply } => {
                            if let Err(err) = ws_writer.send(Message::Text(reply.into())).await {
                                report(&session, format!("websocket pong failed: {err}"));
                                break;
                            }
                        }
                        Frame::Ignored => {}
                    }
                }
                changed = active.changed(), if joined => {
                    if changed.is_err() {
                        break;
                    }
                    let current = active.borrow_and_update().clone();
                    if let Err(err) = follow_room(&mut ws_writer, &mut room, current).await {
                        report(&session, err);
                        break;
                    }
                }
            }
        }
        debug!("realtime: read loop finished");
    }))
}

/// Moves the room subscription to `target`, leaving the previous room first.
async fn follow_room<W>(
    writer: &mut W,
    room: &mut Option<ChannelId>,
    target: Option<ChannelId>,
) -> std::result::Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    if *room == target {
        return Ok(());
    }
    if let Some(previous) = room.take() {
        writer
            .send(Message::Text(room_frame(UNSUBSCRIBE_EVENT, &previous).into()))
            .await
            .map_err(|err| format!("websocket unsubscribe failed: {err}"))?;
    }
    if let Some(channel_id) = &target {
        writer
            .send(Message::Text(room_frame(SUBSCRIBE_EVENT, channel_id).into()))
            .await
            .map_err(|err| format!("websocket subscribe failed: {err}"))?;
        debug!(%channel_id, "realtime: subscribed to channel room");
    }
    *room = target;
    Ok(())
}

fn report(session: &ChatSession, message: String) {
    let err = ClientError::Realtime(message);
    warn!("realtime: {err}");
    session.emit(SessionEvent::Error(err.to_string()));
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
