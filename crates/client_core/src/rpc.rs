use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{ChannelId, MentionId, MessageId},
    error::{ApiError, FrameworkErrorBody},
    protocol::{ChannelListResponse, ChannelMembersResponse, Mention, Message, MessagePage, UnreadCount},
};
use tracing::{debug, warn};

use crate::{
    config::Settings,
    error::{ClientError, ClientResult},
};

pub const GET_CHANNEL_LIST: &str = "raven.api.raven_channel.get_all_channels";
pub const GET_UNREAD_COUNTS: &str = "raven.api.raven_message.get_unread_count_for_channels";
pub const GET_MESSAGES: &str = "raven.api.chat_stream.get_messages";
pub const GET_OLDER_MESSAGES: &str = "raven.api.chat_stream.get_older_messages";
pub const GET_NEWER_MESSAGES: &str = "raven.api.chat_stream.get_newer_messages";
pub const GET_MENTIONS: &str = "raven.api.mentions.get_mentions";
pub const MARK_MENTION_READ: &str = "raven.api.mentions.mark_mention_as_read";
pub const HIDE_MENTION: &str = "raven.api.mentions.hide_mention";
pub const GET_CHANNEL_MEMBERS: &str = "raven.api.chat.get_channel_members";
pub const SEARCH_MESSAGES: &str = "raven.api.search.get_search_result";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageCursor {
    Latest,
    OlderThan(MessageId),
    NewerThan(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePageRequest {
    pub channel_id: ChannelId,
    pub cursor: MessageCursor,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionFlag {
    Read,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchQuery {
    pub text: String,
    pub channel_id: Option<ChannelId>,
}

/// Typed view of the backend's RPC surface. The session depends on this seam
/// rather than on HTTP directly.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn channel_list(&self, hide_archived: bool) -> ClientResult<ChannelListResponse>;
    async fn unread_counts(&self) -> ClientResult<Vec<UnreadCount>>;
    async fn messages(&self, request: &MessagePageRequest) -> ClientResult<MessagePage>;
    async fn mentions(&self, start: u32, limit: u32) -> ClientResult<Vec<Mention>>;
    async fn set_mention_flag(&self, mention_id: &MentionId, flag: MentionFlag) -> ClientResult<()>;
    async fn channel_members(&self, channel_id: &ChannelId) -> ClientResult<ChannelMembersResponse>;
    async fn search(&self, query: &SearchQuery, start: u32, limit: u32) -> ClientResult<Vec<Message>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Deserialize)]
struct MethodResponse<T> {
    message: T,
}

#[derive(Serialize)]
struct HideArchivedParams {
    hide_archived: bool,
}

#[derive(Serialize)]
struct LatestMessagesParams<'a> {
    channel_id: &'a ChannelId,
    limit: u32,
}

#[derive(Serialize)]
struct AdjacentMessagesParams<'a> {
    channel_id: &'a ChannelId,
    from_message: &'a MessageId,
    limit: u32,
}

#[derive(Serialize)]
struct OffsetParams {
    limit: u32,
    start: u32,
}

#[derive(Serialize)]
struct MentionParams<'a> {
    mention_id: &'a MentionId,
}

#[derive(Serialize)]
struct ChannelParams<'a> {
    channel_id: &'a ChannelId,
}

#[derive(Serialize)]
struct SearchParams<'a> {
    search_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_id: Option<&'a ChannelId>,
    limit: u32,
    start: u32,
}

/// `ChatBackend` over the framework's `/api/method/<name>` endpoints.
pub struct HttpChatBackend {
    http: Client,
    server_url: String,
    auth_header: Option<String>,
    retry: RetryPolicy,
}

impl HttpChatBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth_header: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut backend = Self::new(settings.server_url.clone());
        backend.auth_header = settings.auth_header();
        backend.retry = RetryPolicy {
            attempts: settings.rpc_retry_attempts.max(1),
            delay: settings.rpc_retry_delay(),
        };
        backend
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get<P, T>(&self, method: &str, params: &P) -> ClientResult<T>
    where
        P: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.call_with_retry(Method::GET, method, params).await
    }

    async fn post<P, T>(&self, method: &str, params: &P) -> ClientResult<T>
    where
        P: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.call_with_retry(Method::POST, method, params).await
    }

    async fn call_with_retry<P, T>(&self, verb: Method, method: &str, params: &P) -> ClientResult<T>
    where
        P: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(verb.clone(), method, params).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        method,
                        attempt,
                        max_attempts = self.retry.attempts,
                        "rpc: transient failure, retrying: {err}"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once<P, T>(&self, verb: Method, method: &str, params: &P) -> ClientResult<T>
    where
        P: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/api/method/{method}", self.server_url);
        let transport = |source| ClientError::Transport {
            method: method.to_string(),
            source,
        };

        let mut request = self.http.request(verb.clone(), url);
        request = if verb == Method::GET {
            request.query(params)
        } else {
            request.json(params)
        };
        if let Some(auth) = &self.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        debug!(method, status = status.as_u16(), bytes = body.len(), "rpc: response");

        if !status.is_success() {
            let framework = serde_json::from_slice::<FrameworkErrorBody>(&body).unwrap_or_default();
            return Err(ClientError::Api {
                method: method.to_string(),
                status: status.as_u16(),
                error: ApiError::from_framework(status.as_u16(), &framework),
            });
        }

        serde_json::from_slice::<MethodResponse<T>>(&body)
            .map(|envelope| envelope.message)
            .map_err(|source| ClientError::Decode {
                method: method.to_string(),
                source,
            })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn channel_list(&self, hide_archived: bool) -> ClientResult<ChannelListResponse> {
        self.get(GET_CHANNEL_LIST, &HideArchivedParams { hide_archived })
            .await
    }

    async fn unread_counts(&self) -> ClientResult<Vec<UnreadCount>> {
        self.get(GET_UNREAD_COUNTS, &[] as &[(&str, &str)]).await
    }

    async fn messages(&self, request: &MessagePageRequest) -> ClientResult<MessagePage> {
        match &request.cursor {
            MessageCursor::Latest => {
                self.get(
                    GET_MESSAGES,
                    &LatestMessagesParams {
                        channel_id: &request.channel_id,
                        limit: request.limit,
                    },
                )
                .await
            }
            MessageCursor::OlderThan(from_message) => {
                self.get(
                    GET_OLDER_MESSAGES,
                    &AdjacentMessagesParams {
                        channel_id: &request.channel_id,
                        from_message,
                        limit: request.limit,
                    },
                )
                .await
            }
            MessageCursor::NewerThan(from_message) => {
                self.get(
                    GET_NEWER_MESSAGES,
                    &AdjacentMessagesParams {
                        channel_id: &request.channel_id,
                        from_message,
                        limit: request.limit,
                    },
                )
                .await
            }
        }
    }

    async fn mentions(&self, start: u32, limit: u32) -> ClientResult<Vec<Mention>> {
        self.get(GET_MENTIONS, &OffsetParams { limit, start }).await
    }

    async fn set_mention_flag(&self, mention_id: &MentionId, flag: MentionFlag) -> ClientResult<()> {
        let method = match flag {
            MentionFlag::Read => MARK_MENTION_READ,
            MentionFlag::Hidden => HIDE_MENTION,
        };
        let _: Option<serde_json::Value> = self.post(method, &MentionParams { mention_id }).await?;
        Ok(())
    }

    async fn channel_members(&self, channel_id: &ChannelId) -> ClientResult<ChannelMembersResponse> {
        self.get(GET_CHANNEL_MEMBERS, &ChannelParams { channel_id })
            .await
    }

    async fn search(&self, query: &SearchQuery, start: u32, limit: u32) -> ClientResult<Vec<Message>> {
        self.get(
            SEARCH_MESSAGES,
            &SearchParams {
                search_text: &query.text,
                channel_id: query.channel_id.as_ref(),
                limit,
                start,
            },
        )
        .await
    }
}

/// Backend used before a server is configured; every call fails.
pub struct MissingChatBackend;

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn channel_list(&self, _hide_archived: bool) -> ClientResult<ChannelListResponse> {
        Err(missing(GET_CHANNEL_LIST))
    }

    async fn unread_counts(&self) -> ClientResult<Vec<UnreadCount>> {
        Err(missing(GET_UNREAD_COUNTS))
    }

    async fn messages(&self, _request: &MessagePageRequest) -> ClientResult<MessagePage> {
        Err(missing(GET_MESSAGES))
    }

    async fn mentions(&self, _start: u32, _limit: u32) -> ClientResult<Vec<Mention>> {
        Err(missing(GET_MENTIONS))
    }

    async fn set_mention_flag(&self, _mention_id: &MentionId, _flag: MentionFlag) -> ClientResult<()> {
        Err(missing(MARK_MENTION_READ))
    }

    async fn channel_members(&self, _channel_id: &ChannelId) -> ClientResult<ChannelMembersResponse> {
        Err(missing(GET_CHANNEL_MEMBERS))
    }

    async fn search(&self, _query: &SearchQuery, _start: u32, _limit: u32) -> ClientResult<Vec<Message>> {
        Err(missing(SEARCH_MESSAGES))
    }
}

fn missing(method: &str) -> ClientError {
    ClientError::Config(format!("no backend configured for {method}"))
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
