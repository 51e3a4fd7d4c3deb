/// Portal REST client (hyper 1 / hyper-util legacy client)
///
/// Endpoints:
///   POST   /api/conversations/:id/messages        body: SendMessageRequest
///   GET    /api/conversations/:id/messages        ?before_ts=RFC3339&before_id=..&limit=N
///   POST   /api/conversations/:id/typing          body: {"is_typing": bool}
///   GET    /api/notifications                     ?before=<id>&limit=N
///   GET    /api/notifications/unread-count
///   POST   /api/notifications/:id/read
///   POST   /api/notifications/read-all
///   DELETE /api/notifications/:id
use crate::config::Config;
use crate::error::{RealtimeError, Result};
use crate::messenger_types::{
    HistoryCursor, HistoryPage, MessageRecord, NotificationPage, SendMessageRequest, UnreadCount,
};
use crate::session::SessionHandle;
use crate::transport::PortalApi;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

pub(crate) type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub(crate) fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

#[derive(Serialize)]
struct TypingBody {
    is_typing: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpPortalApi {
    client: HttpClient,
    base_url: String,
    session: SessionHandle,
    request_timeout: Duration,
}

impl HttpPortalApi {
    pub fn new(config: &Config, session: SessionHandle) -> Self {
        Self {
            client: build_client(),
            base_url: config.api_base_url.clone(),
            session,
            request_timeout: config.request_timeout,
        }
    }

    async fn call<B, T>(&self, method: Method, path_and_query: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let bytes = self.call_raw(method, path_and_query, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn call_raw<B>(&self, method: Method, path_and_query: &str, body: Option<&B>) -> Result<Bytes>
    where
        B: Serialize + ?Sized + Sync,
    {
        let session = self.session.current().ok_or(RealtimeError::NoSession)?;
        let uri = format!("{}{}", self.base_url, path_and_query);
        let payload = match body {
            Some(b) => Bytes::from(serde_json::to_vec(b)?),
            None => Bytes::new(),
        };

        let request = Request::builder()
            .method(method.clone())
            .uri(uri.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {}", session.token))
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| RealtimeError::Http(format!("Invalid request {}: {}", uri, e)))?;

        debug!("{} {}", method, path_and_query);
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| RealtimeError::Http(e.to_string()))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RealtimeError::Http(e.to_string()))?
                .to_bytes();
            Ok::<_, RealtimeError>((status, body))
        };

        let (status, body) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| RealtimeError::Timeout(format!("{} {}", method, path_and_query)))??;

        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(body)
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> RealtimeError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| {
            let text = String::from_utf8_lossy(body).trim().to_string();
            if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            }
        });
    RealtimeError::Api {
        status: status.as_u16(),
        message,
    }
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

fn history_path(conversation_id: &str, before: Option<&HistoryCursor>, limit: usize) -> String {
    let mut path = format!(
        "/api/conversations/{}/messages?limit={}",
        encode(conversation_id),
        limit
    );
    if let Some(cursor) = before {
        path.push_str(&format!(
            "&before_ts={}&before_id={}",
            encode(&cursor.before_timestamp.to_rfc3339()),
            encode(&cursor.before_id)
        ));
    }
    path
}

fn notifications_path(before: Option<&str>, limit: usize) -> String {
    let mut path = format!("/api/notifications?limit={}", limit);
    if let Some(id) = before {
        path.push_str(&format!("&before={}", encode(id)));
    }
    path
}

#[async_trait]
impl PortalApi for HttpPortalApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessageRecord> {
        let path = format!("/api/conversations/{}/messages", encode(&request.conversation_id));
        self.call(Method::POST, &path, Some(request)).await
    }

    async fn fetch_history(
        &self,
        conversation_id: &str,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let path = history_path(conversation_id, before, limit);
        self.call::<(), _>(Method::GET, &path, None).await
    }

    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        let path = format!("/api/conversations/{}/typing", encode(conversation_id));
        self.call_raw(Method::POST, &path, Some(&TypingBody { is_typing }))
            .await
            .map(|_| ())
    }

    async fn fetch_notifications(&self, before: Option<&str>, limit: usize) -> Result<NotificationPage> {
        let path = notifications_path(before, limit);
        self.call::<(), _>(Method::GET, &path, None).await
    }

    async fn fetch_unread_count(&self) -> Result<u32> {
        let count: UnreadCount = self
            .call::<(), _>(Method::GET, "/api/notifications/unread-count", None)
            .await?;
        Ok(count.unread_count)
    }

    async fn mark_notification_read(&self, id: &str) -> Result<u32> {
        let path = format!("/api/notifications/{}/read", encode(id));
        let count: UnreadCount = self.call::<(), _>(Method::POST, &path, None).await?;
        Ok(count.unread_count)
    }

    async fn mark_all_notifications_read(&self) -> Result<u32> {
        let count: UnreadCount = self
            .call::<(), _>(Method::POST, "/api/notifications/read-all", None)
            .await?;
        Ok(count.unread_count)
    }

    async fn delete_notification(&self, id: &str) -> Result<u32> {
        let path = format!("/api/notifications/{}", encode(id));
        let count: UnreadCount = self.call::<(), _>(Method::DELETE, &path, None).await?;
        Ok(count.unread_count)
    }
}
