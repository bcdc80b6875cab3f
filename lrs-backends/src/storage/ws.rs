//! `WsBackend` - Read-Only Websocket Stream
//!
//! `TigerStyle`: Forward-only, no sort, no cursor.
//!
//! Each message is one JSON statement. Filters, projection and limit are
//! applied as messages arrive; the stream ends when the server closes the
//! connection or the limit is reached.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::TcpStream;
use tracing::Instrument;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use lrs_core::eval::matches_all;
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    physical_id, Backend, BackendError, BackendResult, BackendStatus, Document, ListEntry, Query,
    Record, StatementQueryResult, StructuredQuery, WriteInput, WriteOptions,
};

use super::{failed, local_query};
use crate::config::WsSettings;
use crate::constants::WS_MESSAGE_BYTES_MAX;

const ENGINE: &str = "ws";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn read_only(operation: &str) -> BackendError {
    BackendError::parameter(format!("{ENGINE} is read-only and does not support {operation}"))
}

fn validate_url(url: &str) -> BackendResult<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(BackendError::parameter(format!(
            "websocket url must start with ws:// or wss://, got `{url}`"
        )))
    }
}

// =============================================================================
// WsBackend
// =============================================================================

/// Statements received from a websocket server.
#[derive(Debug)]
pub struct WsBackend {
    settings: WsSettings,
    closed: AtomicBool,
}

impl WsBackend {
    /// Create a backend for `settings.url`. Nothing connects until a read
    /// or a status probe.
    ///
    /// # Errors
    /// Returns `Parameter` if the URL is not a websocket URL.
    pub fn new(settings: WsSettings) -> BackendResult<Self> {
        validate_url(&settings.url)?;
        Ok(Self {
            settings,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the settings.
    #[must_use]
    pub fn settings(&self) -> &WsSettings {
        &self.settings
    }

    /// A target overrides the configured URL.
    fn url<'t>(&'t self, target: Option<&'t str>) -> BackendResult<&'t str> {
        let url = target.unwrap_or(&self.settings.url);
        validate_url(url)?;
        Ok(url)
    }

    async fn connect(&self, url: &str) -> BackendResult<Socket> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::connection("backend closed"));
        }
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(WS_MESSAGE_BYTES_MAX);
        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);

        match tokio::time::timeout(timeout, connect_async_with_config(url, Some(config), false))
            .await
        {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => {
                tracing::error!(url, error = %e, "failed to open websocket connection");
                Err(BackendError::connection(format!("{url}: {e}")))
            }
            Err(_) => Err(BackendError::connection(format!(
                "{url}: no connection after {}ms",
                self.settings.connect_timeout_ms
            ))),
        }
    }

    async fn probe(&self) -> Probe {
        match self.connect(&self.settings.url).await {
            Ok(mut socket) => {
                if let Err(e) = socket.close(None).await {
                    tracing::debug!(error = %e, "websocket close after probe failed");
                }
                Probe::Healthy
            }
            Err(e) => Probe::Unreachable(e.to_string()),
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// State of one read: the connection is opened on the first poll.
struct Listener<'a> {
    backend: &'a WsBackend,
    url: &'a str,
    query: Cow<'a, StructuredQuery>,
    socket: Option<Socket>,
    received: usize,
    yielded: usize,
}

impl Listener<'_> {
    fn decode(&self, payload: &[u8]) -> BackendResult<Document> {
        serde_json::from_slice(payload).map_err(|e| {
            BackendError::bad_format(format!("message {} from {}: {e}", self.received, self.url))
        })
    }

    fn record(&self, document: Document) -> Record {
        let id = match document.get("id").and_then(|id| id.as_str()) {
            Some(id) if !id.is_empty() => physical_id(id),
            _ => format!("message-{:010}", self.received),
        };
        let document = match &self.query.projection {
            Some(projection) => projection.apply(document),
            None => document,
        };
        Record::new(id, document)
    }

    async fn next_record(&mut self) -> BackendResult<Option<Record>> {
        if self.query.limit.is_some_and(|limit| self.yielded >= limit) {
            if let Some(mut socket) = self.socket.take() {
                if let Err(e) = socket.close(None).await {
                    tracing::debug!(error = %e, "websocket close after limit failed");
                }
            }
            return Ok(None);
        }
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.backend.connect(self.url).await?,
        };

        loop {
            let payload = match socket.next().await {
                None | Some(Ok(Message::Close(_))) => {
                    tracing::info!(url = self.url, received = self.received, "websocket stream ended");
                    return Ok(None);
                }
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::error!(url = self.url, error = %e, "failed to receive websocket message");
                    return Err(BackendError::engine(format!("{}: {e}", self.url)));
                }
            };
            self.received += 1;
            let document = self.decode(&payload)?;
            if matches_all(&document, &self.query.filters)? {
                self.yielded += 1;
                self.socket = Some(socket);
                return Ok(Some(self.record(document)));
            }
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

#[async_trait]
impl Backend for WsBackend {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn status(&self) -> BackendStatus {
        evaluate(ENGINE, self.probe().await, false)
    }

    fn list<'a>(
        &'a self,
        _target: Option<&'a str>,
        _details: bool,
        _new: bool,
    ) -> BoxStream<'a, BackendResult<ListEntry>> {
        failed(read_only("list"))
    }

    #[tracing::instrument(skip(self, query))]
    fn read<'a>(
        &'a self,
        query: &'a Query,
        target: Option<&'a str>,
        _chunk_size: Option<usize>,
    ) -> BoxStream<'a, BackendResult<Record>> {
        let structured = match local_query(ENGINE, query) {
            Ok(structured) => structured,
            Err(e) => return failed(e),
        };
        if !structured.sort.is_empty() || structured.cursor.is_some() {
            return failed(BackendError::parameter(format!(
                "{ENGINE} streams in arrival order and accepts no sort or cursor"
            )));
        }
        let url = match self.url(target) {
            Ok(url) => url,
            Err(e) => return failed(e),
        };

        let listener = Listener {
            backend: self,
            url,
            query: structured,
            socket: None,
            received: 0,
            yielded: 0,
        };
        let span = tracing::Span::current();
        stream::try_unfold(listener, move |mut listener| {
            async move {
                let record = listener.next_record().await?;
                Ok::<_, BackendError>(record.map(|record| (record, listener)))
            }
            .instrument(span.clone())
        })
        .boxed()
    }

    async fn write(
        &self,
        _data: BoxStream<'_, WriteInput>,
        _options: &WriteOptions,
    ) -> BackendResult<usize> {
        Err(read_only("write"))
    }

    async fn query_statements(
        &self,
        _query: &StructuredQuery,
        _target: Option<&str>,
    ) -> BackendResult<StatementQueryResult> {
        Err(read_only("query_statements"))
    }

    async fn query_statements_by_ids(
        &self,
        _ids: &[String],
        _target: Option<&str>,
    ) -> BackendResult<Vec<Record>> {
        Err(read_only("query_statements_by_ids"))
    }

    async fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, TryStreamExt};
    use lrs_core::{Direction, Operation};
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Serve `messages` to the first client, then close.
    async fn serve(messages: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for message in messages {
                if socket.send(Message::text(message)).await.is_err() {
                    return;
                }
            }
            let _ = socket.close(None).await;
        });
        format!("ws://{addr}")
    }

    fn statements() -> Vec<String> {
        vec![
            json!({"id": "a", "verb": {"id": "completed"}}).to_string(),
            json!({"id": "b", "verb": {"id": "started"}}).to_string(),
            json!({"id": "c", "verb": {"id": "completed"}}).to_string(),
            json!({"id": "d", "verb": {"id": "completed"}}).to_string(),
        ]
    }

    #[tokio::test]
    async fn test_read_until_server_closes() {
        let url = serve(statements()).await;
        let backend = WsBackend::new(WsSettings::default().with_url(url)).unwrap();

        let records: Vec<Record> = backend
            .read(&Query::default(), None, None)
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&str> = records.iter().filter_map(Record::logical_id).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(records[0].id, physical_id("a"));
    }

    #[tokio::test]
    async fn test_read_filters_and_limit() {
        let url = serve(statements()).await;
        let backend = WsBackend::new(WsSettings::default()).unwrap();

        let query = Query::builder()
            .eq("verb.id", "completed")
            .limit(2)
            .build()
            .unwrap();
        let records: Vec<Record> = backend
            .read(&query, Some(&url), None)
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&str> = records.iter().filter_map(Record::logical_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_malformed_message_is_bad_format() {
        let url = serve(vec!["{\"id\":\"a\"}".into(), "nope".into()]).await;
        let backend = WsBackend::new(WsSettings::default().with_url(url)).unwrap();

        let items: Vec<BackendResult<Record>> =
            backend.read(&Query::default(), None, None).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(
            items[1].as_ref().unwrap_err().kind(),
            lrs_core::ErrorKind::BadFormat
        );
    }

    #[tokio::test]
    async fn test_sort_is_parameter_error() {
        let backend = WsBackend::new(WsSettings::default()).unwrap();
        let query = Query::builder()
            .sort("timestamp", Direction::Asc)
            .build()
            .unwrap();
        let result: BackendResult<Vec<Record>> =
            backend.read(&query, None, None).try_collect().await;
        assert!(result.unwrap_err().is_parameter());
    }

    #[tokio::test]
    async fn test_write_and_list_are_rejected() {
        let backend = WsBackend::new(WsSettings::default()).unwrap();
        let options = WriteOptions::default().with_operation(Operation::Index);
        let err = backend
            .write(stream::iter(Vec::<WriteInput>::new()).boxed(), &options)
            .await
            .unwrap_err();
        assert!(err.is_parameter());

        let listed: BackendResult<Vec<ListEntry>> =
            backend.list(None, false, false).try_collect().await;
        assert!(listed.unwrap_err().is_parameter());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let err = WsBackend::new(WsSettings::default().with_url("http://localhost")).unwrap_err();
        assert!(err.is_parameter());
    }

    #[tokio::test]
    async fn test_status_away_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = WsSettings::default()
            .with_url(format!("ws://{addr}"))
            .with_connect_timeout_ms(500);
        let backend = WsBackend::new(settings).unwrap();
        assert_eq!(backend.status().await, BackendStatus::Away);
    }
}
