use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Url};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bilty_core::repository::ChangeFeed;
use bilty_core::{ReservationEvent, RetryPolicy};

const EVENT_NAME: &str = "reservation";

/// Live-hold change feed read from the server's SSE endpoint.
///
/// The stream reconnects on its own with backoff and never ends. Events sent
/// while it was disconnected are not replayed; reload `live_holds` after a
/// gap if the view must be exact.
#[derive(Clone)]
pub struct HttpChangeFeed {
    client: Client,
    base_url: String,
    token: String,
    session_id: Option<String>,
    retry: RetryPolicy,
}

impl HttpChangeFeed {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            session_id: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Holds owned by this session come back unmasked.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

type Body = BoxStream<'static, reqwest::Result<Vec<u8>>>;

struct Connection {
    feed: HttpChangeFeed,
    branch_id: Uuid,
    body: Option<Body>,
    buffer: Vec<u8>,
    pending: VecDeque<ReservationEvent>,
    failures: u32,
}

// Takes owned inputs: `Connection` holds a boxed stream and is not `Sync`.
async fn open(feed: HttpChangeFeed, branch_id: Uuid) -> Result<Body, String> {
    let base = format!("{}/v1/branches/{}/holds/stream", feed.base_url, branch_id);
    let params: Vec<(&str, &str)> = feed
        .session_id
        .as_deref()
        .map(|s| vec![("session_id", s)])
        .unwrap_or_default();
    let url = Url::parse_with_params(&base, &params).map_err(|e| format!("bad URL {}: {}", base, e))?;
    let request = feed
        .client
        .get(url)
        .bearer_auth(&feed.token)
        .header("Accept", "text/event-stream");

    let response = request
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| e.to_string())?;
    Ok(response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
        .boxed())
}

impl Connection {
    fn absorb(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(end) = frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end).collect();
            let text = String::from_utf8_lossy(&frame);
            if let Some(event) = parse_frame(&text) {
                self.pending.push_back(event);
            }
        }
    }

    async fn next_event(mut self) -> Option<(ReservationEvent, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((event, self));
            }

            match self.body.as_mut() {
                None => match open(self.feed.clone(), self.branch_id).await {
                    Ok(body) => {
                        info!("Subscribed to live holds for branch {}", self.branch_id);
                        self.body = Some(body);
                        self.buffer.clear();
                        self.failures = 0;
                    }
                    Err(e) => {
                        let delay = self.feed.retry.delay_for(self.failures);
                        self.failures = self.failures.saturating_add(1);
                        warn!("Live hold stream connect failed ({}), retrying in {:?}", e, delay);
                        sleep(delay).await;
                    }
                },
                Some(body) => match body.next().await {
                    Some(Ok(chunk)) => self.absorb(&chunk),
                    Some(Err(e)) => {
                        warn!("Live hold stream broke: {}", e);
                        self.body = None;
                    }
                    None => {
                        debug!("Live hold stream closed by server, reconnecting");
                        self.body = None;
                    }
                },
            }
        }
    }
}

/// Byte offset just past the first complete frame, if any.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Decode one SSE frame. Comments, keep-alives and other event types yield
/// nothing.
fn parse_frame(frame: &str) -> Option<ReservationEvent> {
    let mut name: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => name = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() || name.is_some_and(|n| n != EVENT_NAME) {
        return None;
    }

    match serde_json::from_str(&data.join("\n")) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping undecodable live hold event: {}", e);
            None
        }
    }
}

impl ChangeFeed for HttpChangeFeed {
    fn subscribe(&self, branch_id: Uuid) -> BoxStream<'static, ReservationEvent> {
        let connection = Connection {
            feed: self.clone(),
            branch_id,
            body: None,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            failures: 0,
        };
        stream::unfold(connection, Connection::next_event).boxed()
    }
}
