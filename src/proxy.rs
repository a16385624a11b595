//! Active DNS proxy.
//!
//! Devices pointed at this host (by DHCP option or by redirection) get a
//! plain forwarding resolver that logs every query before relaying it
//! upstream. Log-then-forward: the record exists even when the upstream
//! is down, and a store hiccup never blocks resolution.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::ignore::IgnoreList;
use crate::store::{NewQuery, QueryStore};

/// Maximum DNS message size over UDP.
pub const MAX_UDP_DNS_SIZE: usize = 512;

/// How long the proxy loop waits for a datagram before re-checking its
/// stop flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Trait for DNS resolution, so the handler can be tested without a
/// network.
pub trait DnsResolver: Send + Sync + Clone + 'static {
    fn resolve(&self, query: &Message) -> impl Future<Output = Result<Message>> + Send;
}

/// Forwarding resolver with a primary and an optional fallback upstream.
#[derive(Clone)]
pub struct UpstreamResolver {
    primary: SocketAddr,
    fallback: Option<SocketAddr>,
    timeout: Duration,
}

impl UpstreamResolver {
    pub const fn new(primary: SocketAddr, fallback: Option<SocketAddr>, timeout: Duration) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    async fn forward_to(&self, upstream: SocketAddr, query_bytes: &[u8]) -> Result<Message> {
        let exchange = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(upstream).await?;
            socket.send(query_bytes).await?;

            let mut response_buf = [0u8; MAX_UDP_DNS_SIZE];
            let len = socket.recv(&mut response_buf).await?;
            Ok::<_, Error>(Message::from_bytes(&response_buf[..len])?)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Upstream(format!("{upstream} timed out")))?
    }
}

impl DnsResolver for UpstreamResolver {
    async fn resolve(&self, query: &Message) -> Result<Message> {
        let query_bytes = query.to_bytes()?;

        let primary_err = match self.forward_to(self.primary, &query_bytes).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        match self.fallback {
            Some(fallback) => {
                warn!(
                    upstream = %self.primary,
                    error = %primary_err,
                    "primary upstream failed, trying fallback"
                );
                self.forward_to(fallback, &query_bytes).await
            }
            None => Err(primary_err),
        }
    }
}

/// Synthesize a SERVFAIL response echoing the query's id and questions.
pub fn servfail_response(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_response_code(ResponseCode::ServFail);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Logs queries and forwards them through a resolver.
pub struct QueryHandler<R: DnsResolver> {
    resolver: R,
    store: QueryStore,
    ignore: Arc<IgnoreList>,
}

impl<R: DnsResolver> QueryHandler<R> {
    pub fn new(resolver: R, store: QueryStore, ignore: Arc<IgnoreList>) -> Self {
        Self {
            resolver,
            store,
            ignore,
        }
    }

    /// Handle one query from `source`: log it, forward it, and always
    /// produce a response.
    #[instrument(skip(self, query), fields(domain))]
    pub async fn handle_query(&self, query: Message, source: SocketAddr) -> Message {
        if let Some(question) = query.queries().first() {
            let domain = question.name().to_string();
            tracing::Span::current().record("domain", domain.as_str());

            if !self.ignore.is_ignored(&domain) {
                let record = NewQuery::new(
                    source.ip().to_string(),
                    domain,
                    question.query_type().to_string(),
                );
                // The query must still resolve even if the log write fails.
                match self.store.append(&record) {
                    Ok(_) => {
                        metrics::counter!("lanscope_queries_total", "path" => "proxy")
                            .increment(1);
                    }
                    Err(e) => warn!(error = %e, "failed to log query"),
                }
            }
        }

        match self.resolver.resolve(&query).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "all upstreams failed");
                metrics::counter!("lanscope_upstream_failures_total").increment(1);
                servfail_response(&query)
            }
        }
    }
}

impl<R: DnsResolver> Clone for QueryHandler<R> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            store: self.store.clone(),
            ignore: Arc::clone(&self.ignore),
        }
    }
}

/// Run the proxy loop on an already-bound socket until the stop flag
/// flips.
///
/// Each datagram is handled on its own task so one slow upstream cannot
/// stall the receive loop.
pub async fn run_proxy<R: DnsResolver>(
    socket: UdpSocket,
    handler: QueryHandler<R>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let socket = Arc::new(socket);
    info!(listen = %socket.local_addr()?, "dns proxy running");

    let mut buf = [0u8; MAX_UDP_DNS_SIZE];
    while !stop.load(Ordering::SeqCst) {
        let (len, source) =
            match tokio::time::timeout(RECV_POLL_INTERVAL, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    warn!(error = %e, "recv failed");
                    continue;
                }
                Err(_) => continue,
            };

        let query = match Message::from_bytes(&buf[..len]) {
            Ok(query) => query,
            Err(e) => {
                debug!(%source, error = %e, "undecodable query");
                continue;
            }
        };

        let handler = handler.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let response = handler.handle_query(query, source).await;
            match response.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, source).await {
                        warn!(%source, error = %e, "failed to send response");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode response"),
            }
        });
    }

    info!("dns proxy stopped");
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::atomic::AtomicU64;

    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use tokio::sync::RwLock;

    /// Mock resolver with pre-configured responses and failure injection.
    #[derive(Clone, Default)]
    pub struct MockResolver {
        pub responses: Arc<RwLock<HashMap<Name, Message>>>,
        pub resolve_count: Arc<AtomicU64>,
        pub error: Arc<RwLock<Option<String>>>,
    }

    impl MockResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn add_response(&self, name: Name, response: Message) {
            self.responses.write().await.insert(name, response);
        }

        pub async fn set_error(&self, error: &str) {
            *self.error.write().await = Some(error.to_string());
        }

        pub fn resolve_count(&self) -> u64 {
            self.resolve_count.load(Ordering::SeqCst)
        }
    }

    impl DnsResolver for MockResolver {
        async fn resolve(&self, query: &Message) -> Result<Message> {
            self.resolve_count.fetch_add(1, Ordering::SeqCst);

            if let Some(error) = self.error.read().await.as_ref() {
                return Err(Error::Upstream(error.clone()));
            }

            if let Some(q) = query.queries().first() {
                if let Some(response) = self.responses.read().await.get(q.name()) {
                    let mut resp = response.clone();
                    resp.set_id(query.id());
                    return Ok(resp);
                }
            }

            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_response_code(ResponseCode::NXDomain);
            Ok(response)
        }
    }

    pub fn create_query(domain: &str, id: u16) -> Message {
        let mut query = Query::new();
        query.set_name(Name::from_str(domain).unwrap());
        query.set_query_type(RecordType::A);

        let mut message = Message::new();
        message.set_id(id);
        message.add_query(query);
        message
    }

    fn create_response(id: u16) -> Message {
        let mut response = Message::new();
        response
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        response
    }

    fn handler(resolver: MockResolver) -> QueryHandler<MockResolver> {
        let store = QueryStore::open_memory().unwrap();
        QueryHandler::new(resolver, store, Arc::new(IgnoreList::new(["*.local"])))
    }

    fn device() -> SocketAddr {
        "192.168.1.23:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn should_log_query_before_forwarding() {
        let resolver = MockResolver::new();
        resolver
            .add_response(
                Name::from_str("example.com.").unwrap(),
                create_response(0),
            )
            .await;
        let handler = handler(resolver.clone());

        let response = handler
            .handle_query(create_query("example.com.", 42), device())
            .await;

        assert_eq!(response.id(), 42);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(resolver.resolve_count(), 1);

        let logged = handler.store.recent(10, 0).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].domain, "example.com");
        assert_eq!(logged[0].source_ip, "192.168.1.23");
        assert!(logged[0].source_mac.is_empty());
    }

    #[tokio::test]
    async fn should_log_query_even_when_upstream_fails() {
        let resolver = MockResolver::new();
        resolver.set_error("connection refused").await;
        let handler = handler(resolver);

        let response = handler
            .handle_query(create_query("example.com.", 7), device())
            .await;

        assert_eq!(response.id(), 7);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries().len(), 1);

        let logged = handler.store.recent(10, 0).unwrap();
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn should_forward_ignored_domains_without_logging() {
        let resolver = MockResolver::new();
        let handler = handler(resolver.clone());

        handler
            .handle_query(create_query("printer.local.", 9), device())
            .await;

        assert_eq!(resolver.resolve_count(), 1);
        assert!(handler.store.recent(10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_forward_question_less_query_without_logging() {
        let resolver = MockResolver::new();
        let handler = handler(resolver.clone());

        let mut query = Message::new();
        query.set_id(3);

        handler.handle_query(query, device()).await;

        assert_eq!(resolver.resolve_count(), 1);
        assert!(handler.store.recent(10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_fall_back_to_secondary_upstream() {
        // A real loopback upstream that answers one query.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_UDP_DNS_SIZE];
            let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
            let query = Message::from_bytes(&buf[..len]).unwrap();
            let response = create_response(query.id());
            upstream
                .send_to(&response.to_bytes().unwrap(), from)
                .await
                .unwrap();
        });

        // Primary points at a port nothing answers on.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let resolver =
            UpstreamResolver::new(dead, Some(upstream_addr), Duration::from_millis(300));

        let response = resolver
            .resolve(&create_query("example.com.", 11))
            .await
            .unwrap();

        assert_eq!(response.id(), 11);
        assert_eq!(response.response_code(), ResponseCode::NoError);
    }

    #[tokio::test]
    async fn should_error_when_no_fallback_configured() {
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let resolver = UpstreamResolver::new(dead, None, Duration::from_millis(200));

        let result = resolver.resolve(&create_query("example.com.", 5)).await;

        assert!(matches!(result, Err(Error::Upstream(_)) | Err(Error::Io(_))));
    }

    #[test]
    fn should_synthesize_servfail_echoing_questions() {
        let query = create_query("example.com.", 77);
        let response = servfail_response(&query);

        assert_eq!(response.id(), 77);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries(), query.queries());
    }
}
