//! The native HTTP/1.1 backend.

use crate::{Error, FetchMsg, Result};
use async_net::TcpStream;
use futures_lite::io::AsyncWriteExt;
use larkspur_chain::{ChainEvent, ChainLink, ChainOp, Direction, Key};
use larkspur_http::{build_request, ProxyConfig, RefererPolicy, RequestParams, Url};
use larkspur_io::{EventLoop, IoEvent, IoWatcher, Resolver, Task};
use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::rc::Rc;

const DEFAULT_PROXY_PORT: u16 = 3128;

/// Where the request builder gets credentials and cookies.
///
/// Both lookups are policy decisions owned elsewhere; the backend only
/// decides *whether* to ask (cookies go out only for same-organization
/// requesters).
pub trait CredentialSource {
    /// `Authorization` value for `url`, when credentials are known.
    fn auth_for(&self, _url: &Url) -> Option<String> {
        None
    }

    /// `Cookie` line for `url`.
    fn cookies_for(&self, _url: &Url) -> Option<String> {
        None
    }
}

/// A credential source with nothing to say.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {}

/// Backend-wide HTTP settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Referer disclosure policy.
    pub referer: RefererPolicy,
    /// `Accept-Language` value.
    pub language: Option<String>,
    /// `User-Agent` value.
    pub user_agent: String,
    /// Proxy URL from the environment, when configured.
    pub proxy: Option<Url>,
    /// Pre-encoded proxy credentials.
    pub proxy_auth_base64: Option<String>,
    /// Authority substrings that bypass the proxy.
    pub no_proxy: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            referer: RefererPolicy::default(),
            language: None,
            user_agent: concat!("Larkspur/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy: None,
            proxy_auth_base64: None,
            no_proxy: Vec::new(),
        }
    }
}

impl HttpConfig {
    fn must_use_proxy(&self, url: &Url) -> bool {
        self.proxy.is_some()
            && !self
                .no_proxy
                .iter()
                .any(|token| url.authority().contains(token))
    }
}

/// The HTTP transport backend.
///
/// Owns a descriptor watcher holding its live sockets; the response side
/// of every fetch runs as a watcher registration that fans read bursts
/// into the chain.
#[derive(Clone)]
pub struct HttpBackend {
    el: EventLoop,
    resolver: Resolver,
    watcher: Rc<IoWatcher>,
    config: Rc<HttpConfig>,
    creds: Rc<dyn CredentialSource>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("config", &self.config)
            .field("live_sockets", &self.watcher.len())
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Creates a backend.
    pub fn new(
        el: EventLoop,
        resolver: Resolver,
        config: HttpConfig,
        creds: Rc<dyn CredentialSource>,
    ) -> Self {
        Self {
            el,
            resolver,
            watcher: Rc::new(IoWatcher::new()),
            config: Rc::new(config),
            creds,
        }
    }

    /// Number of sockets currently registered with the watcher.
    pub fn live_sockets(&self) -> usize {
        self.watcher.len()
    }

    /// Starts fetching `url`.
    ///
    /// `sink` receives the forward traffic: a `Start` with a status line
    /// once the connection stands, `Send`s with [`FetchMsg::Bytes`], and
    /// a final `End` or `Abort`. The returned link is the consumer side;
    /// sending `Abort` backward on it cancels the transfer and closes
    /// the socket.
    pub fn start(
        &self,
        url: &Url,
        requester: Option<&Url>,
        sink: Rc<dyn Fn(ChainEvent<FetchMsg>)>,
    ) -> ChainLink<FetchMsg> {
        let producer = ChainLink::<FetchMsg>::new();
        let task_slot: Rc<RefCell<Option<Task<()>>>> = Rc::new(RefCell::new(None));
        let watch_key: Rc<Cell<Option<Key>>> = Rc::new(Cell::new(None));

        let cancel_task = Rc::clone(&task_slot);
        let cancel_key = Rc::clone(&watch_key);
        let cancel_watcher = Rc::clone(&self.watcher);
        let backward: Rc<dyn Fn(ChainEvent<FetchMsg>)> = Rc::new(move |event| {
            if event.op == ChainOp::Abort {
                // Dropping the task (or its watcher registration) closes
                // the socket with it.
                cancel_task.borrow_mut().take();
                if let Some(key) = cancel_key.take() {
                    cancel_watcher.remove(key);
                }
            }
        });
        let consumer = producer.link_new(Direction::Forward, backward, sink, 1, 1);

        let el = self.el.clone();
        let watcher = Rc::clone(&self.watcher);
        let resolver = self.resolver.clone();
        let config = Rc::clone(&self.config);
        let creds = Rc::clone(&self.creds);
        let url = url.clone();
        let requester = requester.cloned();
        let task_producer = producer.clone();
        let task = el.clone().spawn(async move {
            match connect_and_send(resolver, config, creds, &url, requester.as_ref(), &task_producer)
                .await
            {
                Ok(stream) => {
                    // Hand the response side to the watcher; bursts flow
                    // forward on the chain from here on.
                    let producer = task_producer.clone();
                    let key = watcher.watch_read(&el, stream, move |event| match event {
                        IoEvent::Data(bytes) => {
                            producer.send_forward(ChainOp::Send, Some(FetchMsg::Bytes(bytes)));
                        }
                        IoEvent::End => {
                            producer.send_forward(ChainOp::End, None);
                        }
                        IoEvent::Abort(err) => {
                            log::warn!("http: read error: {err}");
                            producer.send_forward(
                                ChainOp::Abort,
                                Some(FetchMsg::Status(err.to_string())),
                            );
                        }
                    });
                    watch_key.set(Some(key));
                }
                Err(err) => {
                    log::warn!("http: fetch of {url} failed: {err}");
                    task_producer.send_forward(
                        ChainOp::Abort,
                        Some(FetchMsg::Status(err.to_string())),
                    );
                }
            }
        });
        *task_slot.borrow_mut() = Some(task);
        consumer
    }
}

/// Builds the request, resolves the host, connects in resolver order and
/// writes the query. Returns the connected stream, ready for reading.
async fn connect_and_send(
    resolver: Resolver,
    config: Rc<HttpConfig>,
    creds: Rc<dyn CredentialSource>,
    url: &Url,
    requester: Option<&Url>,
    producer: &ChainLink<FetchMsg>,
) -> Result<TcpStream> {
    let via_proxy = config.must_use_proxy(url);
    let (host, port) = if via_proxy {
        let proxy = config.proxy.as_ref().unwrap();
        (
            proxy.host_or_err()?.to_string(),
            proxy.port_or_default().unwrap_or(DEFAULT_PROXY_PORT),
        )
    } else {
        (
            url.host_or_err()?.to_string(),
            url.port_or_default().unwrap_or(80),
        )
    };

    // Cookies are third-party-safe: only same-organization requesters
    // (or the user) get them attached.
    let cookies = match requester {
        None => creds.cookies_for(url),
        Some(requester) if requester.same_organization(url) => creds.cookies_for(url),
        Some(_) => None,
    };
    let params = RequestParams {
        requester: requester.cloned(),
        referer: config.referer,
        language: config.language.clone(),
        user_agent: config.user_agent.clone(),
        auth: creds.auth_for(url),
        cookies,
        proxy: via_proxy.then(|| ProxyConfig {
            auth_base64: config.proxy_auth_base64.clone(),
        }),
    };
    let request = build_request(url, &params)?;

    let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => resolver.resolve(&host).await?.to_vec(),
    };

    producer.send_forward(
        ChainOp::Start,
        Some(FetchMsg::Status(format!("Contacting {host}..."))),
    );
    let mut stream = connect_in_order(&addrs, port, &host).await?;
    stream.write_all(&request).await?;
    Ok(stream)
}

/// Tries each address in resolver order until a connection stands.
async fn connect_in_order(addrs: &[IpAddr], port: u16, host: &str) -> Result<TcpStream> {
    let mut last_error = "no addresses".to_string();
    for addr in addrs {
        match TcpStream::connect((*addr, port)).await {
            Ok(stream) => {
                log::debug!("http: connected to {addr}:{port}");
                return Ok(stream);
            }
            Err(err) => {
                log::warn!("http: connect to {addr}:{port} failed: {err}");
                last_error = err.to_string();
            }
        }
    }
    Err(Error::ConnectFailed {
        host: host.to_string(),
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_net::TcpListener;
    use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
    use std::net::Ipv4Addr;

    fn sink_into(
        log: Rc<RefCell<Vec<(ChainOp, Option<FetchMsg>)>>>,
        done: async_channel::Sender<()>,
    ) -> Rc<dyn Fn(ChainEvent<FetchMsg>)> {
        Rc::new(move |event| {
            let terminal = matches!(event.op, ChainOp::End | ChainOp::Abort);
            log.borrow_mut().push((event.op, event.data));
            if terminal {
                let _ = done.try_send(());
            }
        })
    }

    #[test]
    fn fetches_from_a_local_server() {
        let el = EventLoop::new();
        let resolver = Resolver::new(1);
        let events = Rc::new(RefCell::new(Vec::new()));
        let events_in_sink = Rc::clone(&events);

        let backend = HttpBackend::new(
            el.clone(),
            resolver.clone(),
            HttpConfig::default(),
            Rc::new(NoCredentials),
        );

        let request_head = el.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            resolver.prime("server.test", vec![Ipv4Addr::LOCALHOST.into()]);
            let url = Url::parse(&format!("http://server.test:{port}/hello"), None).unwrap();

            let server = el.spawn(async move {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = conn.read(&mut buf).await.unwrap();
                conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                    .await
                    .unwrap();
                String::from_utf8_lossy(&buf[..n]).to_string()
            });

            let (done_tx, done_rx) = async_channel::bounded(1);
            let _link = backend.start(&url, None, sink_into(events_in_sink, done_tx));
            done_rx.recv().await.unwrap();
            server.await
        });

        assert!(request_head.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(request_head.contains("Host: server.test:"));
        let events = events.borrow();
        assert!(matches!(events.first(), Some((ChainOp::Start, _))));
        assert!(matches!(events.last(), Some((ChainOp::End, None))));
        let body: Vec<u8> = events
            .iter()
            .filter_map(|(op, data)| match (op, data) {
                (ChainOp::Send, Some(FetchMsg::Bytes(bytes))) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("hello"));
        // The watcher registration retired with the stream.
        assert_eq!(backend.live_sockets(), 0);
    }

    #[test]
    fn connect_failure_aborts_the_chain() {
        let el = EventLoop::new();
        let resolver = Resolver::new(1);
        let events = Rc::new(RefCell::new(Vec::new()));
        let events_in_sink = Rc::clone(&events);

        el.block_on(async {
            // Bind a listener and drop it: the port is (almost certainly)
            // closed.
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            resolver.prime("dead.test", vec![Ipv4Addr::LOCALHOST.into()]);
            let url = Url::parse(&format!("http://dead.test:{port}/"), None).unwrap();

            let backend = HttpBackend::new(
                el.clone(),
                resolver.clone(),
                HttpConfig::default(),
                Rc::new(NoCredentials),
            );
            let (done_tx, done_rx) = async_channel::bounded(1);
            let _link = backend.start(&url, None, sink_into(events_in_sink, done_tx));
            done_rx.recv().await.unwrap();
        });

        assert!(matches!(
            events.borrow().last(),
            Some((ChainOp::Abort, Some(FetchMsg::Status(_))))
        ));
    }

    #[test]
    fn backward_abort_cancels_the_transfer() {
        let el = EventLoop::new();
        let resolver = Resolver::new(1);
        let events = Rc::new(RefCell::new(Vec::new()));
        let events_in_sink = Rc::clone(&events);

        let backend = HttpBackend::new(
            el.clone(),
            resolver.clone(),
            HttpConfig::default(),
            Rc::new(NoCredentials),
        );

        el.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            resolver.prime("slow.test", vec![Ipv4Addr::LOCALHOST.into()]);
            let url = Url::parse(&format!("http://slow.test:{port}/"), None).unwrap();

            let server = el.spawn(async move {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 1024];
                let _ = conn.read(&mut buf).await;
                let _ = conn.write_all(b"HTTP/1.1 200 OK\r\n\r\npart").await;
                // Keep the connection open; the client aborts first.
                conn
            });

            let (done_tx, _done_rx) = async_channel::bounded(1);
            let link = backend.start(&url, None, sink_into(events_in_sink, done_tx));

            // Wait until the connection stands, then cancel backward.
            let _conn = server.await;
            async_io::Timer::after(std::time::Duration::from_millis(50)).await;
            assert!(link.send_backward(ChainOp::Abort, None));
        });

        // No terminal forward op was delivered: the producer was torn
        // down by the backward abort, not by stream end.
        assert!(!events
            .borrow()
            .iter()
            .any(|(op, _)| matches!(op, ChainOp::End)));
        assert_eq!(backend.live_sockets(), 0);
    }

    #[test]
    fn proxy_selection_respects_no_proxy() {
        let mut config = HttpConfig::default();
        config.proxy = Some(Url::parse("http://proxy.test:3128/", None).unwrap());
        config.no_proxy = vec!["internal.test".to_string()];
        let direct = Url::parse("http://www.internal.test/x", None).unwrap();
        let proxied = Url::parse("http://www.external.test/x", None).unwrap();
        assert!(!config.must_use_proxy(&direct));
        assert!(config.must_use_proxy(&proxied));
    }
}
