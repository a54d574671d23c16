//! The helper-process transport.
//!
//! Schemes the core does not speak natively (and HTTPS, whose TLS is
//! deliberately kept out of process) are served by a helper daemon. The
//! daemon's TCP port and shared key live in a state file; the backend
//! authenticates with the key, sends one tagged command, and streams the
//! framed response back into a chain.

use crate::wire::{build_tag, Tokenizer, WireEvent};
use crate::{Error, FetchMsg, Result};
use async_io::Timer;
use async_net::TcpStream;
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use larkspur_chain::{ChainEvent, ChainLink, ChainOp, Direction};
use larkspur_http::Url;
use larkspur_io::{EventLoop, Task};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// How many times a daemon connection is attempted before giving up.
const CONNECT_TRIES: u32 = 12;
/// Pause between connection attempts.
const CONNECT_PAUSE: Duration = Duration::from_millis(250);

/// The daemon's address and shared authentication key, as read from the
/// per-user key file (one line: `<port> <key>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperKeys {
    /// TCP port on localhost.
    pub port: u16,
    /// Shared secret echoed in the `auth` command.
    pub key: String,
}

impl HelperKeys {
    /// Parses the key file contents.
    pub fn parse(text: &str) -> Result<Self> {
        let line = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| Error::HelperKeys("empty key file".into()))?;
        let mut parts = line.split_ascii_whitespace();
        let port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::HelperKeys(format!("bad port in {line:?}")))?;
        let key = parts
            .next()
            .ok_or_else(|| Error::HelperKeys(format!("missing key in {line:?}")))?
            .to_string();
        Ok(Self { port, key })
    }

    /// Reads and parses the key file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::HelperKeys(format!("{}: {err}", path.display())))?;
        Self::parse(&text)
    }
}

/// The helper server responsible for `url`, when one exists.
///
/// `dpi:/server/…` URLs name their server directly; a few well-known
/// schemes map to dedicated servers.
pub fn helper_server_for(url: &Url) -> Option<String> {
    match url.scheme() {
        "https" => Some("https".to_string()),
        "ftp" => Some("ftp".to_string()),
        "file" => Some("file".to_string()),
        "dpi" => url
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Side-channel messages from the helper, outside the page byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperEvent {
    /// `send_status_message`: show in the location bar.
    Status(String),
    /// `chat`: daemon small talk, logged or shown.
    Chat(String),
    /// `dialog`: the daemon wants a modal dialog.
    Dialog {
        /// Dialog title.
        title: String,
        /// Dialog body text.
        msg: String,
    },
    /// `reload_request`: the daemon asks the browser to reload a URL.
    ReloadRequest(String),
    /// `start_send_page`: page bytes follow on the chain.
    PageStart,
}

/// Outgoing command builders.
pub mod commands {
    use super::build_tag;

    /// Authenticates the connection.
    pub fn auth(key: &str) -> String {
        build_tag(&[("cmd", "auth"), ("msg", key)])
    }

    /// Asks a server to fetch and send a page.
    pub fn open_url(url: &str) -> String {
        build_tag(&[("cmd", "open_url"), ("url", url)])
    }

    /// Liveness probe for a named server.
    pub fn check_server(server: &str) -> String {
        build_tag(&[("cmd", "check_server"), ("msg", server)])
    }

    /// Hands a cookie line to the daemon-side store.
    pub fn set_cookie(cookie: &str, url: &str) -> String {
        build_tag(&[("cmd", "set_cookie"), ("cookie", cookie), ("url", url)])
    }

    /// Asks the daemon-side store for cookies matching a URL.
    pub fn get_cookie(url: &str) -> String {
        build_tag(&[("cmd", "get_cookie"), ("url", url)])
    }

    /// Queues a download to a destination file.
    pub fn download(url: &str, destination: &str) -> String {
        build_tag(&[("cmd", "download"), ("url", url), ("destination", destination)])
    }
}

/// The helper-process transport backend.
#[derive(Clone)]
pub struct HelperBackend {
    el: EventLoop,
    keys_path: PathBuf,
}

impl std::fmt::Debug for HelperBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperBackend")
            .field("keys_path", &self.keys_path)
            .finish()
    }
}

impl HelperBackend {
    /// Creates a backend reading daemon keys from `keys_path`.
    pub fn new(el: EventLoop, keys_path: PathBuf) -> Self {
        Self { el, keys_path }
    }

    async fn connect(&self) -> Result<(TcpStream, HelperKeys)> {
        let keys = HelperKeys::load(&self.keys_path)?;
        let mut last = String::new();
        for attempt in 0..CONNECT_TRIES {
            match TcpStream::connect(("127.0.0.1", keys.port)).await {
                Ok(stream) => return Ok((stream, keys)),
                Err(err) => {
                    last = err.to_string();
                    log::debug!(
                        "helper: connect attempt {}/{CONNECT_TRIES} failed: {err}",
                        attempt + 1
                    );
                    Timer::after(CONNECT_PAUSE).await;
                }
            }
        }
        Err(Error::HelperDown(last))
    }

    /// Starts serving `url` through the helper.
    ///
    /// Page bytes travel forward on the chain as [`FetchMsg::Bytes`];
    /// side-channel tags surface through `events`. The returned consumer
    /// link cancels the session on a backward `Abort`.
    pub fn start(
        &self,
        url: &Url,
        events: Rc<dyn Fn(HelperEvent)>,
        sink: Rc<dyn Fn(ChainEvent<FetchMsg>)>,
    ) -> ChainLink<FetchMsg> {
        let producer = ChainLink::<FetchMsg>::new();
        let task_slot: Rc<RefCell<Option<Task<()>>>> = Rc::new(RefCell::new(None));
        let cancel_slot = Rc::clone(&task_slot);
        let backward: Rc<dyn Fn(ChainEvent<FetchMsg>)> = Rc::new(move |event| {
            if event.op == ChainOp::Abort {
                cancel_slot.borrow_mut().take();
            }
        });
        let consumer = producer.link_new(Direction::Forward, backward, sink, 1, 1);

        let backend = self.clone();
        let url = url.clone();
        let task_producer = producer.clone();
        let task = self.el.spawn(async move {
            let session = async {
                let (stream, keys) = backend.connect().await?;
                run_session(stream, &keys, &url, &task_producer, &*events).await
            };
            match session.await {
                Ok(()) => {
                    task_producer.send_forward(ChainOp::End, None);
                }
                Err(err) => {
                    log::warn!("helper: session for {url} failed: {err}");
                    task_producer
                        .send_forward(ChainOp::Abort, Some(FetchMsg::Status(err.to_string())));
                }
            }
        });
        *task_slot.borrow_mut() = Some(task);
        consumer
    }

    /// Queues a download with the downloads server.
    pub async fn download(&self, url: &Url, destination: &Path) -> Result<()> {
        let (mut stream, keys) = self.connect().await?;
        stream.write_all(commands::auth(&keys.key).as_bytes()).await?;
        stream
            .write_all(
                commands::download(url.as_str(), &destination.display().to_string()).as_bytes(),
            )
            .await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Drives one open_url session over an established daemon connection.
async fn run_session<S>(
    mut stream: S,
    keys: &HelperKeys,
    url: &Url,
    producer: &ChainLink<FetchMsg>,
    events: &dyn Fn(HelperEvent),
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(commands::auth(&keys.key).as_bytes()).await?;
    stream
        .write_all(commands::open_url(url.as_str()).as_bytes())
        .await?;
    stream.flush().await?;
    producer.send_forward(
        ChainOp::Start,
        Some(FetchMsg::Status(format!("Contacting helper for {url}..."))),
    );

    let mut tokenizer = Tokenizer::new();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for event in tokenizer.push(&buf[..n])? {
            match event {
                WireEvent::Tag(tag) => match tag.cmd() {
                    Some("send_status_message") => {
                        events(HelperEvent::Status(
                            tag.get("msg").unwrap_or_default().to_string(),
                        ));
                    }
                    Some("chat") => {
                        events(HelperEvent::Chat(
                            tag.get("msg").unwrap_or_default().to_string(),
                        ));
                    }
                    Some("dialog") => {
                        events(HelperEvent::Dialog {
                            title: tag.get("title").unwrap_or_default().to_string(),
                            msg: tag.get("msg").unwrap_or_default().to_string(),
                        });
                    }
                    Some("reload_request") => {
                        events(HelperEvent::ReloadRequest(
                            tag.get("url").unwrap_or_default().to_string(),
                        ));
                    }
                    Some("start_send_page") => events(HelperEvent::PageStart),
                    other => {
                        log::warn!("helper: unrecognized command {other:?}");
                    }
                },
                WireEvent::PageBytes(bytes) => {
                    producer.send_forward(ChainOp::Send, Some(FetchMsg::Bytes(bytes)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larkspur_testing::TestTransport;
    use pretty_assertions::assert_eq;

    #[test]
    fn key_file_parses() {
        let keys = HelperKeys::parse("5124 a3f9c2\n").unwrap();
        assert_eq!(
            keys,
            HelperKeys {
                port: 5124,
                key: "a3f9c2".to_string()
            }
        );
        assert!(HelperKeys::parse("").is_err());
        assert!(HelperKeys::parse("not-a-port key").is_err());
    }

    #[test]
    fn server_mapping() {
        let u = |s: &str| Url::parse(s, None).unwrap();
        assert_eq!(helper_server_for(&u("https://a.test/")).unwrap(), "https");
        assert_eq!(helper_server_for(&u("ftp://a.test/f")).unwrap(), "ftp");
        assert_eq!(helper_server_for(&u("dpi:/bm/view")).unwrap(), "bm");
        assert_eq!(helper_server_for(&u("http://a.test/")), None);
    }

    #[test]
    fn session_streams_page_and_side_events() {
        let (transport, control) = TestTransport::new();
        control.feed(b"<cmd='send_status_message' msg='resolving' '>");
        control.feed(b"<cmd='start_send_page' url='ftp://a.test/f' '><file ");
        control.feed(b"contents>");
        control.close_read();

        let keys = HelperKeys {
            port: 1,
            key: "k".to_string(),
        };
        let url = Url::parse("ftp://a.test/f", None).unwrap();
        let producer = ChainLink::<FetchMsg>::new();
        let forwarded = Rc::new(RefCell::new(Vec::new()));
        let fwd = Rc::clone(&forwarded);
        let _consumer = producer.link_new(
            Direction::Forward,
            Rc::new(|_| {}),
            Rc::new(move |ev: ChainEvent<FetchMsg>| {
                fwd.borrow_mut().push((ev.op, ev.data));
            }),
            1,
            1,
        );
        let side = Rc::new(RefCell::new(Vec::new()));
        let side_sink = Rc::clone(&side);

        larkspur_testing::block_on(run_session(
            transport,
            &keys,
            &url,
            &producer,
            &move |event| side_sink.borrow_mut().push(event),
        ))
        .unwrap();

        let written = String::from_utf8(control.written()).unwrap();
        assert!(written.starts_with("<cmd='auth' msg='k' '>"));
        assert!(written.contains("<cmd='open_url' url='ftp://a.test/f' '>"));

        assert_eq!(
            &*side.borrow(),
            &[
                HelperEvent::Status("resolving".to_string()),
                HelperEvent::PageStart,
            ]
        );
        let bytes: Vec<u8> = forwarded
            .borrow()
            .iter()
            .filter_map(|(op, data)| match (op, data) {
                (ChainOp::Send, Some(FetchMsg::Bytes(b))) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(bytes, b"<file contents>");
    }
}
