use crate::error::Error;
use crate::remoting::proto::Message;
use crate::remoting::transport::FrameReader;
use crate::remoting::ChannelKind;
use crate::{rd_debug, rd_info, rd_warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// How long a fresh connection may stay silent before its `Hello` frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected stream of either transport kind.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn connect(kind: ChannelKind, address: &str) -> Result<Self, Error> {
        let stream = match kind {
            ChannelKind::Tcp => {
                let stream = TcpStream::connect(address)?;
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            ChannelKind::Unix => Stream::Unix(UnixStream::connect(address)?),
        };
        Ok(stream)
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(match self {
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
        })
    }

    pub fn shutdown(&self) {
        _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Accepted connection after the `Hello` frame. The reader keeps any bytes
/// the peer sent right after the handshake.
pub struct Connection {
    pub stream: Stream,
    pub reader: FrameReader<Stream>,
}

type ConnectionHandler = Box<dyn FnOnce(Connection) + Send>;

/// Process-wide listening channel.
/// Incoming connections are routed by the token from their first frame.
pub struct Channel {
    kind: ChannelKind,
    address: String,
    expected: Mutex<HashMap<Uuid, ConnectionHandler>>,
}

static CHANNEL: Lazy<Mutex<Option<Arc<Channel>>>> = Lazy::new(|| Mutex::new(None));

/// Register the process-wide channel. Only the first call creates a listener,
/// subsequent calls return the already registered channel whatever `kind` is passed.
pub fn register_channel(kind: ChannelKind) -> Result<Arc<Channel>, Error> {
    let mut registered = CHANNEL.lock().unwrap();
    if let Some(channel) = registered.as_ref() {
        if channel.kind != kind {
            rd_debug!(target: "remoting", "channel already registered as {}, requested {kind}", channel.kind);
        }
        return Ok(channel.clone());
    }

    let channel = match kind {
        ChannelKind::Tcp => {
            let listener =
                TcpListener::bind("127.0.0.1:0").map_err(Error::ChannelRegistration)?;
            let address = listener
                .local_addr()
                .map_err(Error::ChannelRegistration)?
                .to_string();
            let channel = Arc::new(Channel::new(kind, address));
            let ch = channel.clone();
            thread::Builder::new()
                .name("rdbg-channel".to_string())
                .spawn(move || {
                    for conn in listener.incoming() {
                        match conn {
                            Ok(stream) => {
                                _ = stream.set_nodelay(true);
                                ch.route(Stream::Tcp(stream));
                            }
                            Err(e) => rd_warn!(target: "remoting", "accept connection: {e}"),
                        }
                    }
                })
                .map_err(Error::ChannelRegistration)?;
            channel
        }
        ChannelKind::Unix => {
            let path = std::env::temp_dir().join(format!(
                "rdbg-{}-{}.sock",
                std::process::id(),
                Uuid::new_v4().simple()
            ));
            let listener = UnixListener::bind(&path).map_err(Error::ChannelRegistration)?;
            let channel = Arc::new(Channel::new(kind, path.to_string_lossy().to_string()));
            let ch = channel.clone();
            thread::Builder::new()
                .name("rdbg-channel".to_string())
                .spawn(move || {
                    for conn in listener.incoming() {
                        match conn {
                            Ok(stream) => ch.route(Stream::Unix(stream)),
                            Err(e) => rd_warn!(target: "remoting", "accept connection: {e}"),
                        }
                    }
                })
                .map_err(Error::ChannelRegistration)?;
            channel
        }
    };

    rd_info!(target: "remoting", "{kind} channel registered at {}", channel.address);
    *registered = Some(channel.clone());
    Ok(channel)
}

impl Channel {
    fn new(kind: ChannelKind, address: String) -> Self {
        Self {
            kind,
            address,
            expected: Mutex::default(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for a connection presenting `token`, `handler` is called at most once.
    pub fn expect(&self, token: Uuid, handler: impl FnOnce(Connection) + Send + 'static) {
        self.expected
            .lock()
            .unwrap()
            .insert(token, Box::new(handler));
    }

    /// Stop waiting for a connection with `token`.
    pub fn forget(&self, token: Uuid) {
        self.expected.lock().unwrap().remove(&token);
    }

    fn route(&self, stream: Stream) {
        let (token, reader) = match Self::read_hello(&stream) {
            Ok(hello) => hello,
            Err(e) => {
                rd_warn!(target: "remoting", "drop connection without handshake: {e}");
                stream.shutdown();
                return;
            }
        };

        let handler = self.expected.lock().unwrap().remove(&token);
        match handler {
            Some(handler) => handler(Connection { stream, reader }),
            None => {
                rd_warn!(target: "remoting", "drop connection with unknown token {token}");
                stream.shutdown();
            }
        }
    }

    fn read_hello(stream: &Stream) -> Result<(Uuid, FrameReader<Stream>), Error> {
        stream.set_read_timeout(Some(HELLO_TIMEOUT))?;
        let mut reader = FrameReader::new(stream.try_clone()?);
        let msg: Message = reader.read_message()?;
        stream.set_read_timeout(None)?;
        match msg {
            Message::Hello { token } => Ok((token, reader)),
            other => Err(Error::Protocol(format!(
                "expect hello frame, got {other:?}"
            ))),
        }
    }
}
