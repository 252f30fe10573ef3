use crate::error::{Error, RemoteFault};
use crate::remoting::channel::{Connection, Stream};
use crate::remoting::proto::Message;
use crate::remoting::transport::{FrameReader, FrameWriter};
use crate::{rd_debug, rd_warn, weak_error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use uuid::Uuid;

/// Receiver side of an endpoint, implemented by whoever serves incoming messages.
pub trait Dispatch: Send + Sync + 'static {
    /// Serve a request, runs on a dedicated thread so a handler may block
    /// or call back into the peer.
    fn dispatch_request(&self, peer: &Endpoint, body: Value) -> Result<Value, Error>;

    /// Serve a notification, notifications are handled one by one in arrival order.
    fn dispatch_notification(&self, peer: &Endpoint, body: Value);

    /// Called once when the connection is lost.
    fn on_disconnect(&self) {}
}

type PendingCalls = HashMap<u64, Sender<Result<Value, RemoteFault>>>;

struct Shared {
    stream: Stream,
    writer: Mutex<FrameWriter<Stream>>,
    pending: Mutex<PendingCalls>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Bidirectional call link over a single connection.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Serve a connection accepted by a channel.
    pub fn accept(conn: Connection, dispatcher: Arc<dyn Dispatch>) -> Result<Self, Error> {
        let endpoint = Self::new(conn.stream)?;
        endpoint.spawn_reader(conn.reader, dispatcher)?;
        Ok(endpoint)
    }

    /// Present `token` to the remote channel and start serving the connection.
    pub fn connect(
        stream: Stream,
        token: Uuid,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Result<Self, Error> {
        let endpoint = Self::new(stream)?;
        endpoint.write(&Message::Hello { token })?;
        let reader = FrameReader::new(endpoint.shared.stream.try_clone()?);
        endpoint.spawn_reader(reader, dispatcher)?;
        Ok(endpoint)
    }

    fn new(stream: Stream) -> Result<Self, Error> {
        let writer = FrameWriter::new(stream.try_clone()?);
        Ok(Self {
            shared: Arc::new(Shared {
                stream,
                writer: Mutex::new(writer),
                pending: Mutex::default(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    fn spawn_reader(
        &self,
        mut reader: FrameReader<Stream>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Result<(), Error> {
        let peer = self.clone();
        thread::Builder::new()
            .name("rdbg-endpoint".to_string())
            .spawn(move || {
                loop {
                    match reader.read_message::<Message>() {
                        Ok(msg) => peer.handle(msg, &dispatcher),
                        Err(Error::Disconnected) => break,
                        Err(e) => {
                            if !peer.is_closed() {
                                rd_warn!(target: "remoting", "read frame: {e}");
                            }
                            break;
                        }
                    }
                }
                peer.teardown();
                dispatcher.on_disconnect();
            })?;
        Ok(())
    }

    fn handle(&self, msg: Message, dispatcher: &Arc<dyn Dispatch>) {
        match msg {
            Message::Response { id, result } => {
                let waiter = self.shared.pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        _ = tx.send(result);
                    }
                    None => rd_debug!(target: "remoting", "response to unknown call {id}"),
                }
            }
            Message::Request { id, body } => {
                let peer = self.clone();
                let dispatcher = dispatcher.clone();
                let spawned = thread::Builder::new()
                    .name("rdbg-request".to_string())
                    .spawn(move || {
                        let result = dispatcher
                            .dispatch_request(&peer, body)
                            .map_err(|e| RemoteFault::from(&e));
                        weak_error!(
                            peer.write(&Message::Response { id, result }),
                            "send response:"
                        );
                    });
                weak_error!(spawned, "spawn request handler:");
            }
            Message::Notification { body } => dispatcher.dispatch_notification(self, body),
            Message::Hello { .. } => {
                rd_warn!(target: "remoting", "unexpected hello frame on established connection")
            }
        }
    }

    fn write(&self, msg: &Message) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        self.shared.writer.lock().unwrap().write_message(msg)
    }

    /// Fail all outstanding calls, they will never get an answer.
    fn teardown(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        self.shared.closed.store(true, Ordering::SeqCst);
        pending.clear();
    }

    /// Call a remote operation and wait for its result.
    pub fn call<Req: Serialize, Resp: DeserializeOwned>(&self, req: &Req) -> Result<Resp, Error> {
        let body = serde_json::to_value(req)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if self.is_closed() {
                return Err(Error::Disconnected);
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.write(&Message::Request { id, body }) {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.recv() {
            Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
            Ok(Err(fault)) => Err(fault.into()),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Send a one-way message.
    pub fn notify<Req: Serialize>(&self, req: &Req) -> Result<(), Error> {
        let body = serde_json::to_value(req)?;
        self.write(&Message::Notification { body })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Shut the connection down, the reader thread stops and outstanding calls fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stream.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::remoting::{register_channel, ChannelKind};
    use serde_json::json;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    struct Echo {
        notifications: Mutex<Sender<Value>>,
    }

    impl Dispatch for Echo {
        fn dispatch_request(&self, _: &Endpoint, body: Value) -> Result<Value, Error> {
            if body == json!("fail") {
                return Err(Error::ChangeNotAllowed);
            }
            if body == json!("hang") {
                thread::sleep(Duration::from_secs(60));
            }
            Ok(json!({ "echo": body }))
        }

        fn dispatch_notification(&self, _: &Endpoint, body: Value) {
            _ = self.notifications.lock().unwrap().send(body);
        }
    }

    fn pair() -> (Endpoint, Endpoint, Receiver<Value>, Receiver<Value>) {
        let channel = register_channel(ChannelKind::Tcp).unwrap();
        let token = Uuid::new_v4();
        let (server_tx, server_rx) = mpsc::channel();
        let (client_tx, client_rx) = mpsc::channel();
        let (accepted_tx, accepted_rx) = mpsc::channel();

        channel.expect(token, move |conn| {
            let ep = Endpoint::accept(
                conn,
                Arc::new(Echo {
                    notifications: Mutex::new(server_tx),
                }),
            )
            .unwrap();
            accepted_tx.send(ep).unwrap();
        });

        let stream = Stream::connect(channel.kind(), channel.address()).unwrap();
        let client = Endpoint::connect(
            stream,
            token,
            Arc::new(Echo {
                notifications: Mutex::new(client_tx),
            }),
        )
        .unwrap();
        let server = accepted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        (client, server, server_rx, client_rx)
    }

    #[test]
    fn test_call_both_directions() {
        let (client, server, _, _) = pair();
        let resp: Value = client.call(&json!(1)).unwrap();
        assert_eq!(resp, json!({"echo": 1}));
        let resp: Value = server.call(&json!("x")).unwrap();
        assert_eq!(resp, json!({"echo": "x"}));
    }

    #[test]
    fn test_fault_propagation() {
        let (client, _server, _, _) = pair();
        let resp: Result<Value, _> = client.call(&json!("fail"));
        assert!(matches!(resp, Err(Error::ChangeNotAllowed)));
    }

    #[test]
    fn test_notifications_keep_order() {
        let (client, _server, server_rx, _) = pair();
        for i in 0..50 {
            client.notify(&json!(i)).unwrap();
        }
        for i in 0..50 {
            let got = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(got, json!(i));
        }
    }

    #[test]
    fn test_disconnect_fails_pending_call() {
        let (client, server, _, _) = pair();
        let caller = thread::spawn(move || client.call::<_, Value>(&json!("hang")));
        thread::sleep(Duration::from_millis(100));
        server.close();
        let result = caller.join().unwrap();
        assert!(matches!(result, Err(Error::Disconnected)));
    }
}
