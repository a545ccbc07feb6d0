//! Telling open browser tabs what happened after a rebuild.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! * `{"type":"css"}` when only stylesheets changed, so the page can swap
//!   them in place,
//! * `{"type":"reload"}` for any other change,
//! * `{"type":"error","message":"..."}` when the rebuild failed.
//!
//! The client side of this protocol is
//! [`Environment::get_refresh_script`](crate::Environment::get_refresh_script).

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::Category;
use crate::engine::BuildReport;

#[cfg(feature = "live")]
pub use socket::WebSocketTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReloadMessage {
    Css,
    Reload,
    Error { message: String },
}

impl ReloadMessage {
    /// The message for a successful rebuild triggered by changes in these
    /// categories. `None` when nothing changed.
    pub fn for_categories(categories: &BTreeSet<Category>) -> Option<Self> {
        if categories.is_empty() {
            return None;
        }

        if categories.iter().all(|c| *c == Category::Style) {
            Some(Self::Css)
        } else {
            Some(Self::Reload)
        }
    }

    pub fn to_json(&self) -> String {
        // A tagged enum of strings always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"reload"}"#))
    }
}

/// A channel to the development clients.
pub trait DevTransport: Send + Sync {
    fn send(&self, message: &ReloadMessage);
}

/// Fans reload messages out to every registered transport.
#[derive(Default)]
pub struct ReloadNotifier {
    transports: Vec<Box<dyn DevTransport>>,
}

impl ReloadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: impl DevTransport + 'static) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    /// Reports a successful rebuild. Returns the message that was sent.
    pub fn notify(&self, categories: &BTreeSet<Category>) -> Option<ReloadMessage> {
        let message = ReloadMessage::for_categories(categories)?;
        self.broadcast(&message);
        Some(message)
    }

    /// Reports a failed rebuild, with one line per failed task.
    pub fn notify_error(&self, report: &BuildReport) -> ReloadMessage {
        let message = report
            .failures()
            .map(|failure| format!("{}: {:#}", failure.task, failure.cause))
            .collect::<Vec<_>>()
            .join("\n");

        let message = ReloadMessage::Error { message };
        self.broadcast(&message);
        message
    }

    fn broadcast(&self, message: &ReloadMessage) {
        tracing::debug!("sending {}", message.to_json());
        for transport in &self.transports {
            transport.send(message);
        }
    }
}

impl std::fmt::Debug for ReloadNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadNotifier")
            .field("transports", &self.transports.len())
            .finish()
    }
}

#[cfg(feature = "live")]
mod socket {
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc::{Sender, channel};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    use tungstenite::{Message, WebSocket};

    use super::{DevTransport, ReloadMessage};

    type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

    /// Pushes messages to browsers over WebSocket.
    ///
    /// One thread accepts connections, another broadcasts. Only the ten most
    /// recent connections are kept open.
    pub struct WebSocketTransport {
        port: u16,
        tx: Sender<String>,
        _thread_i: JoinHandle<()>,
        _thread_o: JoinHandle<()>,
    }

    impl WebSocketTransport {
        /// Listens on port 1337, or on any free port when that one is taken.
        pub fn bind() -> std::io::Result<Self> {
            let (tcp, port) = reserve_port()?;
            let clients = Clients::default();

            let _thread_i = new_thread_ws_incoming(tcp, clients.clone());
            let (tx, _thread_o) = new_thread_ws_reload(clients);

            Ok(Self {
                port,
                tx,
                _thread_i,
                _thread_o,
            })
        }

        pub fn port(&self) -> u16 {
            self.port
        }
    }

    impl DevTransport for WebSocketTransport {
        fn send(&self, message: &ReloadMessage) {
            if self.tx.send(message.to_json()).is_err() {
                tracing::error!("live-reload thread is gone");
            }
        }
    }

    fn reserve_port() -> std::io::Result<(TcpListener, u16)> {
        let listener = match TcpListener::bind("127.0.0.1:1337") {
            Ok(sock) => sock,
            Err(_) => TcpListener::bind("127.0.0.1:0")?,
        };

        let port = listener.local_addr()?.port();
        Ok((listener, port))
    }

    fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for stream in server.incoming() {
                let socket = match stream.map(tungstenite::accept) {
                    Ok(Ok(socket)) => socket,
                    Ok(Err(e)) => {
                        tracing::warn!("websocket handshake failed: {e}");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("websocket connection failed: {e}");
                        continue;
                    }
                };

                if let Ok(mut clients) = clients.lock() {
                    clients.push(socket);
                }
            }
        })
    }

    fn new_thread_ws_reload(clients: Clients) -> (Sender<String>, JoinHandle<()>) {
        let (tx, rx) = channel::<String>();

        let thread = std::thread::spawn(move || {
            while let Ok(message) = rx.recv() {
                let Ok(mut clients) = clients.lock() else {
                    break;
                };
                let mut broken = vec![];

                for (i, socket) in clients.iter_mut().enumerate() {
                    match socket.send(Message::text(message.clone())) {
                        Ok(_) => {}
                        Err(tungstenite::error::Error::Io(e)) => {
                            if e.kind() == std::io::ErrorKind::BrokenPipe {
                                broken.push(i);
                            }
                        }
                        Err(
                            tungstenite::error::Error::ConnectionClosed
                            | tungstenite::error::Error::AlreadyClosed,
                        ) => broken.push(i),
                        Err(e) => {
                            tracing::error!("Error: {e:?}");
                        }
                    }
                }

                for i in broken.into_iter().rev() {
                    clients.remove(i);
                }

                // Close all but the last 10 connections
                let len = clients.len();
                if len > 10 {
                    for mut socket in clients.drain(0..len - 10) {
                        socket.close(None).ok();
                    }
                }
            }
        });

        (tx, thread)
    }
}
