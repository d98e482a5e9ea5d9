//! Blocking network transport.
//!
//! Each tracker session owns one private connection; nothing is pooled or
//! shared. All operations block with a configured timeout, and a timeout is
//! a hard failure that sends the session back to reconnect, not a
//! cancellation point.

use crate::error::{Error, Result};

use std::io::{Read as _, Write as _};
use std::net::{TcpStream, ToSocketAddrs as _};
use std::time::Duration;

/// Opens connections. Trait-shaped so tests can substitute an in-memory
/// transport.
pub trait Transport: Send + Sync {
    fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;
}

/// One established connection.
pub trait Connection: Send {
    fn send(&mut self, data: &[u8]) -> Result<()>;
    /// Receives exactly `len` bytes.
    fn recv(&mut self, len: usize) -> Result<Vec<u8>>;
    /// The local address of this connection, as the remote sees us connect.
    fn local_ip(&self) -> Result<String>;
}

/// TCP transport with connect and I/O timeouts.
pub struct TcpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self { connect_timeout, io_timeout }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let sockaddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::IO(format!("address {addr} did not resolve")))?;
        let stream = TcpStream::connect_timeout(&sockaddr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection { stream }))
    }
}

struct TcpConnection {
    stream: TcpStream,
}

impl Connection for TcpConnection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn local_ip(&self) -> Result<String> {
        Ok(self.stream.local_addr()?.ip().to_string())
    }
}

#[cfg(test)]
pub mod fakes {
    //! In-memory stand-ins used by unit tests across the crate.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A connection that records everything sent and replays scripted
    /// response bytes.
    #[derive(Default)]
    pub struct ScriptedConnection {
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
        replies: Arc<Mutex<VecDeque<u8>>>,
        pub local_ip: String,
    }

    impl ScriptedConnection {
        pub fn new(local_ip: &str) -> Self {
            Self { local_ip: local_ip.into(), ..Self::default() }
        }

        /// Queues response bytes to be returned by subsequent recv calls.
        pub fn reply(&self, bytes: &[u8]) {
            self.replies.lock().unwrap().extend(bytes.iter().copied());
        }

        pub fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Connection for ScriptedConnection {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, len: usize) -> Result<Vec<u8>> {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() < len {
                return Err(Error::IO("scripted connection out of reply bytes".into()));
            }
            Ok(replies.drain(..len).collect())
        }

        fn local_ip(&self) -> Result<String> {
            Ok(self.local_ip.clone())
        }
    }

    /// A transport that hands out scripted connections by address, and
    /// records the addresses connected to.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub connects: Arc<Mutex<Vec<String>>>,
        replies: Arc<Mutex<std::collections::HashMap<String, VecDeque<Vec<u8>>>>>,
    }

    impl ScriptedTransport {
        /// Scripts the full reply byte stream for the next connection to an
        /// address.
        pub fn on_connect(&self, addr: &str, reply_bytes: Vec<u8>) {
            self.replies.lock().unwrap().entry(addr.into()).or_default().push_back(reply_bytes);
        }

        pub fn connected(&self) -> Vec<String> {
            self.connects.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
            self.connects.lock().unwrap().push(addr.to_string());
            let scripted = self
                .replies
                .lock()
                .unwrap()
                .get_mut(addr)
                .and_then(|queue| queue.pop_front())
                .ok_or_else(|| Error::IO(format!("no scripted connection for {addr}")))?;
            let conn = ScriptedConnection::new("10.0.0.1");
            conn.reply(&scripted);
            Ok(Box::new(conn))
        }
    }
}
