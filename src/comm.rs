//! Command channel: length-prefixed records over a local stream socket.
//!
//! One client at a time. Records are `{ type: u32, length: u32, data[length] }`
//! in native byte order. The socket is non-blocking and polled from the
//! main loop between frames, so a record may arrive split across any
//! number of reads; partial state is carried over and discarded if the
//! client goes away mid-record.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::{info, warn};

use crate::Result;

/// Upper bound on a record body; anything larger is a framing error and
/// drops the connection.
const MAX_PAYLOAD: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u32,
    pub data: Vec<u8>,
}

enum RecvState {
    Header { buf: [u8; 8], filled: usize },
    Body { kind: u32, data: Vec<u8>, filled: usize },
}

impl RecvState {
    fn new() -> Self {
        RecvState::Header { buf: [0; 8], filled: 0 }
    }
}

pub struct Comm {
    listener: UnixListener,
    conn: Option<UnixStream>,
    state: RecvState,
}

impl Comm {
    /// Bind the control socket, unlinking any stale one first.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Comm> {
        let path = path.as_ref();
        if path.exists() {
            warn!("socket '{}' already exists, removing", path.display());
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", path.display());

        Ok(Comm {
            listener,
            conn: None,
            state: RecvState::new(),
        })
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.state = RecvState::new();
    }

    /// Accept a client if none is connected, then drain every complete
    /// record currently available. Never blocks.
    pub fn poll(&mut self) -> Result<Vec<Packet>> {
        if self.conn.is_none() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    info!("client connected");
                    self.conn = Some(stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        }

        let mut pkts = Vec::new();

        loop {
            let conn = self.conn.as_mut().unwrap();

            let read = match &mut self.state {
                RecvState::Header { buf, filled } => conn.read(&mut buf[*filled..]),
                RecvState::Body { data, filled, .. } => conn.read(&mut data[*filled..]),
            };

            match read {
                Ok(0) => {
                    // Client went away; any half-received record dies
                    // with the connection.
                    info!("client disconnected");
                    self.drop_connection();
                    break;
                }
                Ok(n) => {
                    if let Some(pkt) = self.advance(n) {
                        match pkt {
                            Ok(pkt) => pkts.push(pkt),
                            Err(()) => {
                                self.drop_connection();
                                break;
                            }
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read error on command socket: {}", e);
                    self.drop_connection();
                    break;
                }
            }
        }

        Ok(pkts)
    }

    /// Account for `n` freshly read bytes. Returns a completed packet, or
    /// `Err(())` if the header was nonsense.
    fn advance(&mut self, n: usize) -> Option<std::result::Result<Packet, ()>> {
        match &mut self.state {
            RecvState::Header { buf, filled } => {
                *filled += n;
                if *filled < buf.len() {
                    return None;
                }

                let kind = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let length = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
                if length > MAX_PAYLOAD {
                    warn!("record claims {} byte body, dropping client", length);
                    return Some(Err(()));
                }

                if length == 0 {
                    self.state = RecvState::new();
                    return Some(Ok(Packet { kind, data: Vec::new() }));
                }

                self.state = RecvState::Body {
                    kind,
                    data: vec![0; length as usize],
                    filled: 0,
                };
                None
            }
            RecvState::Body { kind, data, filled } => {
                *filled += n;
                if *filled < data.len() {
                    return None;
                }

                let pkt = Packet {
                    kind: *kind,
                    data: std::mem::take(data),
                };
                self.state = RecvState::new();
                Some(Ok(pkt))
            }
        }
    }

    /// Send a framed record to the connected client, if any. A write
    /// failure just costs the connection.
    pub fn send(&mut self, kind: u32, payload: &[u8]) {
        if let Some(conn) = &mut self.conn {
            let mut buf = Vec::with_capacity(8 + payload.len());
            buf.extend_from_slice(&kind.to_ne_bytes());
            buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
            buf.extend_from_slice(payload);

            // The socket is non-blocking, so `write_all` can fail after
            // part of the frame reached the kernel; the stream is framed,
            // so a partial record desyncs everything after it. Any
            // failure, a full send buffer included, costs the connection.
            if let Err(e) = conn.write_all(&buf) {
                warn!("write error on command socket: {}", e);
                self.drop_connection();
            }
        }
    }
}
