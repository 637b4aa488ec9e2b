//! Named, blocking, framed channel to the feeder (C1).
//!
//! One thread reads, one thread writes; the two directions are
//! independently synchronized. Reads block up to a settable per-read
//! timeout; `close` is callable from any thread and unblocks the reader.
//!
//! The codec is external: this module moves [`Message`] values, obtained
//! from and fed to `rhyolite-wire`'s framing, over a plain byte transport.
//! Production uses [`std::net::TcpStream`]; tests use the in-memory pair
//! from [`crate::testkit`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};

use rhyolite_types::ChannelName;
use rhyolite_wire::{Message, decode_message, encode_message};

use crate::error::{ReplicaError, ReplicaResult};

/// Read chunk size for stream transports.
const READ_CHUNK: usize = 64 * 1024;

/// Blocking byte producer. An empty chunk means the peer closed.
pub trait ByteSource: Send {
    fn recv(&mut self) -> io::Result<Vec<u8>>;

    /// `None` disables the per-read timeout.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Blocking byte consumer.
pub trait ByteSink: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Out-of-band channel control, callable concurrently with reads and
/// writes.
pub trait ChannelCtl: Send + Sync {
    /// Closes both directions and unblocks a blocked reader. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

struct ReadHalf {
    source: Box<dyn ByteSource>,
    buf: BytesMut,
}

/// A bidirectional framed message channel with a diagnostic name.
pub struct NamedChannel {
    name: ChannelName,
    read: Mutex<ReadHalf>,
    write: Mutex<Box<dyn ByteSink>>,
    ctl: Arc<dyn ChannelCtl>,
}

impl NamedChannel {
    pub fn new(
        name: ChannelName,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
        ctl: Arc<dyn ChannelCtl>,
    ) -> Self {
        Self {
            name,
            read: Mutex::new(ReadHalf {
                source,
                buf: BytesMut::with_capacity(READ_CHUNK),
            }),
            write: Mutex::new(sink),
            ctl,
        }
    }

    /// Wraps a connected TCP stream.
    pub fn from_tcp(stream: TcpStream, name: ChannelName) -> io::Result<Self> {
        let read_clone = stream.try_clone()?;
        let ctl_clone = stream.try_clone()?;
        Ok(Self::new(
            name,
            Box::new(TcpSource(read_clone)),
            Box::new(TcpSink(stream)),
            Arc::new(TcpCtl {
                stream: ctl_clone,
                open: AtomicBool::new(true),
            }),
        ))
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    /// Reads the next message, blocking up to the configured per-read
    /// timeout.
    pub fn read_message(&self) -> ReplicaResult<Message> {
        let mut half = self.read.lock().expect("channel read half poisoned");
        loop {
            if let Some(message) = decode_message(&mut half.buf)? {
                trace!(channel = %self.name, kind = message.kind_name(), "read");
                return Ok(message);
            }
            let chunk = match half.source.recv() {
                Ok(chunk) => chunk,
                Err(err) => return Err(self.map_io(err)),
            };
            if chunk.is_empty() {
                debug!(channel = %self.name, "peer closed");
                return Err(self.map_io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed channel",
                )));
            }
            half.buf.extend_from_slice(&chunk);
        }
    }

    /// Writes one message, blocking until the transport accepts it.
    pub fn write_message(&self, message: &Message) -> ReplicaResult<()> {
        let mut buf = BytesMut::new();
        encode_message(message, &mut buf)?;
        let mut sink = self.write.lock().expect("channel write half poisoned");
        match sink.send(&buf) {
            Ok(()) => {
                trace!(channel = %self.name, kind = message.kind_name(), "wrote");
                Ok(())
            }
            Err(err) => Err(self.map_io(err)),
        }
    }

    /// Sets the per-read timeout. `None` means block indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> ReplicaResult<()> {
        let mut half = self.read.lock().expect("channel read half poisoned");
        half.source.set_timeout(timeout).map_err(ReplicaError::Io)
    }

    /// Closes both directions. Idempotent; a blocked reader unblocks with
    /// [`ReplicaError::ChannelClosed`].
    pub fn close(&self) {
        self.ctl.close();
    }

    pub fn is_open(&self) -> bool {
        self.ctl.is_open()
    }

    /// Locally initiated closes surface as silent cancellation; real
    /// transport failures keep their I/O identity.
    fn map_io(&self, err: io::Error) -> ReplicaError {
        if self.is_open() {
            ReplicaError::Io(err)
        } else {
            ReplicaError::ChannelClosed
        }
    }
}

impl std::fmt::Debug for NamedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedChannel")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

// ----------------------------------------------------------------------
// TCP transport
// ----------------------------------------------------------------------

struct TcpSource(TcpStream);

impl ByteSource for TcpSource {
    fn recv(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; READ_CHUNK];
        match self.0.read(&mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
            Err(err) => Err(err),
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }
}

struct TcpSink(TcpStream);

impl ByteSink for TcpSink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)
    }
}

struct TcpCtl {
    stream: TcpStream,
    open: AtomicBool,
}

impl ChannelCtl for TcpCtl {
    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::testkit::memory_channel_pair;

    #[test]
    fn roundtrip_over_memory_pair() {
        let (a, b) = memory_channel_pair("feeder", "replica");
        a.write_message(&Message::SyncupDone).unwrap();
        assert_eq!(b.read_message().unwrap(), Message::SyncupDone);

        b.write_message(&Message::ShutdownResponse).unwrap();
        assert_eq!(a.read_message().unwrap(), Message::ShutdownResponse);
    }

    #[test]
    fn read_timeout_surfaces_as_io() {
        let (_a, b) = memory_channel_pair("feeder", "replica");
        b.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        match b.read_message() {
            Err(ReplicaError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(b.is_open());
    }

    #[test]
    fn local_close_is_silent_cancellation() {
        let (_a, b) = memory_channel_pair("feeder", "replica");
        let b = Arc::new(b);
        let reader = {
            let b = Arc::clone(&b);
            thread::spawn(move || b.read_message())
        };
        thread::sleep(Duration::from_millis(20));
        b.close();
        assert!(matches!(
            reader.join().unwrap(),
            Err(ReplicaError::ChannelClosed)
        ));
        assert!(!b.is_open());
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = memory_channel_pair("feeder", "replica");
        a.close();
        a.close();
        assert!(!a.is_open());
    }

    #[test]
    fn peer_close_is_io_error() {
        let (a, b) = memory_channel_pair("feeder", "replica");
        a.close();
        match b.read_message() {
            Err(ReplicaError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {other:?}"),
        }
    }
}
