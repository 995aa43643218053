//! Per-connection conversation.
//!
//! One conversation is: receive a newline-terminated message into the
//! store, then stream the whole store back, then close. The socket is
//! closed on every exit path and a failure only abandons this connection.

use crate::protocol::{self, Chunk, ProtocolViolation};
use crate::storage::{Appender, MessageStore, StoreError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors that abandon a single conversation
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to configure client socket: {0}")]
    Socket(#[source] io::Error),
    #[error("Could not open message store: {0}")]
    StoreOpen(#[source] io::Error),
    #[error("Failed to read data from client: {0}")]
    Read(#[source] io::Error),
    #[error("No data received from client")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error("Error writing to message store: {0}")]
    StoreWrite(#[from] StoreError),
    #[error("Failed to read message store: {0}")]
    StoreRead(#[source] io::Error),
    #[error("Failed to send data: {0}")]
    Send(#[source] io::Error),
    #[error("Failed to send complete data ({sent} of {expected} bytes)")]
    ShortSend { sent: usize, expected: usize },
}

impl ConnectionError {
    /// Whether chunks already stored for the unfinished message must be
    /// removed. A protocol violation keeps them.
    fn discards_partial(&self) -> bool {
        matches!(
            self,
            ConnectionError::Disconnected
                | ConnectionError::Read(_)
                | ConnectionError::StoreWrite(_)
        )
    }
}

/// Drives client conversations against a message store
pub struct ConnectionHandler<'a> {
    store: &'a MessageStore,
    chunk_size: usize,
}

impl<'a> ConnectionHandler<'a> {
    pub fn new(store: &'a MessageStore, chunk_size: usize) -> Self {
        Self { store, chunk_size }
    }

    /// Serve one accepted connection to completion, then close it.
    pub fn converse(&self, mut stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(addr) => addr.ip().to_string(),
            Err(e) => {
                error!(error = %e, "Failed to get peer info");
                "unknown".to_string()
            }
        };
        info!(peer = %peer, "Accepted connection");

        match self.serve(&mut stream) {
            Ok(sent) => debug!(peer = %peer, sent, "Conversation complete"),
            Err(e) => error!(peer = %peer, error = %e, "Connection failed"),
        }

        close(stream);
        info!(peer = %peer, "Closed connection");
    }

    fn serve(&self, stream: &mut TcpStream) -> Result<usize, ConnectionError> {
        // The listener is non-blocking; the conversation itself blocks.
        stream
            .set_nonblocking(false)
            .map_err(ConnectionError::Socket)?;
        self.receive(stream)?;
        self.dispatch(stream)
    }

    /// Read one message from the client into the store.
    ///
    /// Each chunk is checked before it is written, so a chunk with bytes
    /// after the delimiter is never stored. Chunks already stored in this
    /// conversation are kept on a protocol violation but rolled back on
    /// any other failure before the delimiter.
    pub fn receive<S: Read>(&self, stream: &mut S) -> Result<(), ConnectionError> {
        let mut appender = self.store.appender();

        let result = self.fill(stream, &mut appender);
        if let Err(ref e) = result {
            if e.discards_partial() {
                discard(&mut appender);
            }
        }
        result
    }

    fn fill<S: Read>(
        &self,
        stream: &mut S,
        appender: &mut Appender,
    ) -> Result<(), ConnectionError> {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => return Err(ConnectionError::Disconnected),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Read(e)),
            };

            let chunk = &buf[..n];
            let kind = protocol::classify(chunk)?;
            appender.append(chunk)?;

            if kind == Chunk::Final {
                return Ok(());
            }
        }
    }

    /// Stream the full store content to the client.
    ///
    /// Returns the number of bytes sent.
    pub fn dispatch<S: Write>(&self, stream: &mut S) -> Result<usize, ConnectionError> {
        let chunks = self
            .store
            .read_all(self.chunk_size)
            .map_err(ConnectionError::StoreOpen)?;
        let mut total = 0;

        for chunk in chunks {
            let chunk = chunk.map_err(ConnectionError::StoreRead)?;
            let sent = stream.write(&chunk).map_err(ConnectionError::Send)?;
            if sent != chunk.len() {
                return Err(ConnectionError::ShortSend {
                    sent,
                    expected: chunk.len(),
                });
            }
            total += sent;
        }

        Ok(total)
    }
}

/// Roll back a partially received message.
fn discard(appender: &mut Appender) {
    if let Err(e) = appender.rollback() {
        error!(error = %e, "Could not discard partial message");
    }
}

fn close(stream: TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        // The peer may already have gone away
        debug!(error = %e, "Socket shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Yields one scripted result per `read` call.
    struct ScriptedReader {
        reads: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    assert!(data.len() <= buf.len(), "scripted chunk too large");
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    /// Accepts at most `limit` bytes per write.
    struct ShortWriter {
        limit: usize,
        written: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn temp_store() -> (TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path().join("messages"));
        (dir, store)
    }

    fn ok(data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn stored(handler: &ConnectionHandler<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        handler.dispatch(&mut out).unwrap();
        out
    }

    #[test]
    fn test_receive_single_chunk() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);

        let mut reader = ScriptedReader::new(vec![ok(b"hello\n")]);
        handler.receive(&mut reader).unwrap();

        assert_eq!(stored(&handler), b"hello\n");
    }

    #[test]
    fn test_receive_multiple_chunks() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 4);

        let mut reader = ScriptedReader::new(vec![ok(b"abcd"), ok(b"ef"), ok(b"gh\n")]);
        handler.receive(&mut reader).unwrap();

        assert_eq!(stored(&handler), b"abcdefgh\n");
    }

    #[test]
    fn test_receive_retries_interrupted_read() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);

        let mut reader = ScriptedReader::new(vec![
            ok(b"part"),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            ok(b"ial\n"),
        ]);
        handler.receive(&mut reader).unwrap();

        assert_eq!(stored(&handler), b"partial\n");
    }

    #[test]
    fn test_trailing_bytes_keep_prior_chunks() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);
        store.appender().append(b"earlier\n").unwrap();

        let mut reader = ScriptedReader::new(vec![ok(b"valid "), ok(b"end\nextra")]);
        let err = handler.receive(&mut reader).unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolViolation { trailing: 5 })
        ));
        // Offending chunk never stored; the valid one before it stays
        assert_eq!(stored(&handler), b"earlier\nvalid ");
    }

    #[test]
    fn test_disconnect_discards_fragment() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);
        store.appender().append(b"earlier\n").unwrap();

        let mut reader = ScriptedReader::new(vec![ok(b"no newline"), ok(b" yet")]);
        let err = handler.receive(&mut reader).unwrap_err();

        assert!(matches!(err, ConnectionError::Disconnected));
        assert_eq!(stored(&handler), b"earlier\n");
    }

    #[test]
    fn test_read_error_discards_fragment() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);

        let mut reader = ScriptedReader::new(vec![
            ok(b"half"),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        ]);
        let err = handler.receive(&mut reader).unwrap_err();

        assert!(matches!(err, ConnectionError::Read(_)));
        assert_eq!(stored(&handler), b"");
    }

    #[test]
    fn test_immediate_disconnect() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);

        let mut reader = ScriptedReader::new(vec![]);
        let err = handler.receive(&mut reader).unwrap_err();
        assert!(matches!(err, ConnectionError::Disconnected));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_partial_message_discard_policy() {
        let store_write = ConnectionError::StoreWrite(StoreError::ShortWrite {
            written: 1,
            expected: 4,
        });
        assert!(store_write.discards_partial());
        assert!(ConnectionError::Disconnected.discards_partial());
        assert!(ConnectionError::Read(io::Error::from(io::ErrorKind::ConnectionReset))
            .discards_partial());

        let violation = ConnectionError::Protocol(ProtocolViolation { trailing: 2 });
        assert!(!violation.discards_partial());
    }

    #[test]
    fn test_store_write_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path().join("missing").join("messages"));
        let handler = ConnectionHandler::new(&store, 64);

        let mut reader = ScriptedReader::new(vec![ok(b"lost\n")]);
        let err = handler.receive(&mut reader).unwrap_err();

        assert!(matches!(err, ConnectionError::StoreWrite(_)));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_dispatch_returns_cumulative_content() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);

        handler
            .receive(&mut ScriptedReader::new(vec![ok(b"hello\n")]))
            .unwrap();
        handler
            .receive(&mut ScriptedReader::new(vec![ok(b"world\n")]))
            .unwrap();

        let mut out = Vec::new();
        let sent = handler.dispatch(&mut out).unwrap();
        assert_eq!(sent, 12);
        assert_eq!(out, b"hello\nworld\n");
    }

    #[test]
    fn test_dispatch_short_send() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 8);
        store.appender().append(b"0123456789\n").unwrap();

        let mut writer = ShortWriter {
            limit: 3,
            written: Vec::new(),
        };
        let err = handler.dispatch(&mut writer).unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::ShortSend {
                sent: 3,
                expected: 8
            }
        ));
        assert_eq!(writer.written, b"012");
    }

    #[test]
    fn test_dispatch_without_store() {
        let (_dir, store) = temp_store();
        let handler = ConnectionHandler::new(&store, 64);

        let err = handler.dispatch(&mut Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, ConnectionError::StoreOpen(_)));
    }
}
