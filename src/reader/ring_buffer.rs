//! Bounded byte pipe between a producer thread that pushes chunks and a
//! consumer that pulls them through [`Read`].
//!
//! The producer blocks while the pipe is full and the consumer blocks while
//! it is empty. Dropping the consumer cancels the producer: pending and
//! later writes fail with [`io::ErrorKind::BrokenPipe`], and the consumer
//! waits for the producer thread to wind down.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use tracing::{trace, warn};

/// Largest chunk carried by one message.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight before the producer blocks.
pub const DEFAULT_CAPACITY: usize = 16;

/// Shared flag telling a producer to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "reader side of the pipe is gone")
}

/// Producer end. Dropping it ends the stream.
pub struct RingWriter {
    sender: Sender<io::Result<Vec<u8>>>,
    token: CancellationToken,
}

impl RingWriter {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Ends the stream with `error`, which the consumer receives after the
    /// chunks already queued.
    pub fn fail(self, error: io::Error) {
        if self.sender.send(Err(error)).is_err() {
            trace!("pipe failure dropped, consumer is gone");
        }
    }
}

impl Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(cancelled());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(CHUNK_SIZE);
        self.sender
            .send(Ok(buf[..len].to_vec()))
            .map_err(|_| cancelled())?;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Consumer end.
pub struct RingReader {
    receiver: Option<Receiver<io::Result<Vec<u8>>>>,
    chunk: Vec<u8>,
    position: usize,
    token: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl RingReader {
    /// Ties the producer thread to this reader, joined when it drops.
    pub fn attach(&mut self, worker: JoinHandle<()>) {
        self.worker = Some(worker);
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.position == self.chunk.len() {
            let Some(receiver) = &self.receiver else {
                return Ok(0);
            };
            match receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.position = 0;
                }
                Ok(Err(error)) => {
                    self.receiver = None;
                    return Err(error);
                }
                // producer finished and everything queued was drained
                Err(_) => {
                    self.receiver = None;
                    return Ok(0);
                }
            }
        }

        let len = buf.len().min(self.chunk.len() - self.position);
        buf[..len].copy_from_slice(&self.chunk[self.position..self.position + len]);
        self.position += len;
        Ok(len)
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.token.cancel();
        // unblocks a producer waiting on a full pipe
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("pipe producer thread panicked");
            }
        }
    }
}

/// A pipe holding at most `capacity` chunks.
pub fn ring_buffer(capacity: usize) -> (RingWriter, RingReader) {
    let (sender, receiver) = flume::bounded(capacity.max(1));
    let token = CancellationToken::new();

    let writer = RingWriter {
        sender,
        token: token.clone(),
    };
    let reader = RingReader {
        receiver: Some(receiver),
        chunk: Vec::new(),
        position: 0,
        token,
        worker: None,
    };
    (writer, reader)
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn test_bytes_arrive_in_order() {
        let (mut writer, mut reader) = ring_buffer(2);
        let worker = thread::spawn(move || {
            for i in 0..100u8 {
                writer.write_all(&[i; 1000]).unwrap();
            }
        });
        reader.attach(worker);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), 100_000);
        assert!(received.chunks(1000).enumerate().all(|(i, c)| c.iter().all(|b| *b == i as u8)));
    }

    #[test]
    fn test_failure_reaches_reader_after_data() {
        let (mut writer, mut reader) = ring_buffer(4);
        writer.write_all(b"partial").unwrap();
        writer.fail(io::Error::new(io::ErrorKind::InvalidData, "corrupt"));

        let mut head = [0u8; 7];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"partial");
        let err = reader.read(&mut head).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_dropping_reader_unblocks_producer() {
        let (mut writer, mut reader) = ring_buffer(1);
        let token = writer.token().clone();
        let worker = thread::spawn(move || {
            let chunk = vec![0u8; CHUNK_SIZE];
            loop {
                if let Err(error) = writer.write_all(&chunk) {
                    assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
                    break;
                }
            }
        });
        reader.attach(worker);

        let mut first = [0u8; 10];
        reader.read_exact(&mut first).unwrap();
        drop(reader);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_end_of_stream_when_writer_drops() {
        let (writer, mut reader) = ring_buffer(1);
        drop(writer);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
