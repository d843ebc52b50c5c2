//! Per-socket output queues and bounded burst histories.
//!
//! An [`OutputBuffer`] holds a FIFO of immutable byte views, so a partial
//! send can re-slice the head view without copying. A [`BurstQueue`] is the
//! bounded history of recently published units replayed to new clients.

use std::collections::VecDeque;
use std::io::{self, Write};

use bytes::Bytes;
use thiserror::Error;

/// Default hard cap on a client's pending output, in bytes.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 24 * 1024 * 1024;

/// An error while flushing an [`OutputBuffer`].
#[derive(Error, Debug)]
pub enum BufferError {
    /// The queue grew past its cap; the owning client must be evicted.
    #[error("output queue size exceeded: {size} > {max}")]
    QueueSizeExceeded { size: usize, max: usize },
    /// An I/O error other than `WouldBlock` (which is handled internally).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A FIFO of byte views with partial-send accounting.
#[derive(Debug)]
pub struct OutputBuffer {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    max_queue_size: usize,
    ready: bool,
}

impl OutputBuffer {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_bytes: 0,
            max_queue_size,
            ready: true,
        }
    }

    /// Appends a view to the queue. Nothing is sent until [`flush`].
    ///
    /// [`flush`]: OutputBuffer::flush
    pub fn add(&mut self, view: Bytes) {
        self.queued_bytes += view.len();
        self.queue.push_back(view);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes currently queued.
    pub fn queue_size(&self) -> usize {
        self.queued_bytes
    }

    /// Whether the last flush drained everything the socket would accept.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Writes queued views until the queue empties or the socket pushes
    /// back. Returns the number of bytes accepted by the socket.
    ///
    /// `WouldBlock` and partial sends clear the ready flag and return
    /// normally; other I/O errors propagate so the caller can close the
    /// handler. A queue still larger than the cap after the write loop is
    /// reported as [`BufferError::QueueSizeExceeded`].
    pub fn flush<W: Write>(&mut self, sock: &mut W) -> Result<usize, BufferError> {
        self.ready = true;
        let mut total = 0;

        while let Some(head) = self.queue.front() {
            match sock.write(head) {
                Ok(n) => {
                    total += n;
                    self.queued_bytes -= n;
                    if n < head.len() {
                        let rest = head.slice(n..);
                        self.queue[0] = rest;
                        self.ready = false;
                        break;
                    }
                    self.queue.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.ready = false;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if self.queued_bytes > self.max_queue_size {
            return Err(BufferError::QueueSizeExceeded {
                size: self.queued_bytes,
                max: self.max_queue_size,
            });
        }

        Ok(total)
    }
}

/// A bounded queue of recently published units.
///
/// Appending discards from the front until the total size fits under
/// `maxbytes` again. The newest unit is always retained, so one unit
/// larger than the cap stands alone rather than emptying the history.
#[derive(Debug, Default)]
pub struct BurstQueue {
    queue: VecDeque<Bytes>,
    maxbytes: usize,
    current_size: usize,
}

impl BurstQueue {
    pub fn new(maxbytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            maxbytes,
            current_size: 0,
        }
    }

    pub fn push(&mut self, data: Bytes) {
        self.current_size += data.len();
        self.queue.push_back(data);
        while self.current_size > self.maxbytes && self.queue.len() > 1 {
            match self.queue.pop_front() {
                Some(old) => self.current_size -= old.len(),
                None => break,
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.queue.iter()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn set_maxbytes(&mut self, maxbytes: usize) {
        self.maxbytes = maxbytes;
        while self.current_size > self.maxbytes && self.queue.len() > 1 {
            match self.queue.pop_front() {
                Some(old) => self.current_size -= old.len(),
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.current_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    /// A writer that accepts a fixed number of bytes per call, then EAGAIN.
    struct Throttled {
        accept: Vec<usize>,
        written: Vec<u8>,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.accept.pop() {
                Some(0) | None => Err(io::ErrorKind::WouldBlock.into()),
                Some(n) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn flush_drains_in_order() {
        let mut buf = OutputBuffer::new(DEFAULT_MAX_QUEUE_SIZE);
        buf.add(Bytes::from_static(b"hello "));
        buf.add(Bytes::from_static(b"world"));

        let mut sink = Throttled {
            accept: vec![64, 64],
            written: Vec::new(),
        };
        let sent = buf.flush(&mut sink).unwrap();
        assert_eq!(sent, 11);
        assert_eq!(sink.written, b"hello world");
        assert!(buf.is_empty());
        assert!(buf.ready());
    }

    #[test]
    fn partial_send_keeps_tail() {
        let mut buf = OutputBuffer::new(DEFAULT_MAX_QUEUE_SIZE);
        buf.add(Bytes::from_static(b"abcdef"));

        let mut sink = Throttled {
            accept: vec![4],
            written: Vec::new(),
        };
        let sent = buf.flush(&mut sink).unwrap();
        assert_eq!(sent, 4);
        assert!(!buf.ready());
        assert_eq!(buf.queue_size(), 2);

        let mut sink = Throttled {
            accept: vec![64],
            written: Vec::new(),
        };
        buf.flush(&mut sink).unwrap();
        assert_eq!(sink.written, b"ef");
        assert!(buf.is_empty());
    }

    #[test]
    fn eagain_clears_ready() {
        let mut buf = OutputBuffer::new(DEFAULT_MAX_QUEUE_SIZE);
        buf.add(Bytes::from_static(b"data"));

        let mut sink = Throttled {
            accept: vec![],
            written: Vec::new(),
        };
        let sent = buf.flush(&mut sink).unwrap();
        assert_eq!(sent, 0);
        assert!(!buf.ready());
        assert_eq!(buf.queue_size(), 4);
    }

    #[test]
    fn overflowing_queue_is_an_error() {
        let mut buf = OutputBuffer::new(8);
        buf.add(Bytes::from_static(b"0123456789"));

        let mut sink = Throttled {
            accept: vec![1],
            written: Vec::new(),
        };
        assert_matches!(
            buf.flush(&mut sink),
            Err(BufferError::QueueSizeExceeded { size: 9, max: 8 })
        );
    }

    #[test]
    fn io_errors_propagate() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buf = OutputBuffer::new(DEFAULT_MAX_QUEUE_SIZE);
        buf.add(Bytes::from_static(b"data"));
        assert_matches!(buf.flush(&mut Broken), Err(BufferError::Io(_)));
    }

    #[test]
    fn burst_queue_discards_from_the_front() {
        let mut burst = BurstQueue::new(10);
        burst.push(Bytes::from_static(b"aaaa"));
        burst.push(Bytes::from_static(b"bbbb"));
        assert_eq!(burst.current_size(), 8);

        burst.push(Bytes::from_static(b"cccc"));
        assert!(burst.current_size() <= 10);
        let contents: Vec<&[u8]> = burst.iter().map(|b| b.as_ref()).collect();
        assert_eq!(contents, vec![&b"bbbb"[..], &b"cccc"[..]]);
    }

    #[test]
    fn oversized_unit_stands_alone() {
        let mut burst = BurstQueue::new(6);
        burst.push(Bytes::from_static(b"abc"));
        burst.push(Bytes::from_static(b"0123456789"));
        // Everything older is discarded; the newest unit survives even
        // though it exceeds the cap on its own.
        let contents: Vec<&[u8]> = burst.iter().map(|b| b.as_ref()).collect();
        assert_eq!(contents, vec![&b"0123456789"[..]]);

        burst.push(Bytes::from_static(b"xyz"));
        assert_eq!(burst.current_size(), 3);
    }

    #[test]
    fn shrinking_maxbytes_discards() {
        let mut burst = BurstQueue::new(16);
        burst.push(Bytes::from_static(b"aaaaaaaa"));
        burst.push(Bytes::from_static(b"bbbbbbbb"));
        burst.set_maxbytes(8);
        assert_eq!(burst.current_size(), 8);
        let contents: Vec<&[u8]> = burst.iter().map(|b| b.as_ref()).collect();
        assert_eq!(contents, vec![&b"bbbbbbbb"[..]]);
    }
}
