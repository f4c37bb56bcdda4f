use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the request task receives for its body.
#[derive(Debug)]
pub enum BodyFrame {
    Chunk(Bytes),
    /// The body is complete; wait at most `response_timeout` for the reply.
    End { response_timeout: Duration },
}

/// The gzip body of one intake request, fed incrementally.
///
/// Compressed output is handed to the request task as soon as the encoder
/// produces it, so `compressed_bytes` tracks what actually went on the wire.
#[derive(Debug)]
pub struct ChoppedStream {
    encoder: GzEncoder<Vec<u8>>,
    body: mpsc::UnboundedSender<BodyFrame>,
    compressed_bytes: usize,
    uncompressed_bytes: usize,
    lines: usize,
}

impl ChoppedStream {
    /// Starts a body whose first line is the metadata document.
    pub fn open(metadata_line: &[u8], body: mpsc::UnboundedSender<BodyFrame>) -> io::Result<Self> {
        let mut stream = Self {
            encoder: GzEncoder::new(Vec::with_capacity(16 * 1024), Compression::fast()),
            body,
            compressed_bytes: 0,
            uncompressed_bytes: 0,
            lines: 0,
        };
        stream.encoder.write_all(metadata_line)?;
        stream.uncompressed_bytes += metadata_line.len();
        stream.drain();
        Ok(stream)
    }

    pub fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.encoder.write_all(line)?;
        self.uncompressed_bytes += line.len();
        self.lines += 1;
        self.drain();
        Ok(())
    }

    /// Sync-flushes the compressor at the end of a micro-batch.
    pub fn sync(&mut self) -> io::Result<()> {
        self.encoder.flush()?;
        self.drain();
        Ok(())
    }

    /// True once the byte ceiling is reached and at least one event is in.
    pub fn should_rotate(&self, size: usize) -> bool {
        self.lines > 0 && self.compressed_bytes >= size
    }

    pub fn compressed_bytes(&self) -> usize {
        self.compressed_bytes
    }

    pub fn uncompressed_bytes(&self) -> usize {
        self.uncompressed_bytes
    }

    /// Number of event lines, the metadata line excluded.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Writes the gzip trailer and closes the body. Returns total compressed bytes.
    pub fn finish(mut self, response_timeout: Duration) -> io::Result<usize> {
        let tail = self.encoder.finish()?;
        self.compressed_bytes += tail.len();
        if !tail.is_empty() {
            let _ = self.body.send(BodyFrame::Chunk(Bytes::from(tail)));
        }
        let _ = self.body.send(BodyFrame::End { response_timeout });
        Ok(self.compressed_bytes)
    }

    fn drain(&mut self) {
        let pending = self.encoder.get_mut();
        if pending.is_empty() {
            return;
        }
        let chunk = Bytes::copy_from_slice(pending);
        pending.clear();
        self.compressed_bytes += chunk.len();
        // A closed receiver means the request already failed; the outcome
        // arrives through the request task.
        let _ = self.body.send(BodyFrame::Chunk(chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn collect(rx: &mut mpsc::UnboundedReceiver<BodyFrame>) -> (Vec<u8>, Option<Duration>) {
        let mut body = Vec::new();
        let mut end = None;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                BodyFrame::Chunk(bytes) => body.extend_from_slice(&bytes),
                BodyFrame::End { response_timeout } => end = Some(response_timeout),
            }
        }
        (body, end)
    }

    #[test]
    fn test_body_decompresses_to_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stream = ChoppedStream::open(b"{\"metadata\":{}}\n", tx).unwrap();
        stream.write_line(b"{\"span\":{\"id\":\"a\"}}\n").unwrap();
        stream.write_line(b"{\"span\":{\"id\":\"b\"}}\n").unwrap();
        stream.sync().unwrap();
        assert_eq!(stream.lines(), 2);

        let total = stream.finish(Duration::from_secs(1)).unwrap();
        let (body, end) = collect(&mut rx);

        assert_eq!(total, body.len());
        assert_eq!(end, Some(Duration::from_secs(1)));

        let mut text = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut text).unwrap();
        assert_eq!(
            text,
            "{\"metadata\":{}}\n{\"span\":{\"id\":\"a\"}}\n{\"span\":{\"id\":\"b\"}}\n"
        );
    }

    #[test]
    fn test_sync_makes_size_visible() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut stream = ChoppedStream::open(b"{\"metadata\":{}}\n", tx).unwrap();
        assert!(!stream.should_rotate(1));

        stream.write_line(b"{\"span\":{}}\n").unwrap();
        stream.sync().unwrap();

        assert!(stream.compressed_bytes() > 0);
        assert!(stream.should_rotate(1));
        assert!(!stream.should_rotate(usize::MAX));
    }

    #[test]
    fn test_closed_receiver_is_tolerated() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut stream = ChoppedStream::open(b"{\"metadata\":{}}\n", tx).unwrap();
        stream.write_line(b"{\"error\":{}}\n").unwrap();
        assert!(stream.finish(Duration::from_secs(1)).is_ok());
    }
}
