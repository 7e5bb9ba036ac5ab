//! Delimiter-terminated framing over async byte streams
//!
//! Both directions of the manager/worker protocol are newline-delimited, and
//! so is the upstream transcript stream. `FrameReader` buffers partial reads
//! until a delimiter arrives and yields each frame with the delimiter removed.
//!
//! Bytes left in the buffer when the stream closes without a final delimiter
//! are dropped (and logged). Upstream producers always terminate frames, so a
//! trailing fragment can only be a truncated write.

use futures_util::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 16 * 1024;

/// Errors raised while reading frames
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits an async byte stream into delimiter-terminated frames
pub struct FrameReader<R> {
    reader: R,
    delimiter: u8,
    buffer: Vec<u8>,
    /// Start of the unscanned region of `buffer`
    scanned: usize,
    closed: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, delimiter: u8) -> Self {
        Self {
            reader,
            delimiter,
            buffer: Vec::new(),
            scanned: 0,
            closed: false,
        }
    }

    /// Newline-delimited reader, the framing every voca stream uses
    pub fn lines(reader: R) -> Self {
        Self::new(reader, b'\n')
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` once the stream has closed and every complete frame
    /// has been yielded.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            if let Some(frame) = self.take_buffered() {
                return Ok(Some(frame));
            }
            if self.closed {
                return Ok(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.closed = true;
                if !self.buffer.is_empty() {
                    tracing::warn!(
                        dropped_bytes = self.buffer.len(),
                        "stream closed with an unterminated frame"
                    );
                    self.buffer.clear();
                    self.scanned = 0;
                }
                continue;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pop one complete frame out of the buffer, if there is one.
    fn take_buffered(&mut self) -> Option<Vec<u8>> {
        let offset = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == self.delimiter);

        match offset {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut frame: Vec<u8> = self.buffer.drain(..=end).collect();
                frame.pop();
                self.scanned = 0;
                Some(frame)
            }
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    /// Consume the reader as a stream of frames.
    ///
    /// The stream ends after the first read error, which is yielded as its
    /// last item.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, FrameError>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use proptest::prelude::*;

    async fn collect<R: AsyncRead + Unpin>(reader: R) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut reader = FrameReader::lines(reader);
        while let Some(frame) = reader.next_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_delimiter_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"hel")
            .read(b"lo\nwor")
            .read(b"ld\n")
            .build();

        assert_eq!(collect(mock).await, vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_one_read() {
        let mock = tokio_test::io::Builder::new()
            .read(b"a\nbb\n\nccc\n")
            .build();

        assert_eq!(
            collect(mock).await,
            vec![b"a".to_vec(), b"bb".to_vec(), b"".to_vec(), b"ccc".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_trailing_partial_frame_is_dropped() {
        let mock = tokio_test::io::Builder::new()
            .read(b"one\ntwo\nthr")
            .build();

        assert_eq!(collect(mock).await, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_stream_ends_cleanly() {
        let mock = tokio_test::io::Builder::new().build();
        assert!(collect(mock).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let mock = tokio_test::io::Builder::new()
            .read(b"ok\n")
            .read_error(std::io::Error::other("boom"))
            .build();

        let items: Vec<_> = FrameReader::lines(mock).into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), b"ok");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_custom_delimiter() {
        let mock = tokio_test::io::Builder::new().read(b"x;y;").build();
        let mut reader = FrameReader::new(mock, b';');
        assert_eq!(reader.next_frame().await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(reader.next_frame().await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    proptest! {
        #[test]
        fn test_any_chunking_yields_original_frames(
            frames in proptest::collection::vec("[a-z0-9 ]{0,12}", 0..8),
            cuts in proptest::collection::vec(1usize..7, 0..24),
        ) {
            let mut joined = Vec::new();
            for frame in &frames {
                joined.extend_from_slice(frame.as_bytes());
                joined.push(b'\n');
            }

            let mut builder = tokio_test::io::Builder::new();
            let mut rest = joined.as_slice();
            for cut in cuts {
                if rest.is_empty() {
                    break;
                }
                let take = cut.min(rest.len());
                builder.read(&rest[..take]);
                rest = &rest[take..];
            }
            if !rest.is_empty() {
                builder.read(rest);
            }
            let mock = builder.build();

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let got = runtime.block_on(collect(mock));
            let expected: Vec<Vec<u8>> = frames.iter().map(|f| f.as_bytes().to_vec()).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
