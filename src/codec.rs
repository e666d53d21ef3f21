//! JSON-RPC framing codec for LSP communication.
//!
//! LSP frames messages as `Content-Length: N\r\n\r\n{json}` over stdin/stdout.
//! [`FrameReader`] and [`FrameWriter`] handle the async read/write halves.
//!
//! The reader is deliberately forgiving: a malformed header block or an
//! unparseable JSON body skips that frame and keeps the stream alive. One
//! confused message from a language server must not kill the session.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Outcome of parsing one header block.
enum HeaderBlock {
    /// Headers parsed, body length known.
    Body(usize),
    /// `Content-Length` missing or unparseable; the delimiter was consumed,
    /// so the caller can move straight on to the next header block.
    Malformed,
}

/// Reads JSON-RPC frames from an async reader.
///
/// Parses `Content-Length` headers, reads exactly that many body bytes, and
/// deserializes the body as JSON.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns `Err` only on truncation mid-frame; malformed headers,
    /// oversized bodies, and invalid JSON are skipped.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        loop {
            let content_length = match self.read_headers().await? {
                Some(HeaderBlock::Body(len)) => len,
                Some(HeaderBlock::Malformed) => {
                    tracing::warn!("skipping frame with malformed headers");
                    continue;
                }
                None => return Ok(None), // EOF
            };

            if content_length > MAX_FRAME_BYTES {
                tracing::warn!(
                    "skipping oversized frame: Content-Length {content_length} exceeds {MAX_FRAME_BYTES}"
                );
                self.discard_body(content_length).await?;
                continue;
            }

            let mut body = vec![0u8; content_length];
            self.reader
                .read_exact(&mut body)
                .await
                .context("reading frame body")?;

            match serde_json::from_slice(&body) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    tracing::warn!("dropping frame with invalid JSON body: {e}");
                }
            }
        }
    }

    /// Parse one header block up to the empty-line separator.
    ///
    /// Returns `None` on EOF before any header bytes.
    async fn read_headers(&mut self) -> Result<Option<HeaderBlock>> {
        let mut content_length: Option<usize> = None;
        let mut malformed = false;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading header line")?;

            if bytes_read == 0 {
                // EOF is clean only at a frame boundary.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                bail!("unexpected EOF while reading headers");
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Empty line = end of headers
                break;
            }

            // LSP spec uses "Content-Length" but parse case-insensitively.
            if let Some(colon_pos) = trimmed.find(':') {
                let key = &trimmed[..colon_pos];
                if key.eq_ignore_ascii_case("Content-Length") {
                    match trimmed[colon_pos + 1..].trim().parse() {
                        Ok(len) => content_length = Some(len),
                        Err(_) => malformed = true,
                    }
                }
            }
            // Ignore other headers (e.g. Content-Type)
        }

        if malformed {
            return Ok(Some(HeaderBlock::Malformed));
        }
        match content_length {
            Some(len) => Ok(Some(HeaderBlock::Body(len))),
            None => Ok(Some(HeaderBlock::Malformed)),
        }
    }

    /// Read and throw away `len` body bytes to stay aligned with the stream.
    async fn discard_body(&mut self, mut len: usize) -> Result<()> {
        let mut chunk = [0u8; 8192];
        while len > 0 {
            let take = len.min(chunk.len());
            self.reader
                .read_exact(&mut chunk[..take])
                .await
                .context("discarding frame body")?;
            len -= take;
        }
        Ok(())
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(msg).context("serializing JSON-RPC frame")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(body.as_bytes())
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;

        Ok(())
    }
}
