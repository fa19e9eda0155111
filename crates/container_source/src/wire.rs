//! Minimal HTTP/1.1-over-Unix-socket client, just enough to talk to the
//! container runtime's control socket (`GET /containers/json`, `GET
//! /events`, `GET /containers/{id}/logs`). There is no general-purpose
//! HTTP-over-UDS crate in the dependency stack, and pulling in a full async
//! HTTP client for three read-only GET endpoints against a local socket
//! would be a heavier dependency than the problem needs; `tokio::net::UnixStream`
//! plus `tokio::io::BufReader` is enough.

use std::path::Path;

use anyhow::Context;
use tokio::{
    io::{
        AsyncBufReadExt,
        AsyncReadExt,
        AsyncWriteExt,
        BufReader,
    },
    net::UnixStream,
};

pub struct UdsResponse {
    reader: BufReader<UnixStream>,
    chunked: bool,
}

impl UdsResponse {
    /// Opens `socket_path`, issues `GET path`, and returns a reader
    /// positioned at the start of the response body.
    pub async fn get(socket_path: &Path, path: &str) -> anyhow::Result<Self> {
        let mut stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("connecting to {}", socket_path.display()))?;

        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.context("writing request")?;

        let mut reader = BufReader::new(stream);
        let status = read_line(&mut reader).await?.context("connection closed before status line")?;
        if !status.contains("200") {
            anyhow::bail!("unexpected response status: {status}");
        }

        let mut chunked = false;
        loop {
            let line = read_line(&mut reader).await?.context("connection closed while reading headers")?;
            if line.is_empty() {
                break;
            }
            if line.to_ascii_lowercase().starts_with("transfer-encoding:") && line.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }

        Ok(Self { reader, chunked })
    }

    /// Reads one newline-delimited record from the (possibly chunked) body.
    /// Returns `Ok(None)` on clean EOF.
    pub async fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        if self.chunked {
            self.read_chunked_line().await
        } else {
            read_line(&mut self.reader).await
        }
    }

    /// Reads exactly `n` raw bytes from the body, dechunking transparently.
    /// Used for the 8-byte docker log-stream frame headers and their payload.
    pub async fn read_exact_raw(&mut self, buf: &mut [u8]) -> anyhow::Result<bool> {
        if self.chunked {
            self.read_exact_chunked(buf).await
        } else {
            match self.reader.read_exact(buf).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }

    async fn current_chunk_size(&mut self, leftover: &mut usize) -> anyhow::Result<bool> {
        if *leftover > 0 {
            return Ok(true);
        }
        let Some(size_line) = read_line(&mut self.reader).await? else {
            return Ok(false);
        };
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        if size_hex.is_empty() {
            return Ok(false);
        }
        let size = usize::from_str_radix(size_hex, 16).context("bad chunk size")?;
        if size == 0 {
            return Ok(false);
        }
        *leftover = size;
        Ok(true)
    }

    async fn read_chunked_line(&mut self) -> anyhow::Result<Option<String>> {
        // Chunk boundaries don't generally align with line boundaries, but in
        // practice the runtime emits one JSON object (or log frame) per
        // chunk; treat each chunk's payload as a line, which matches what
        // container runtimes actually send for `/events`.
        let mut leftover = 0usize;
        if !self.current_chunk_size(&mut leftover).await? {
            return Ok(None);
        }
        let mut buf = vec![0u8; leftover];
        self.reader.read_exact(&mut buf).await?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        Ok(Some(String::from_utf8_lossy(&buf).trim().to_string()))
    }

    async fn read_exact_chunked(&mut self, buf: &mut [u8]) -> anyhow::Result<bool> {
        let mut filled = 0;
        let mut leftover = 0usize;
        while filled < buf.len() {
            if !self.current_chunk_size(&mut leftover).await? {
                return Ok(false);
            }
            let take = leftover.min(buf.len() - filled);
            self.reader.read_exact(&mut buf[filled..filled + take]).await?;
            leftover -= take;
            filled += take;
            if leftover == 0 {
                let mut crlf = [0u8; 2];
                self.reader.read_exact(&mut crlf).await?;
            }
        }
        Ok(true)
    }
}

async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
