//! Dual-format wire codec: RESP array frames and newline-terminated inline
//! frames share the same command grammar. Frame format is tracked per
//! *frame*, not per connection, so each reply is encoded in whatever format
//! its request arrived in.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::{Reply, ReplyKind};
use crate::error::{FerroError, Result};

/// Which framing the most recently read request used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    Inline,
    Array,
}

/// One decoded request: its framing (so the reply matches) plus its
/// whitespace/array-split argument tokens, each a raw byte string.
pub struct Frame {
    pub mode: FormatMode,
    pub args: Vec<Vec<u8>>,
}

/// Read one frame from `reader`. Returns `Ok(None)` on clean EOF. Blank
/// inline lines are skipped, so plain newlines sent between commands do not
/// register as empty requests.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix('*') {
            let count: i64 = rest
                .parse()
                .map_err(|_| FerroError::Protocol("ERR invalid RESP".to_string()))?;
            if count < 0 {
                return Err(FerroError::Protocol("ERR invalid RESP".to_string()));
            }
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                args.push(read_bulk_string(reader).await?);
            }
            return Ok(Some(Frame {
                mode: FormatMode::Array,
                args,
            }));
        }

        let args = trimmed
            .split_whitespace()
            .map(|tok| tok.as_bytes().to_vec())
            .collect();
        return Ok(Some(Frame {
            mode: FormatMode::Inline,
            args,
        }));
    }
}

async fn read_bulk_string<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_line = String::new();
    let n = reader.read_line(&mut len_line).await?;
    if n == 0 {
        return Err(FerroError::Protocol("ERR invalid RESP".to_string()));
    }
    let len_line = len_line.trim_end_matches(['\r', '\n']);
    let len: i64 = len_line
        .strip_prefix('$')
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FerroError::Protocol("ERR invalid RESP".to_string()))?;
    if len < 0 {
        return Err(FerroError::Protocol("ERR invalid RESP".to_string()));
    }

    let mut buf = vec![0u8; len as usize + 2]; // payload + trailing \r\n
    tokio::io::AsyncReadExt::read_exact(reader, &mut buf).await?;
    buf.truncate(len as usize);
    Ok(buf)
}

/// Encode and write `reply` to `writer` in `mode`'s wire format.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mode: FormatMode,
    reply: &Reply,
) -> Result<()> {
    match mode {
        FormatMode::Array => write_array_reply(writer, reply).await,
        FormatMode::Inline => write_inline_reply(writer, reply).await,
    }
}

async fn write_array_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> Result<()> {
    match reply.kind {
        ReplyKind::Simple => {
            writer
                .write_all(format!("+{}\r\n", reply.text).as_bytes())
                .await?
        }
        ReplyKind::Error => {
            writer
                .write_all(format!("-{}\r\n", reply.text).as_bytes())
                .await?
        }
        ReplyKind::Integer => {
            writer
                .write_all(format!(":{}\r\n", reply.integer).as_bytes())
                .await?
        }
        ReplyKind::Bulk => {
            let bytes = reply.bytes.clone().unwrap_or_default();
            writer
                .write_all(format!("${}\r\n", bytes.len()).as_bytes())
                .await?;
            writer.write_all(&bytes).await?;
            writer.write_all(b"\r\n").await?;
        }
        ReplyKind::Null => writer.write_all(b"$-1\r\n").await?,
        ReplyKind::Close => {
            writer
                .write_all(format!("+{}\r\n", reply.text).as_bytes())
                .await?
        }
    }
    Ok(())
}

async fn write_inline_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> Result<()> {
    let line = match reply.kind {
        ReplyKind::Bulk => reply.text.clone(),
        ReplyKind::Null => "(nil)".to_string(),
        _ => reply.text.clone(),
    };
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Write the inline-mode `<db>> ` prompt. Array mode never emits one.
pub async fn write_prompt<W: AsyncWrite + Unpin>(writer: &mut W, db: usize) -> Result<()> {
    writer
        .write_all(format!("{db}> ").as_bytes())
        .await?;
    Ok(())
}
