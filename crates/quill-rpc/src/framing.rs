//! Content-Length framed JSON-RPC transport helpers.

use std::io::{BufRead, Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Reads one `Content-Length` framed JSON value. Returns `Ok(None)` on a
/// clean end of stream before any header byte.
pub fn read_content_length_frame<R>(reader: &mut R) -> Result<Option<Value>>
where
    R: BufRead,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let bytes = reader
            .read_line(&mut line)
            .context("failed to read rpc frame header line")?;
        if bytes == 0 {
            if saw_header {
                bail!("unexpected eof while reading rpc frame headers");
            }
            return Ok(None);
        }
        saw_header = true;
        if line == "\n" || line == "\r\n" {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (name, value) = trimmed.split_once(':').ok_or_else(|| {
            anyhow!(
                "invalid rpc header '{}': expected 'Name: value' format",
                trimmed
            )
        })?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .context("invalid Content-Length header value")?;
            content_length = Some(parsed);
        }
    }

    let content_length =
        content_length.ok_or_else(|| anyhow!("rpc frame is missing Content-Length header"))?;
    let mut body = vec![0_u8; content_length];
    reader
        .read_exact(&mut body)
        .context("failed to read rpc frame body bytes")?;
    let value = serde_json::from_slice::<Value>(&body).context("failed to parse rpc JSON frame")?;
    Ok(Some(value))
}

pub fn write_content_length_frame<W>(writer: &mut W, value: &Value) -> Result<()>
where
    W: Write,
{
    let encoded = serde_json::to_vec(value).context("failed to encode rpc response")?;
    write!(writer, "Content-Length: {}\r\n\r\n", encoded.len())
        .context("failed to write rpc frame header")?;
    writer
        .write_all(&encoded)
        .context("failed to write rpc frame body")?;
    writer.flush().context("failed to flush rpc frame output")?;
    Ok(())
}

pub fn request_frame(id: Value, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn result_frame(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn error_frame(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::{read_content_length_frame, write_content_length_frame};

    #[test]
    fn unit_frame_round_trips_through_buffer() {
        let mut buffer = Vec::new();
        let frame = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        write_content_length_frame(&mut buffer, &frame).expect("write frame");

        let mut reader = Cursor::new(buffer);
        let decoded = read_content_length_frame(&mut reader)
            .expect("read frame")
            .expect("frame present");
        assert_eq!(decoded, frame);
        assert!(read_content_length_frame(&mut reader)
            .expect("clean eof")
            .is_none());
    }

    #[test]
    fn unit_missing_content_length_header_is_rejected() {
        let mut reader = Cursor::new(b"X-Other: 1\r\n\r\n{}".to_vec());
        let error = read_content_length_frame(&mut reader).expect_err("missing header");
        assert!(error.to_string().contains("Content-Length"));
    }

    #[test]
    fn unit_truncated_body_is_rejected() {
        let mut reader = Cursor::new(b"Content-Length: 50\r\n\r\n{}".to_vec());
        assert!(read_content_length_frame(&mut reader).is_err());
    }
}
