use std::io::Write;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TsubameError};
use crate::http::response::Response;

/// レスポンスをワイヤ上のバイト列にする
/// ボディのエンコードに失敗したら何も書かずにエラー
pub fn serialize(response: &Response, keep_alive: bool) -> Result<Vec<u8>> {
    let body = match response.body() {
        Some(body) => Some(body.encode()?),
        None => None,
    };
    let content_length = body.as_ref().map(|b| b.len()).unwrap_or(0);

    let mut buf = Vec::with_capacity(128 + content_length);
    // Vec への write! は失敗しない
    let _ = write!(buf, "HTTP/1.1 {} {}\r\n", response.status_code(), response.reason_phrase());
    let _ = write!(buf, "Content-Length: {}\r\n", content_length);
    if keep_alive {
        buf.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    for (name, value) in response.headers() {
        let _ = write!(buf, "{}: {}\r\n", name, value);
    }
    // コンテンツ開始の改行
    buf.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        buf.extend_from_slice(&body);
    }
    Ok(buf)
}

/// 1リクエストにつき1回だけ呼ぶ
/// `write_all` が部分書き込みを最後まで再試行する
pub async fn write_response<W>(writer: &mut W, response: &Response, keep_alive: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = serialize(response, keep_alive)?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| TsubameError::socket("write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| TsubameError::socket("write", e))
}
