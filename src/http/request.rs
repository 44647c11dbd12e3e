use std::io;

use bytes::Bytes;
use log::trace;
use percent_encoding::percent_decode_str;
use smallvec::SmallVec;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::error::{Result, TsubameError};
use crate::http::header::Headers;

/// ルーターが埋めるキャプチャグループ
/// 大抵は数個なのでヒープを避ける
pub type CapturedGroups = SmallVec<[String; 4]>;

/// Content-Length を信用して先に確保する上限
const BODY_PREALLOC_LIMIT: usize = 64 * 1024;

/// 受信したHTTPリクエスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 生のパス (クエリ文字列を含む)
    pub path: String,
    /// 受信したままのメソッドトークン
    pub method: String,
    pub headers: Headers,
    /// `?` 以降をデコードしたもの (出現順)
    pub query_params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// パーサは空で返す、ルーティング後にサーバーが埋める
    pub captured_groups: CapturedGroups,
}

impl Request {
    /// テストやハンドラの合成用
    pub fn new(method: &str, path: &str) -> Request {
        Request {
            path: path.to_string(),
            method: method.to_string(),
            headers: Headers::new(),
            query_params: parse_query(path),
            body: None,
            captured_groups: CapturedGroups::new(),
        }
    }

    /// クエリ文字列を除いたパス
    /// 例: "/api/v1/user?id=123" -> "/api/v1/user"
    #[inline]
    pub fn literal_path(&self) -> &str {
        literal_path(&self.path)
    }

    #[inline]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// 最初に出現したクエリパラメータを取得する
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// n番目のキャプチャグループ (0始まり)
    pub fn group(&self, index: usize) -> Option<&str> {
        self.captured_groups.get(index).map(String::as_str)
    }

    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[inline]
pub fn literal_path(path: &str) -> &str {
    path.split_once('?').map(|(p, _)| p).unwrap_or(path)
}

/// `?` 以降を `&` と `=` で分割してパーセントデコードする
/// `=` を含まない組とキーが空の組は捨てる
pub fn parse_query(path: &str) -> Vec<(String, String)> {
    let Some((_, query)) = path.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((decode(key), decode(value)))
        })
        .collect()
}

#[inline]
fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// 1接続に1つ
/// 読みかけのバイトを保持するので keep-alive 中は使い回す
pub struct RequestParser<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RequestParser<R> {
    pub fn new(reader: R) -> Self {
        RequestParser {
            reader: BufReader::new(reader),
            line: Vec::with_capacity(256),
        }
    }

    /// 次のリクエストを読む
    /// ストリーム終端なら `Ok(None)`
    pub async fn next_request(&mut self) -> Result<Option<Request>> {
        let status_line = match self.next_line().await? {
            Some(line) => line,
            None => return Ok(None),
        };
        trace!("status line: {:?}", status_line);

        // [GET, /json, HTTP/1.1], 3番目以降 (バージョン) は見ない
        let parsed = {
            let mut tokens = status_line.split(' ').filter(|t| !t.is_empty());
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(method), Some(path), Some(_)) => Some((method.to_string(), path.to_string())),
                _ => None,
            }
        };
        let Some((method, path)) = parsed else {
            return Err(TsubameError::InvalidStatusLine(status_line));
        };

        let headers = self.next_headers().await?;

        let body = match headers.content_length() {
            Some(len) => Some(self.read_body(len).await?),
            None => None,
        };

        Ok(Some(Request {
            query_params: parse_query(&path),
            path,
            method,
            headers,
            body,
            captured_groups: CapturedGroups::new(),
        }))
    }

    async fn next_headers(&mut self) -> Result<Headers> {
        let mut headers = Headers::new();
        loop {
            let line = self.next_line().await?.ok_or(TsubameError::UnexpectedEof)?;
            if line.is_empty() {
                return Ok(headers);
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                continue;
            }
            headers.insert(name, value);
        }
    }

    async fn read_body(&mut self, len: usize) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(len.min(BODY_PREALLOC_LIMIT));
        (&mut self.reader)
            .take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(TsubameError::BodyRead)?;
        if buf.len() < len {
            return Err(TsubameError::BodyRead(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} body bytes, got {}", len, buf.len()),
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// LF までを1行として読む
    /// LF 直前の CR だけを落とし、他のバイトはそのまま
    async fn next_line(&mut self) -> Result<Option<String>> {
        self.line.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|e| TsubameError::socket("recv", e))?;
        if n == 0 {
            return Ok(None);
        }
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.line).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_one(raw: &[u8]) -> Result<Option<Request>> {
        RequestParser::new(raw).next_request().await
    }

    #[tokio::test]
    async fn parses_status_line_headers_and_query() {
        let req = parse_one(b"GET /x?a=1&b=2 HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/x?a=1&b=2");
        assert_eq!(req.literal_path(), "/x");
        assert_eq!(
            req.query_params,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert_eq!(req.header("host"), Some("h"));
        assert!(req.body.is_none());
        assert!(req.captured_groups.is_empty());
    }

    #[tokio::test]
    async fn reads_exact_content_length_body() {
        let req = parse_one(b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloEXTRA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.body.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn short_body_is_body_read_error() {
        let err = parse_one(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabc")
            .await
            .unwrap_err();
        assert!(matches!(err, TsubameError::BodyRead(_)));
    }

    #[tokio::test]
    async fn empty_stream_is_end_of_stream() {
        assert!(parse_one(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_status_line_is_rejected() {
        let err = parse_one(b"GET /\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, TsubameError::InvalidStatusLine(ref l) if l == "GET /"));
    }

    #[tokio::test]
    async fn eof_inside_headers_is_unexpected_eof() {
        let err = parse_one(b"GET / HTTP/1.1\r\nHost: h\r\n").await.unwrap_err();
        assert!(matches!(err, TsubameError::UnexpectedEof));
    }

    #[tokio::test]
    async fn malformed_header_lines_are_skipped() {
        let req = parse_one(b"GET / HTTP/1.1\r\nno-colon\r\n: empty-name\r\nEmpty:   \r\nX-Tab: a\tb\r\nHost: h:8080\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.header("x-tab"), Some("a\tb"));
        assert_eq!(req.header("host"), Some("h:8080"));
    }

    #[tokio::test]
    async fn bare_lf_lines_and_extra_version_tokens() {
        let req = parse_one(b"DELETE /a HTTP/1.1 extra\nA: 1\n\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "DELETE");
        assert_eq!(req.header("a"), Some("1"));
    }

    #[tokio::test]
    async fn transfer_encoding_without_length_has_no_body() {
        let req = parse_one(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(req.body.is_none());
    }

    #[tokio::test]
    async fn parser_is_reused_across_keep_alive_requests() {
        let raw: &[u8] = b"GET /one HTTP/1.1\r\nConnection: keep-alive\r\n\r\nPOST /two HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /three HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new(raw);

        let first = parser.next_request().await.unwrap().unwrap();
        let second = parser.next_request().await.unwrap().unwrap();
        let third = parser.next_request().await.unwrap().unwrap();

        assert_eq!(first.path, "/one");
        assert_eq!(second.path, "/two");
        assert_eq!(second.body_text().as_deref(), Some("ok"));
        assert_eq!(third.path, "/three");
        assert!(parser.next_request().await.unwrap().is_none());
    }

    #[test]
    fn query_pairs_are_decoded_and_malformed_ones_dropped() {
        let q = parse_query("/s?name=J%C3%B6rg&flag&=x&empty=&k=a=b");
        assert_eq!(
            q,
            vec![
                ("name".to_string(), "Jörg".to_string()),
                ("empty".to_string(), String::new()),
                ("k".to_string(), "a=b".to_string()),
            ]
        );
        assert!(parse_query("/no-query").is_empty());
    }
}
