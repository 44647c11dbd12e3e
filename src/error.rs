use std::io;

pub type Result<T> = std::result::Result<T, TsubameError>;

pub enum TsubameError {
    /// ソケット操作の失敗
    /// `call` は失敗したシステムコール名
    Socket { call: &'static str, source: io::Error },
    /// リクエストラインのトークンが3つ未満
    InvalidStatusLine(String),
    /// ヘッダの終端より前に接続が閉じられた
    UnexpectedEof,
    /// Content-Length 分のボディを読み切れなかった
    BodyRead(io::Error),
    /// ルートのパターンが正規表現としてコンパイルできない
    InvalidPattern { pattern: String, source: regex::Error },
    /// レスポンスボディのエンコード失敗
    Encode(String),
}

impl TsubameError {
    #[inline]
    pub fn socket(call: &'static str, source: io::Error) -> TsubameError {
        TsubameError::Socket { call, source }
    }

    /// 接続単位で閉じるだけのパースレベルのエラーか
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            TsubameError::InvalidStatusLine(_) | TsubameError::UnexpectedEof | TsubameError::BodyRead(_)
        )
    }
}

impl std::fmt::Display for TsubameError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TsubameError::Socket { call, source } => write!(f, "{}(...) failed: {}", call, source),
            TsubameError::InvalidStatusLine(line) => write!(f, "Invalid status line: {:?}", line),
            TsubameError::UnexpectedEof => write!(f, "Unexpected EOF while reading headers"),
            TsubameError::BodyRead(err) => write!(f, "Failed to read request body: {}", err),
            TsubameError::InvalidPattern { pattern, source } => write!(f, "Invalid route pattern {:?}: {}", pattern, source),
            TsubameError::Encode(message) => write!(f, "Failed to encode response body: {}", message),
        }
    }
}

impl std::fmt::Debug for TsubameError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TsubameError::Socket { call, source } => write!(f, "Socket({}: {:?})", call, source),
            TsubameError::InvalidStatusLine(line) => write!(f, "InvalidStatusLine({:?})", line),
            TsubameError::UnexpectedEof => write!(f, "UnexpectedEof"),
            TsubameError::BodyRead(err) => write!(f, "BodyRead({:?})", err),
            TsubameError::InvalidPattern { pattern, source } => write!(f, "InvalidPattern({:?}: {:?})", pattern, source),
            TsubameError::Encode(message) => write!(f, "Encode({})", message),
        }
    }
}

impl std::error::Error for TsubameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TsubameError::Socket { source, .. } => Some(source),
            TsubameError::BodyRead(err) => Some(err),
            TsubameError::InvalidPattern { source, .. } => Some(source),
            _ => None,
        }
    }
}
