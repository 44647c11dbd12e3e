use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::{Result, TsubameError};

/// レスポンスボディの種類
/// 中身のエンコードはコアの関心外で「バイト列を作るか失敗するか」だけ
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// テキストそのまま
    Raw(String),
    /// バイナリそのまま
    Bytes(Bytes),
    /// 整形済みJSONで送る
    Json(serde_json::Value),
    /// 書き込み直前にエンコードする
    /// 失敗したら 500 に差し替わる
    Deferred(Encoder),
}

type EncodeFn = dyn Fn() -> std::result::Result<Bytes, String> + Send + Sync;

/// 送信時に呼ばれるエンコーダ
#[derive(Clone)]
pub struct Encoder(Arc<EncodeFn>);

impl Encoder {
    pub fn new<F>(encode: F) -> Encoder
    where
        F: Fn() -> std::result::Result<Bytes, String> + Send + Sync + 'static,
    {
        Encoder(Arc::new(encode))
    }

    fn run(&self) -> Result<Bytes> {
        (self.0)().map_err(TsubameError::Encode)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Encoder(..)")
    }
}

// 同じクロージャを共有しているときだけ等しい
impl PartialEq for Encoder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Body {
    /// シリアライズ可能な値からJSONボディを作る
    /// 変換の失敗はここで返る
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Body> {
        serde_json::to_value(value)
            .map(Body::Json)
            .map_err(|e| TsubameError::Encode(e.to_string()))
    }

    /// 値を持ったまま、送信時に整形済みJSONへシリアライズする
    pub fn lazy_json<T>(value: T) -> Body
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        Body::Deferred(Encoder::new(move || {
            serde_json::to_vec_pretty(&value)
                .map(Bytes::from)
                .map_err(|e| e.to_string())
        }))
    }

    /// 送信するバイト列にエンコードする
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Body::Raw(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Body::Bytes(data) => Ok(data.clone()),
            Body::Json(value) => serde_json::to_vec_pretty(value)
                .map(Bytes::from)
                .map_err(|e| TsubameError::Encode(e.to_string())),
            Body::Deferred(encoder) => encoder.run(),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Raw(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Raw(text)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(data))
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}

/// ハンドラが返すレスポンス
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(Body),
    Created,
    Accepted,
    MovedPermanently(String),
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalServerError,
    /// 任意のステータスコード、理由句は常に "Custom"
    Raw(u16, String),
}

impl Response {
    #[inline]
    pub fn text(text: impl Into<String>) -> Response {
        Response::Ok(Body::Raw(text.into()))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Response::Ok(_) => 200,
            Response::Created => 201,
            Response::Accepted => 202,
            Response::MovedPermanently(_) => 301,
            Response::BadRequest => 400,
            Response::Unauthorized => 401,
            Response::Forbidden => 403,
            Response::NotFound => 404,
            Response::InternalServerError => 500,
            Response::Raw(code, _) => *code,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            Response::Ok(_) => "OK",
            Response::Created => "Created",
            Response::Accepted => "Accepted",
            Response::MovedPermanently(_) => "Moved Permanently",
            Response::BadRequest => "Bad Request",
            Response::Unauthorized => "Unauthorized",
            Response::Forbidden => "Forbidden",
            Response::NotFound => "Not Found",
            Response::InternalServerError => "Internal Server Error",
            Response::Raw(_, _) => "Custom",
        }
    }

    /// バリアント固有のヘッダ
    /// 今のところリダイレクトの Location だけ
    pub fn headers(&self) -> SmallVec<[(&'static str, &str); 1]> {
        let mut headers = SmallVec::new();
        if let Response::MovedPermanently(location) = self {
            headers.push(("Location", location.as_str()));
        }
        headers
    }

    /// ボディを持つのは `Ok` だけ
    pub fn body(&self) -> Option<&Body> {
        match self {
            Response::Ok(body) => Some(body),
            _ => None,
        }
    }
}
