//! Ordered regex router (first match wins)
//!
//! 登録順に並んだ正規表現ルータ（最初にマッチしたものが勝つ）

use std::{future::Future, pin::Pin, sync::Arc};

use log::debug;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::{
    error::{Result, TsubameError},
    http::{request::literal_path, CapturedGroups, Request, Response},
};

/// Boxed async handler type for routing.
///
/// This type represents an async handler function that takes a request and returns a future of the response.
///
/// ルーティング用のBox化された非同期ハンドラ型。
/// リクエストを受け取り、レスポンスのFutureを返す非同期ハンドラ関数を表します。
pub type BoxedHandler = Box<
    dyn Fn(Request)
            -> Pin<
                Box<dyn Future<Output = Response> + Send>,
            > + Send
        + Sync,
>;

/// Wrap an async closure into a shared [`BoxedHandler`].
///
/// 非同期クロージャを共有可能な [`BoxedHandler`] に包みます。
pub fn boxed<F, Fut>(handler: F) -> Arc<BoxedHandler>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let boxed_handler: BoxedHandler = Box::new(move |req| Box::pin(handler(req)));
    Arc::new(boxed_handler)
}

/// A compiled pattern paired with its handler.
///
/// コンパイル済みパターンとハンドラの組。
pub struct Route {
    pattern: Regex,
    handler: Arc<BoxedHandler>,
}

impl Route {
    #[inline]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Number of capture groups, not counting the whole match.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.pattern.captures_len() - 1
    }
}

/// Route table kept in registration order.
///
/// Registration order is the only tie-break between overlapping patterns; specificity is never considered.
///
/// 登録順を保持するルートテーブル。
/// 重なるパターン同士は登録順だけで決まり、具体性は考慮しません。
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register an async handler for a regex pattern.
    ///
    /// An invalid pattern is reported as [`TsubameError::InvalidPattern`] and leaves the table untouched.
    ///
    /// 正規表現パターンに対してハンドラを登録します。
    /// 不正なパターンはエラーを返し、テーブルは変更されません。
    pub fn register<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.register_boxed(pattern, boxed(handler))
    }

    /// Register an already boxed handler.
    ///
    /// Box化済みのハンドラを登録します。
    pub fn register_boxed(&mut self, pattern: &str, handler: Arc<BoxedHandler>) -> Result<()> {
        let compiled = Regex::new(pattern).map_err(|source| TsubameError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        debug!("registered route #{}: {}", self.routes.len(), pattern);
        self.routes.push(Route { pattern: compiled, handler });
        Ok(())
    }

    /// Resolve a request path to a handler and its decoded capture groups.
    ///
    /// The query string is stripped first; the pattern may match anywhere in the remaining path.
    ///
    /// リクエストパスからハンドラとデコード済みキャプチャグループを解決します。
    /// クエリ文字列を除いたパスのどこかにマッチすれば採用されます。
    pub fn resolve(&self, path: &str) -> Option<(Arc<BoxedHandler>, CapturedGroups)> {
        let path = literal_path(path);
        self.routes.iter().find_map(|route| {
            let caps = route.pattern.captures(path)?;
            let groups = caps
                .iter()
                .skip(1)
                .map(|m| m.map(|m| decode_group(m.as_str())).unwrap_or_default())
                .collect();
            Some((Arc::clone(&route.handler), groups))
        })
    }

    /// Patterns in registration order.
    ///
    /// 登録順のパターン一覧。
    pub fn routes(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.pattern().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// デコードできないものは空文字
#[inline]
fn decode_group(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_default()
}
