use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::task::TaskTracker;

use crate::{
    error::TsubameError,
    http::{supports_keep_alive, write_response, Request, RequestParser, Response},
    router::{BoxedHandler, Router},
    server::transport::Connection,
};

pub type SharedRouter = Arc<RwLock<Router>>;

/// 接続1本につきタスク1つ
/// 上限なし、受け付け済みの接続は stop 後も自然に終わるまで走る
pub(crate) fn spawn_connection(tracker: &TaskTracker, mut conn: Connection, router: SharedRouter) {
    tracker.spawn(async move {
        let peer = conn.peer_addr().to_string();
        debug!("accepted connection from {}", peer);
        if let Some((reader, mut writer)) = conn.split() {
            connection_loop(reader, &mut writer, &router, &peer).await;
        }
        // すべてのリクエスト処理後、接続をクローズ
        conn.close();
        debug!("closed connection from {}", peer);
    });
}

/// 読む → ルーティング → ハンドラ → 書く を keep-alive の間くり返す
///
/// 終端、パース失敗、書き込み失敗ではレスポンスを返さずに抜ける
pub async fn connection_loop<R, W>(reader: R, writer: &mut W, router: &RwLock<Router>, peer: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parser = RequestParser::new(reader);

    loop {
        // 新しいリクエストが来るまで待機
        let mut req = match parser.next_request().await {
            Ok(Some(req)) => req,
            Ok(None) => {
                debug!("{} reached end of stream", peer);
                break;
            }
            Err(e) if e.is_parse_error() => {
                warn!("{} sent a malformed request: {}", peer, e);
                break;
            }
            Err(e) => {
                error!("Failed to read request from {}: {}", peer, e);
                break;
            }
        };
        // リクエストのタイミングを計測
        let rev_to_res_time = Instant::now();

        let keep_alive = supports_keep_alive(&req.headers);
        let head_info = format!("{} {} ", req.method, req.path);

        // 読み取りロックはハンドラを呼ぶ前に手放す
        let resolved = {
            let router = router.read().unwrap_or_else(PoisonError::into_inner);
            router.resolve(&req.path)
        };

        let ps_time = Instant::now();
        let response = match resolved {
            Some((handler, groups)) => {
                req.captured_groups = groups;
                call_handler(&handler, req).await
            }
            None => Response::NotFound,
        };
        let ps_time = ps_time.elapsed();

        let mut code = response.status_code();
        let written = match write_response(writer, &response, keep_alive).await {
            Err(TsubameError::Encode(reason)) => {
                // エンコードは書き込み前に失敗するので、まだ何も送っていない
                error!("{}- failed to encode body: {}", head_info, reason);
                code = Response::InternalServerError.status_code();
                write_response(writer, &Response::InternalServerError, keep_alive).await
            }
            other => other,
        };
        if let Err(e) = written {
            error!("Failed to write response to {}: {}", peer, e);
            break;
        }

        debug!(
            "\ntime:\n\tall_time: {:?}\n\tprocessing: {:?}",
            rev_to_res_time.elapsed(),
            ps_time
        );
        log_status(&head_info, code);

        if !keep_alive {
            break;
        }
    }
}

/// ハンドラの panic は 500 に変換する
async fn call_handler(handler: &BoxedHandler, req: Request) -> Response {
    match AssertUnwindSafe(async { handler(req).await }).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!("handler panicked, answering 500");
            Response::InternalServerError
        }
    }
}

/// ログ出力（レスポンスコードに応じて色分け）
fn log_status(head_info: &str, code: u16) {
    if code >= 500 {
        error!("{}- \x1b[31m{}\x1b[0m", head_info, code);
    } else if code >= 400 {
        warn!("{}- \x1b[33m{}\x1b[0m", head_info, code);
    } else if code >= 300 {
        info!("{}- \x1b[34m{}\x1b[0m", head_info, code);
    } else if code >= 200 {
        info!("{}- \x1b[32m{}\x1b[0m", head_info, code);
    } else {
        info!("{}- \x1b[36m{}\x1b[0m", head_info, code);
    }
}
