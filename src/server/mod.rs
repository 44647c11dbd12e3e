pub mod transport;
pub mod worker;

use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use log::{error, info, warn};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_util::task::TaskTracker;

use crate::{
    error::{Result, TsubameError},
    handlers,
    http::{Request, Response},
    router::Router,
    server::{transport::Connection, worker::SharedRouter},
};

pub const DEFAULT_PORT: u16 = 8080;
/// accept 待ちの最大数
pub const DEFAULT_TCP_BACKLOG: i32 = 20;

/// 待ち受けソケットとルートテーブルを持つサーバー
///
/// ルートは `start` の前後どちらでも追加できる (読み取り優位のロックで守る)。
/// accept ループが終わるのは `stop` (か drop) のときだけ。
/// `stop` は accept ループを止めるだけで、受け付け済みの接続は強制終了しない。
pub struct Server {
    router: SharedRouter,
    connections: TaskTracker,
    running: Option<Running>,
}

struct Running {
    port: u16,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl Server {
    pub fn new() -> Server {
        Server {
            router: Arc::new(RwLock::new(Router::new())),
            connections: TaskTracker::new(),
            running: None,
        }
    }

    /// 正規表現パターンにハンドラを登録する
    /// 不正なパターンはエラーで返し、テーブルには入れない
    pub fn register<F, Fut>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.router
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(pattern, handler)
    }

    /// キャプチャグループ1のファイルを `dir` から返すルートを登録する
    pub fn register_directory(&self, pattern: &str, dir: impl Into<PathBuf>) -> Result<()> {
        self.router
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_boxed(pattern, handlers::directory(dir))
    }

    /// 登録順のパターン一覧
    pub fn routes(&self) -> Vec<String> {
        self.router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routes()
    }

    /// `0.0.0.0:port` で待ち受けを開始する
    /// 動作中なら先に止めてから bind し直す
    pub async fn start(&mut self, port: u16) -> Result<()> {
        self.stop().await;

        let listener = transport::listen(port)?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);
        info!("listening on 0.0.0.0:{}", port);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.router),
            self.connections.clone(),
            shutdown_rx,
        ));
        self.running = Some(Running {
            port,
            shutdown,
            accept_task,
        });
        Ok(())
    }

    /// 待ち受けソケットを閉じて accept ループを終わらせる
    /// 戻った時点でポートは解放済み
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        // ループが先に終わっていれば受信側は既にない
        let _ = running.shutdown.send(());
        if let Err(e) = running.accept_task.await {
            error!("accept loop on port {} failed: {}", running.port, e);
        }
        info!("stopped listening on 0.0.0.0:{}", running.port);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// 実際に bind したポート (port 0 で起動したときに使う)
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    /// まだ処理中の接続数
    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    /// 処理中の接続がすべて終わるまで待つ
    pub async fn drain(&self) {
        self.connections.close();
        self.connections.wait().await;
        self.connections.reopen();
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

/// 受け付けの失敗後に待つ時間
/// fd 枯渇などはすぐ再試行しても同じ結果になる
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// accept の出どころ
/// 普段は [`TcpListener`]、テストでは失敗を差し込める
pub(crate) trait Acceptor: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = Result<Connection>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = Result<Connection>> + Send {
        transport::accept(self)
    }
}

/// shutdown を受け取るまで回り続ける
/// accept の失敗では止まらない (待ち受けソケットを失うと二度と受け付けられない)
async fn accept_loop<A: Acceptor>(
    listener: A,
    router: SharedRouter,
    connections: TaskTracker,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            // stop() か Server の drop で抜ける
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(conn) => worker::spawn_connection(&connections, conn, Arc::clone(&router)),
            Err(e) if is_per_connection(&e) => warn!("{}", e),
            Err(e) => {
                warn!("{}, retrying in {:?}", e, ACCEPT_BACKOFF);
                // 待っている間も stop には応じる
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    // listener はここで drop されポートが解放される
}

/// 受け付け途中で相手が消えただけのエラーか
fn is_per_connection(err: &TsubameError) -> bool {
    use std::io::ErrorKind;
    match err {
        TsubameError::Socket { source, .. } => matches!(
            source.kind(),
            ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io, sync::Mutex};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    #[test]
    fn routes_are_listed_in_registration_order() {
        let server = Server::new();
        server.register("^/b$", |_req| async { Response::Accepted }).unwrap();
        server.register("^/a$", |_req| async { Response::Created }).unwrap();
        assert!(server.register("(", |_req| async { Response::Created }).is_err());
        server.register_directory("^/static/(.+)$", "/tmp").unwrap();

        assert_eq!(server.routes(), vec!["^/b$", "^/a$", "^/static/(.+)$"]);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let mut server = Server::new();
        assert!(!server.is_running());
        server.stop().await;
        assert_eq!(server.port(), None);
    }

    #[tokio::test]
    async fn start_reports_bound_port() {
        let mut server = Server::new();
        server.start(0).await.unwrap();
        assert!(server.is_running());
        assert_ne!(server.port(), Some(0));
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.live_connections(), 0);
    }

    /// 先頭の何回かだけ accept を失敗させる
    struct FlakyListener {
        listener: TcpListener,
        failures: Mutex<Vec<TsubameError>>,
    }

    impl Acceptor for FlakyListener {
        fn accept(&self) -> impl Future<Output = Result<Connection>> + Send {
            async move {
                let injected = self.failures.lock().unwrap().pop();
                match injected {
                    Some(e) => Err(e),
                    None => transport::accept(&self.listener).await,
                }
            }
        }
    }

    #[tokio::test]
    async fn accept_loop_survives_failed_accepts() {
        let listener = transport::listen(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let flaky = FlakyListener {
            listener,
            failures: Mutex::new(vec![
                // EMFILE
                TsubameError::socket("accept", io::Error::from_raw_os_error(24)),
                TsubameError::socket("setsockopt", io::Error::other("nosigpipe")),
                TsubameError::socket("accept", io::Error::from(io::ErrorKind::ConnectionAborted)),
            ]),
        };

        let mut router = Router::new();
        router.register("^/ping$", |_req| async { Response::text("pong") }).unwrap();
        let connections = TaskTracker::new();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            flaky,
            Arc::new(RwLock::new(router)),
            connections.clone(),
            shutdown_rx,
        ));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET /ping HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"));
        assert!(out.ends_with("pong"));

        // 止めるのは shutdown だけ
        assert!(!task.is_finished());
        shutdown.send(()).unwrap();
        task.await.unwrap();
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let listener = transport::listen(0).unwrap();
        let flaky = FlakyListener {
            listener,
            failures: Mutex::new(
                (0..1000)
                    .map(|_| TsubameError::socket("accept", io::Error::from_raw_os_error(24)))
                    .collect(),
            ),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            flaky,
            Arc::new(RwLock::new(Router::new())),
            TaskTracker::new(),
            shutdown_rx,
        ));
        // バックオフ中に止める
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
