use std::net::{Shutdown, SocketAddr};

use log::{debug, warn};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{
    TcpListener, TcpStream,
    tcp::{ReadHalf, WriteHalf},
};

use crate::error::{Result, TsubameError};
use crate::server::DEFAULT_TCP_BACKLOG;

/// `0.0.0.0:port` で待ち受けを開始する
/// 失敗したらどのシステムコールで落ちたかを返す (途中まで作ったソケットは drop で閉じる)
pub fn listen(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TsubameError::socket("socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TsubameError::socket("setsockopt", e))?;
    nosigpipe(&SockRef::from(&socket)).map_err(|e| TsubameError::socket("setsockopt", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TsubameError::socket("bind", e))?;
    socket
        .listen(DEFAULT_TCP_BACKLOG)
        .map_err(|e| TsubameError::socket("listen", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TsubameError::socket("fcntl", e))?;

    let listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(listener).map_err(|e| TsubameError::socket("listen", e))
}

/// クライアントが来るまで待つ
/// ソケット設定に失敗した接続はその1本だけ捨てて次を待つ
pub async fn accept(listener: &TcpListener) -> Result<Connection> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| TsubameError::socket("accept", e))?;
        if let Err(e) = nosigpipe(&SockRef::from(&stream)) {
            warn!("setsockopt(SO_NOSIGPIPE) for {} failed, dropping it: {}", peer, e);
            continue;
        }
        return Ok(Connection::new(stream, peer));
    }
}

/// ピアが読み側を閉じても SIGPIPE でプロセスが落ちないようにする
/// Apple 以外の unix では Rust ランタイムが SIGPIPE を無視済みで、EPIPE として返ってくる
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn nosigpipe(socket: &SockRef<'_>) -> std::io::Result<()> {
    socket.set_nosigpipe(true)
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn nosigpipe(_socket: &SockRef<'_>) -> std::io::Result<()> {
    Ok(())
}

/// 受け付けた1本の接続
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Connection {
        Connection {
            stream: Some(stream),
            peer,
        }
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// 読み書きの半分ずつを借りる
    /// 閉じた後は None
    pub fn split(&mut self) -> Option<(ReadHalf<'_>, WriteHalf<'_>)> {
        self.stream.as_mut().map(|s| s.split())
    }

    /// 両方向を shutdown してから手放す
    /// 2回目以降は何もしない
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
                // ピアが先に閉じていれば ENOTCONN になる
                debug!("shutdown({}) failed: {}", self.peer, e);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
