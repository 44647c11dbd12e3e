//! 登録APIの上に乗る小さなハンドラ

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use log::debug;

use crate::{
    http::{Body, Request, Response},
    router::{boxed, BoxedHandler},
};

/// キャプチャグループ1をファイル名として `dir` 以下のファイルを返す
///
/// `dir` 先頭の `~` は `$HOME` に展開する。
/// グループが無い、ファイルが読めない、`dir` の外を指す場合は `NotFound`
pub fn directory(dir: impl Into<PathBuf>) -> Arc<BoxedHandler> {
    let root = Arc::new(expand_home(dir.into()));
    boxed(move |req: Request| {
        let root = Arc::clone(&root);
        async move { serve_file(&root, &req).await }
    })
}

async fn serve_file(root: &Path, req: &Request) -> Response {
    let Some(local) = req.group(0) else {
        return Response::NotFound;
    };
    let Some(path) = resolve_local(root, local) else {
        debug!("rejected path outside of {}: {:?}", root.display(), local);
        return Response::NotFound;
    };
    match tokio::fs::read(&path).await {
        Ok(data) => Response::Ok(Body::Bytes(Bytes::from(data))),
        Err(e) => {
            debug!("{}: {}", path.display(), e);
            Response::NotFound
        }
    }
}

/// `~` と `~/...` だけ (`~user` は展開しない)
/// HOME が無ければそのまま
fn expand_home(dir: PathBuf) -> PathBuf {
    let rest = match dir.strip_prefix("~") {
        Ok(rest) => rest.to_path_buf(),
        Err(_) => return dir,
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => dir,
    }
}

/// `..` やルート指定を含むものは拒否
fn resolve_local(root: &Path, local: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(local.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}
