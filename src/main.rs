use serde::Serialize;
use tsubame::{Body, Response, Server, DEFAULT_PORT};

#[derive(Serialize)]
struct Version {
    name: &'static str,
    version: &'static str,
}

#[tokio::main]
async fn main() {
    env_logger::builder().filter_level(log::LevelFilter::Info).parse_default_env().init();

    let port = std::env::var("TSUBAME_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let mut server = Server::new();

    let routes = [
        server.register("^/hello$", |_req| async { Response::text("Hello, World!") }),
        server.register("^/hello/([^/]+)$", |req| async move {
            Response::text(format!("Hello, {}!", req.group(0).unwrap_or("World")))
        }),
        server.register("^/json$", |_req| async {
            match Body::json(&Version { name: "tsubame", version: env!("CARGO_PKG_VERSION") }) {
                Ok(body) => Response::Ok(body),
                Err(_) => Response::InternalServerError,
            }
        }),
        server.register("^/echo$", |req| async move {
            match req.body {
                Some(body) => Response::Ok(Body::Bytes(body)),
                None => Response::BadRequest,
            }
        }),
        server.register("^/old$", |_req| async { Response::MovedPermanently("/hello".to_string()) }),
        server.register_directory("^/static/(.+)$", "./public"),
    ];
    for result in routes {
        if let Err(e) = result {
            log::error!("{}", e);
        }
    }

    if let Err(e) = server.start(port).await {
        log::error!("failed to start: {}", e);
        std::process::exit(1);
    }
    log::info!("routes: {:?}", server.routes());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to wait for ctrl-c: {}", e);
    }
    server.stop().await;
    server.drain().await;
}
