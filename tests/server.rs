use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::sleep;
use trellis::{Arguments, Error, Request, Router, Server};

/// Records whether the request's connection was already lost when the
/// handler future holding it was dropped.
struct LostAtDrop {
    req: Request,
    seen: Arc<Mutex<Option<bool>>>,
}

impl Drop for LostAtDrop {
    fn drop(&mut self) {
        *self.seen.lock().unwrap() = Some(self.req.is_connection_lost());
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn connect(port: u16) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server never started listening on {port}");
}

#[tokio::test]
async fn client_hang_up_cancels_the_handler() {
    let seen: Arc<Mutex<Option<bool>>> = Arc::default();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let started_tx = Arc::new(Mutex::new(Some(started_tx)));

    let record = Arc::clone(&seen);
    let router = Router::new().route("/slow", move |req: Request, _args: Arguments| {
        let guard = LostAtDrop { req, seen: Arc::clone(&record) };
        let started = started_tx.lock().unwrap().take();
        async move {
            let _guard = guard;
            if let Some(tx) = started {
                let _ = tx.send(());
            }
            std::future::pending::<()>().await;
            Ok::<_, Error>("unreachable")
        }
    });

    let port = free_port();
    let server = tokio::spawn(Server::bind(&format!("127.0.0.1:{port}")).serve(router));

    let mut client = connect(port).await;
    client
        .write_all(b"GET /slow HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();
    started_rx.await.unwrap();
    drop(client);

    let lost = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = *seen.lock().unwrap();
            if let Some(lost) = current {
                return lost;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler was never cancelled");

    assert!(lost, "handler was dropped before the connection was marked lost");
    server.abort();
}

#[tokio::test]
async fn served_requests_get_their_response() {
    let router = Router::new().route("/hello/<name>", |_req: Request, args: Arguments| async move {
        Ok::<_, Error>(format!("hello {}", args.get::<String>("name")?))
    });

    let port = free_port();
    let server = tokio::spawn(Server::bind(&format!("127.0.0.1:{port}")).serve(router));

    let mut client = connect(port).await;
    client
        .write_all(b"GET /hello/ada HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();

    assert!(raw.starts_with("HTTP/1.1 200 OK"), "{raw}");
    assert!(raw.ends_with("hello ada"), "{raw}");
    server.abort();
}
