use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{StreamExt, future};
use lib_relay::{BoxFrameStream, Controller, Frame, RelayError, WsProviderConnector};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub type RelayController = Controller<WsProviderConnector>;

#[derive(Clone)]
struct IngressState {
    controller: Arc<RelayController>,
}

pub fn router(controller: Arc<RelayController>, ingress_path: &str) -> Router {
    Router::new()
        .route(ingress_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(IngressState { controller })
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    log::info!("App ingress listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<IngressState>,
) -> Response {
    let supervisor = state.controller.supervisor().clone();

    // Upgrade failures are fatal for the whole relay.
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            supervisor.report_fatal(format!("app upgrade from {} failed: {}", peer, rejection));
            return rejection.into_response();
        }
    };

    ws.on_failed_upgrade(move |e| {
        supervisor.report_fatal(format!("app upgrade from {} failed: {}", peer, e));
    })
    .on_upgrade(move |socket| async move {
        state
            .controller
            .attach_ingress(peer.to_string(), app_frames(socket));
    })
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

/// Adapts the app socket to the relay's frame stream. Control frames are
/// dropped; the stream ends when the peer closes.
fn app_frames(socket: WebSocket) -> BoxFrameStream {
    Box::pin(socket.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes))),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Close(_)) => None,
            Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use lib_relay::{Event, ProviderRole, RelaySettings, WorkerState};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const WAIT: Duration = Duration::from_secs(5);

    /// Accepts a single provider connection and forwards every text frame.
    async fn provider_server() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    let _ = tx.send(text.as_str().to_owned());
                }
            }
        });

        (url, rx)
    }

    async fn start_ingress(controller: Arc<RelayController>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(controller, "/app/ws");
        tokio::spawn(serve(listener, app, std::future::pending()));
        addr
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(WAIT, rx.recv())
            .await
            .expect("no frame in time")
            .expect("provider connection closed")
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    #[tokio::test]
    async fn app_events_are_drained_to_primary_then_relayed_to_both() {
        let (primary_url, mut primary_rx) = provider_server().await;
        let (backup_url, mut backup_rx) = provider_server().await;
        let settings = RelaySettings {
            primary_url,
            backup_url,
            ..Default::default()
        };
        let controller = Controller::new(settings, WsProviderConnector).unwrap();
        let addr = start_ingress(controller.clone()).await;

        let (mut app, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/app/ws"))
            .await
            .unwrap();
        app.send(WsMessage::text("{broken")).await.unwrap();
        for id in ["1", "2", "3"] {
            let event = format!(r#"{{"id":"{id}","payload":"p{id}"}}"#);
            app.send(WsMessage::text(event)).await.unwrap();
        }
        wait_until(|| controller.buffer().len() == 3).await;

        controller.start();

        for id in ["1", "2", "3"] {
            let sent: Event = serde_json::from_str(&recv(&mut primary_rx).await).unwrap();
            assert_eq!(sent.id, id);
            assert_eq!(sent.payload, format!("p{id}"));
        }

        wait_until(|| controller.worker_state(ProviderRole::Backup).is_some()).await;
        for role in [ProviderRole::Primary, ProviderRole::Backup] {
            let mut state = controller.worker_state(role).unwrap();
            timeout(WAIT, state.wait_for(|s| *s == WorkerState::PassThrough))
                .await
                .unwrap()
                .unwrap();
        }
        assert!(controller.failover().is_fired());

        app.send(WsMessage::text("live frame")).await.unwrap();
        assert_eq!(recv(&mut primary_rx).await, "live frame");
        assert_eq!(recv(&mut backup_rx).await, "live frame");
    }

    #[tokio::test]
    async fn health_endpoint_answers_ok() {
        let controller = Controller::new(RelaySettings::default(), WsProviderConnector).unwrap();
        let addr = start_ingress(controller).await;

        let response = raw_get(addr, "/health").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("OK"));
    }

    #[tokio::test]
    async fn plain_request_on_ingress_path_is_fatal() {
        let controller = Controller::new(RelaySettings::default(), WsProviderConnector).unwrap();
        let addr = start_ingress(controller.clone()).await;

        let response = raw_get(addr, "/app/ws").await;
        assert!(!response.starts_with("HTTP/1.1 101"));

        let reason = timeout(WAIT, controller.supervisor().fatal()).await.unwrap();
        assert!(reason.starts_with("app upgrade from 127.0.0.1:"));
    }
}
