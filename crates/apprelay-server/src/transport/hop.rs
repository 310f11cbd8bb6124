//! Relay hop: the WebSocket that carries upstream bytes to the target.

use super::websocket;
use apprelay_core::{BoxFuture, FramePair, RelayError, RelayResult, RouteInfo};
use tracing::debug;

/// Protocol number for web remote desktop relays.
pub const PROTOCOL_DESKTOP: u8 = 10;
/// Protocol number for web SSH (terminal and files).
pub const PROTOCOL_SSH: u8 = 11;

/// Opens message-framed connections to the relay hop.
pub trait HopConnector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, RelayResult<FramePair>>;
}

/// Build the hop URL for a route.
///
/// `<base>/<domain/>{local|mesh}relay.ashx?noping=1&p=<protocol>&auth=<cookie>`
pub fn hop_url(base: &str, domain: &str, route: &RouteInfo, protocol: u8, cookie: &str) -> String {
    let base = base.trim_end_matches('/');
    let domain_prefix = if domain.is_empty() {
        String::new()
    } else {
        format!("{domain}/")
    };
    let kind = if route.local { "local" } else { "mesh" };
    format!("{base}/{domain_prefix}{kind}relay.ashx?noping=1&p={protocol}&auth={cookie}")
}

/// Connects to the hop with tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsHopConnector;

impl HopConnector for WsHopConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, RelayResult<FramePair>> {
        Box::pin(async move {
            let (ws, response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| RelayError::Transport(format!("relay hop connect failed: {e}")))?;
            debug!(status = %response.status(), "relay hop connected");
            Ok(websocket::split(ws))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apprelay_core::Frame;

    fn route(local: bool) -> RouteInfo {
        RouteInfo {
            user_id: "user//admin".into(),
            domain_id: String::new(),
            node_id: "node//abc".into(),
            tcp_port: 22,
            local,
            groups: Vec::new(),
        }
    }

    #[test]
    fn url_shapes() {
        assert_eq!(
            hop_url("ws://127.0.0.1:443/", "", &route(false), PROTOCOL_SSH, "tok"),
            "ws://127.0.0.1:443/meshrelay.ashx?noping=1&p=11&auth=tok"
        );
        assert_eq!(
            hop_url("ws://127.0.0.1:443", "corp", &route(true), PROTOCOL_DESKTOP, "tok"),
            "ws://127.0.0.1:443/corp/localrelay.ashx?noping=1&p=10&auth=tok"
        );
    }

    #[tokio::test]
    async fn connects_to_listener() {
        let (addr, mut rx) = websocket::start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let url = hop_url(&format!("ws://{addr}"), "", &route(false), PROTOCOL_SSH, "tok");
        let mut pair = WsHopConnector.connect(&url).await.unwrap();
        let mut server_side = rx.recv().await.unwrap();
        assert!(server_side.path.starts_with("/meshrelay.ashx?"));
        server_side.frames.sink.send(Frame::Text("c".into())).await.unwrap();
        assert!(pair.source.recv().await.unwrap().unwrap().is_ready_signal());
    }

    #[tokio::test]
    async fn connect_failure_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = WsHopConnector
            .connect(&format!("ws://{addr}/meshrelay.ashx"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
