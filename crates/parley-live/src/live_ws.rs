//! WebSocket transport to the Gemini Live endpoint.

use crate::config::LiveConfig;
use crate::credentials::KeySource;
use crate::error::VoiceResult;
use crate::protocol;
use crate::transport::{Connector, ServerEvent, TransportHandle, TransportLink};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type LiveSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnector {
    keys: Box<dyn KeySource>,
}

impl WsConnector {
    pub fn new(keys: Box<dyn KeySource>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &LiveConfig) -> VoiceResult<TransportHandle> {
        let key = self.keys.confirm().await?;
        info!("🌐 Connecting to {} ({})", config.endpoint, config.model);

        let url = format!("{}?key={}", config.endpoint, key);
        let (mut socket, _response) = connect_async(url.as_str()).await?;
        socket
            .send(Message::Text(protocol::setup_message(&config.model, &config.voice)?))
            .await?;
        debug!("Setup sent, waiting for setupComplete");

        let (mut handle, link) = TransportHandle::pair();
        handle.attach_driver(tokio::spawn(drive(socket, link)));
        Ok(handle)
    }
}

/// Pump outbound chunks and inbound frames until either side closes. Always
/// finishes by emitting `Closed`.
async fn drive(socket: LiveSocket, link: TransportLink) {
    let TransportLink {
        mut outbound,
        events,
        mut shutdown,
    } = link;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Closing websocket");
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            }
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else {
                    let _ = sink.close().await;
                    break;
                };
                let text = match protocol::realtime_input_message(&chunk) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Could not encode outbound chunk: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    let _ = events.send(ServerEvent::Error(e.to_string()));
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => forward(&events, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => forward(&events, &text),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) {
                            let _ = events.send(ServerEvent::Error(format!(
                                "closed by server: {} {}",
                                frame.code, frame.reason
                            )));
                        } else {
                            info!("Server closed the session: {}", frame.reason);
                        }
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(ServerEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(ServerEvent::Closed);
}

fn forward(events: &mpsc::UnboundedSender<ServerEvent>, text: &str) {
    match protocol::parse_server_message(text) {
        Ok(parsed) => {
            for event in parsed {
                let _ = events.send(event);
            }
        }
        Err(e) => warn!("Ignoring unreadable server message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, AudioFrame};
    use crate::credentials::StaticKey;
    use crate::transport::EventStream;
    use std::future::Future;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Accept one websocket client, check its setup message, then hand the
    /// socket to `script`.
    async fn serve_once<F, Fut>(script: F) -> (LiveConfig, JoinHandle<()>)
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            match ws.next().await {
                Some(Ok(Message::Text(text))) => assert!(text.contains("\"setup\"")),
                other => panic!("expected setup first, got {:?}", other),
            }
            script(ws).await;
        });
        let config = LiveConfig {
            endpoint: format!("ws://{}", addr),
            ..LiveConfig::default()
        };
        (config, server)
    }

    async fn connect(config: &LiveConfig) -> (TransportHandle, EventStream) {
        let connector = WsConnector::new(Box::new(StaticKey::new("test-key")));
        let mut handle = connector.connect(config).await.unwrap();
        let events = handle.events().unwrap();
        (handle, events)
    }

    async fn next_event(events: &mut EventStream) -> Option<ServerEvent> {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no event from the driver")
    }

    #[tokio::test]
    async fn setup_complete_opens_the_session() {
        let (config, server) = serve_once(|mut ws| async move {
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (mut handle, mut events) = connect(&config).await;
        assert!(matches!(next_event(&mut events).await, Some(ServerEvent::Opened)));

        handle.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn abnormal_close_reports_an_error_then_closed() {
        let (config, server) = serve_once(|mut ws| async move {
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "boom".into(),
            })))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (_handle, mut events) = connect(&config).await;
        match next_event(&mut events).await {
            Some(ServerEvent::Error(message)) => assert!(message.contains("boom"), "{}", message),
            other => panic!("expected an error, got {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, Some(ServerEvent::Closed)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn outbound_chunks_arrive_as_realtime_input() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let (config, server) = serve_once(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = seen_tx.send(text);
            }
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (mut handle, _events) = connect(&config).await;
        handle
            .send(codec::encode(AudioFrame {
                samples: vec![0.0; 160],
                sample_rate: 16000,
                channels: 1,
                sequence: 0,
            }))
            .unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("realtimeInput"), "{}", text);
        assert!(text.contains("audio/pcm;rate=16000"), "{}", text);

        handle.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_sends_a_close_frame() {
        let (closed_tx, closed_rx) = oneshot::channel();
        let (config, server) = serve_once(|mut ws| async move {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        let _ = closed_tx.send(frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        })
        .await;

        let (mut handle, _events) = connect(&config).await;
        handle.close().await;
        assert!(handle.is_closed());

        let frame = tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("server never saw a close frame")
            .expect("server ended without a close frame");
        assert!(frame.is_none());
        server.await.unwrap();
    }
}
