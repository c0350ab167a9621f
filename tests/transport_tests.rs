//! WebSocket transport against a local agent stand-in

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use ordervoice::recorder::Utterance;
use ordervoice::transport::{
    EventSink, Transport, TransportConfig, TransportEvent, TransportSession,
};
use ordervoice::VoiceError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn event_sink() -> (EventSink, Receiver<TransportEvent>) {
    let (tx, rx) = unbounded();
    let sink: EventSink = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

fn next_event(events: &Receiver<TransportEvent>) -> TransportEvent {
    events
        .recv_timeout(Duration::from_secs(5))
        .expect("no transport event")
}

fn session(rt: &Runtime, url: String) -> TransportSession {
    TransportSession::new(
        TransportConfig {
            url,
            connect_timeout_ms: 2_000,
        },
        rt.handle().clone(),
    )
}

/// Accept one client, forward `expect` received frames, send `replies`, close
fn spawn_agent(
    rt: &Runtime,
    expect: usize,
    replies: Vec<&'static str>,
    frames: Sender<String>,
) -> String {
    let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let addr = listener.local_addr().unwrap();

    rt.spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut received = 0;
        while received < expect {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames.send(text.to_string());
                    received += 1;
                }
                Some(Ok(_)) => {}
                _ => return,
            }
        }

        for reply in replies {
            ws.send(Message::Text(reply.to_string())).await.unwrap();
        }
        let _ = ws.close(None).await;
    });

    format!("ws://{}", addr)
}

#[test]
fn test_session_frames_and_inbound_order() {
    let rt = runtime();
    let (frames_tx, frames_rx) = unbounded();
    let url = spawn_agent(
        &rt,
        2,
        vec![
            r#"{"type":"cart_update","cart":{"items":[],"total":0.0}}"#,
            r#"{"type":"typing"}"#,
            r#"{"type":"audio","audio":"AAEC+g=="}"#,
            r#"{"type":"error","message":"agent unavailable"}"#,
        ],
        frames_tx,
    );

    let mut transport = session(&rt, url);
    let (sink, events) = event_sink();
    transport.connect(sink).unwrap();
    assert_eq!(next_event(&events), TransportEvent::ConnectionOpened);
    assert!(transport.is_open());

    transport.send_start_session().unwrap();
    transport
        .send_utterance(Utterance {
            audio_bytes: vec![1, 2, 3],
            duration_ms: 700,
        })
        .unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(
        frames_rx.recv_timeout(timeout).unwrap(),
        r#"{"type":"start_session"}"#
    );
    assert_eq!(
        frames_rx.recv_timeout(timeout).unwrap(),
        r#"{"type":"audio","audio":"AQID"}"#
    );

    // Unknown types are dropped; everything else arrives in order
    assert!(matches!(next_event(&events), TransportEvent::CartUpdate(_)));
    assert_eq!(
        next_event(&events),
        TransportEvent::AgentAudio(vec![0, 1, 2, 250])
    );
    assert_eq!(
        next_event(&events),
        TransportEvent::ServerError("agent unavailable".into())
    );
    assert!(matches!(
        next_event(&events),
        TransportEvent::Disconnected { .. }
    ));
    assert!(!transport.is_open());
}

#[test]
fn test_connect_failure_reports_disconnect() {
    let rt = runtime();
    let addr = {
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        listener.local_addr().unwrap()
    };

    let mut transport = session(&rt, format!("ws://{}", addr));
    let (sink, events) = event_sink();
    transport.connect(sink).unwrap();

    let TransportEvent::Disconnected { reason } = next_event(&events) else {
        panic!("expected Disconnected");
    };
    assert!(reason.starts_with("connection failed"), "reason: {}", reason);
    assert!(!transport.is_open());
}

#[test]
fn test_send_without_connection() {
    let rt = runtime();
    let mut transport = session(&rt, "ws://127.0.0.1:9".into());

    let result = transport.send_start_session();
    assert!(matches!(result, Err(VoiceError::TransportError(_))));
}

#[test]
fn test_close_silences_connection() {
    let rt = runtime();
    let (frames_tx, _frames_rx) = unbounded();
    let url = spawn_agent(&rt, 1, vec![r#"{"type":"error","message":"late"}"#], frames_tx);

    let mut transport = session(&rt, url);
    let (sink, events) = event_sink();
    transport.connect(sink).unwrap();
    assert_eq!(next_event(&events), TransportEvent::ConnectionOpened);

    transport.close();
    assert!(!transport.is_open());
    assert!(transport.send_start_session().is_err());
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
}
