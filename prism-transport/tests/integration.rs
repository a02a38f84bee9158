//! Integration tests for the streaming connector.
//!
//! These tests start a scripted render server on a local port and connect
//! a real `WsConnector`, covering handshake, execution, image streams and
//! connection loss.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

use prism_core::error::CONNECTION_ERROR;
use prism_core::{Binary, CancelMode, Command, CommandError, Image, ImageSink, Response, State, Value, ValueMap};
use prism_transport::protocol::{
    decode_client_frame, encode_ack, ClientFrame, ClientGreeting, CommandRequest, CommandResponse,
    ServerGreeting,
};
use prism_transport::{
    ByteOrder, ClientConfig, CommandQueue, ImageFrame, StreamStatus, TransportError, Viewer,
    ViewerConfig, WsConnector,
};

const ORDER: ByteOrder = ByteOrder::Little;
const NONCE: [u8; 16] = *b"0123456789abcdef";

struct FakeServer {
    port: u16,
    acks: mpsc::UnboundedReceiver<u32>,
    requests: mpsc::UnboundedReceiver<CommandRequest>,
}

fn respond(command: &Command) -> Response {
    match command.name() {
        "echo" => Ok(command.params().get("value").cloned().unwrap_or(Value::Null)),
        "fail" => Err(CommandError::new(-5, "requested failure")),
        "render_loop_pick" => Ok(Value::from(vec![Value::map()
            .with("picked_object_name", "teapot")
            .with("world_point", Value::map().with("x", 1.0).with("y", 0.0).with("z", 2.0))])),
        _ => Ok(Value::Null),
    }
}

fn image_frame(image_id: u32, sequence_id: u64) -> Vec<u8> {
    let mut statistics = ValueMap::new();
    statistics.insert("fps".into(), Value::F64(30.0));
    if sequence_id > 0 {
        statistics.insert("sequence_id".into(), Value::from(sequence_id));
    }
    ImageFrame {
        image_id,
        server_time: f64::from(image_id),
        render_loop: "main".into(),
        image: Image::Encoded(Binary::new("image/png", vec![0x89, 0x50, 0x4E, 0x47])),
        statistics,
    }
    .encode(ORDER)
    .unwrap()
}

/// Start a render server that speaks `version`, return its handles.
///
/// Commands named `push_frame` make the server push one frame of loop
/// `main` after answering; `drop_connection` closes the socket unanswered.
async fn start_fake_server(version: u32) -> FakeServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (ack_tx, acks) = mpsc::unbounded_channel();
    let (request_tx, requests) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let greeting = ServerGreeting {
            order: ORDER,
            version,
            server_time: 0.5,
            nonce: NONCE,
        };
        ws.send(Message::Binary(greeting.encode().into())).await.unwrap();

        let Some(Ok(Message::Binary(reply))) = ws.next().await else {
            return;
        };
        let client = ClientGreeting::parse(&reply, ORDER).unwrap();
        assert_eq!(client.nonce, NONCE);
        ws.send(Message::Binary(encode_ack(ORDER, client.version).into()))
            .await
            .unwrap();

        let mut image_id = 0;
        let mut last_sequence = 0;
        while let Some(Ok(message)) = ws.next().await {
            let Message::Binary(data) = message else {
                continue;
            };
            match decode_client_frame(&data, ORDER).unwrap() {
                ClientFrame::ImageAck { image_id, .. } => {
                    let _ = ack_tx.send(image_id);
                }
                ClientFrame::TimeResponse { .. } => {}
                ClientFrame::Command(request) => {
                    if request.commands.iter().any(|c| c.name() == "drop_connection") {
                        let _ = ws.close(None).await;
                        return;
                    }
                    if let Some(seq) = request.render_loop.as_ref().and_then(|r| r.sequence_id) {
                        last_sequence = seq;
                    }
                    if let Some(id) = request.id {
                        let results = request.commands.iter().map(respond).collect();
                        let response = CommandResponse { id, results }.encode(ORDER).unwrap();
                        ws.send(Message::Binary(response.into())).await.unwrap();
                    }
                    let pushes = request
                        .commands
                        .iter()
                        .filter(|c| c.name() == "push_frame")
                        .count();
                    for _ in 0..pushes {
                        image_id += 1;
                        let frame = image_frame(image_id, last_sequence);
                        ws.send(Message::Binary(frame.into())).await.unwrap();
                    }
                    let _ = request_tx.send(request);
                }
            }
        }
    });

    FakeServer {
        port,
        acks,
        requests,
    }
}

async fn connect(server: &FakeServer) -> Result<WsConnector, TransportError> {
    let config = ClientConfig {
        ws_url: format!("ws://127.0.0.1:{}", server.port),
        handshake_timeout_ms: 2000,
        ..ClientConfig::default()
    };
    WsConnector::connect(&config).await
}

fn counting_sink(count: &Arc<AtomicU32>) -> Arc<dyn ImageSink> {
    let count = count.clone();
    Arc::new(move |_: &Image| {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

/// Poll `cond` until it holds or two seconds pass.
async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_handshake_and_execute() {
    let server = start_fake_server(2).await;
    let connector = connect(&server).await.unwrap();
    assert_eq!(connector.negotiated().unwrap().version, 2);
    assert!(connector.is_connected());

    let results = connector
        .execute(
            &[Command::new("echo").param("value", "hi"), Command::new("fail")],
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], Ok(Value::from("hi")));
    assert_eq!(results[1].as_ref().unwrap_err().code, -5);
}

#[tokio::test]
async fn test_version_one_is_echoed() {
    let server = start_fake_server(1).await;
    let connector = connect(&server).await.unwrap();
    assert_eq!(connector.negotiated().unwrap().version, 1);
}

#[tokio::test]
async fn test_unsupported_version_rejected() {
    let server = start_fake_server(3).await;
    match connect(&server).await {
        Err(TransportError::Protocol(_)) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_frames_acked_and_displayed() {
    let mut server = start_fake_server(2).await;
    let connector = connect(&server).await.unwrap();
    let shown = Arc::new(AtomicU32::new(0));
    connector
        .start_stream("main", counting_sink(&shown), None)
        .await
        .unwrap();

    connector
        .execute(&[Command::new("push_frame"), Command::new("push_frame")], None)
        .await
        .unwrap();

    for expected in 1..=2 {
        let ack = timeout(Duration::from_secs(2), server.acks.recv()).await.unwrap();
        assert_eq!(ack, Some(expected));
    }
    assert!(eventually(|| shown.load(Ordering::SeqCst) == 2).await);
    let arrival = connector.arrivals().borrow().clone();
    assert_eq!(arrival.count, 2);
    assert_eq!(arrival.render_loop, "main");
    assert_eq!(arrival.statistics.get("fps"), Some(&Value::F64(30.0)));
}

#[tokio::test]
async fn test_paused_display_still_fires_rendered() {
    let mut server = start_fake_server(2).await;
    let connector = connect(&server).await.unwrap();
    let shown = Arc::new(AtomicU32::new(0));
    connector
        .start_stream("main", counting_sink(&shown), None)
        .await
        .unwrap();
    assert_eq!(connector.pause_display("main").unwrap(), 1);

    let state = State::render_loop("main", CancelMode::Cooperative, false);
    let (tx, rx) = oneshot::channel();
    let pending = connector
        .execute_rendered(
            &[Command::new("edit"), Command::new("push_frame")],
            &state,
            Box::new(move |frame: &ImageFrame| {
                let _ = tx.send((frame.image_id, frame.sequence_id()));
            }),
        )
        .await
        .unwrap();
    assert_eq!(pending.sequence_id(), Some(1));
    pending.results().await.unwrap();

    let fired = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(fired, (1, Some(1)));
    assert_eq!(timeout(Duration::from_secs(2), server.acks.recv()).await.unwrap(), Some(1));
    assert_eq!(shown.load(Ordering::SeqCst), 0);

    let start = server.requests.recv().await.unwrap();
    assert_eq!(start.commands[0].name(), "render_loop_start_stream");
    let request = server.requests.recv().await.unwrap();
    let routing = request.render_loop.unwrap();
    assert_eq!(routing.name, "main");
    assert_eq!(routing.sequence_id, Some(1));

    assert_eq!(connector.resume_display("main", false).unwrap(), 0);
    connector.execute(&[Command::new("push_frame")], None).await.unwrap();
    assert!(eventually(|| shown.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_close_fails_outstanding_requests() {
    let server = start_fake_server(2).await;
    let connector = connect(&server).await.unwrap();
    let mut status = connector.status();
    assert_eq!(*status.borrow(), StreamStatus::Connected);

    let outcome = connector
        .execute(&[Command::new("drop_connection")], None)
        .await;
    match outcome {
        Err(TransportError::Command(error)) => assert_eq!(error.code, CONNECTION_ERROR),
        other => panic!("expected connection error, got {other:?}"),
    }

    let closed = timeout(
        Duration::from_secs(2),
        status.wait_for(|s| matches!(s, StreamStatus::Closed { .. })),
    )
    .await
    .unwrap();
    assert!(closed.is_ok());
    drop(closed);
    assert!(!connector.is_connected());
    assert!(matches!(
        connector.execute(&[Command::new("echo")], None).await,
        Err(TransportError::NotStarted)
    ));
}

#[tokio::test]
async fn test_viewer_start_and_pick() {
    let mut server = start_fake_server(2).await;
    let connector = connect(&server).await.unwrap();
    let viewer = Viewer::new(
        connector,
        ViewerConfig {
            render_loop_name: "main".into(),
            camera_name: "cam".into(),
        },
    );
    let shown = Arc::new(AtomicU32::new(0));
    viewer.start(counting_sink(&shown), 800, 400).await.unwrap();

    let setup = server.requests.recv().await.unwrap();
    let names: Vec<&str> = setup.commands.iter().map(Command::name).collect();
    assert_eq!(names, ["camera_set_resolution", "camera_set_aspect"]);
    assert_eq!(setup.commands[1].params().get("aspect"), Some(&Value::F64(2.0)));
    assert_eq!(setup.render_loop.unwrap().name, "main");
    let start = server.requests.recv().await.unwrap();
    assert_eq!(start.commands[0].name(), "render_loop_start_stream");

    let pick = viewer.pick(10.0, 20.0).await.unwrap().unwrap();
    assert_eq!(pick.object_name, "teapot");
    assert_eq!(pick.world_point, Some([1.0, 0.0, 2.0]));
    // pick left display unpaused
    assert_eq!(viewer.pause_display().unwrap(), 1);
    assert_eq!(viewer.resume_display(true).unwrap(), 0);
}

#[tokio::test]
async fn test_command_queue_over_websocket() {
    let server = start_fake_server(2).await;
    let connector = connect(&server).await.unwrap();
    let queue = CommandQueue::spawn(connector, State::session().into_ref());

    let first = queue.call(Command::new("echo").param("value", 1), None).await;
    let second = queue.call(Command::new("fail"), None).await;
    assert_eq!(first, Ok(Value::from(1)));
    assert_eq!(second.unwrap_err().code, -5);
    queue.shutdown().await;
}
