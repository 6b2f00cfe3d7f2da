use super::*;
use crate::protocol::{LogLine, decode_envelope, encode_server_message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

async fn read_envelope(stream: &mut UnixStream) -> RequestEnvelope {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let msg_len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; msg_len];
    stream.read_exact(&mut payload).await.unwrap();
    decode_envelope(&payload).unwrap()
}

async fn write_message(stream: &mut UnixStream, msg: ServerMessage) {
    let bytes = encode_server_message(&msg).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

#[tokio::test]
async fn request_ids_monotonically_increase() {
    let tmp = tempfile::tempdir().unwrap();
    let sock = tmp.path().join("test.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let envelope = read_envelope(&mut stream).await;
            ids.push(envelope.id);
            write_message(
                &mut stream,
                ServerMessage::Response { id: envelope.id, response: Response::ok_with_message("pong") },
            )
            .await;
        }
        ids
    });

    let client = Client::connect(&sock).await.unwrap();
    for _ in 0..3 {
        client.ping().await.unwrap();
    }
    assert_eq!(server.await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn events_are_routed_to_their_request() {
    let tmp = tempfile::tempdir().unwrap();
    let sock = tmp.path().join("test.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let envelope = read_envelope(&mut stream).await;
        for i in 0..3 {
            write_message(
                &mut stream,
                ServerMessage::Event {
                    event: ServerEvent::Log {
                        request_id: envelope.id,
                        line: LogLine::plain(format!("line {}", i)),
                    },
                },
            )
            .await;
        }
        write_message(
            &mut stream,
            ServerMessage::Response { id: envelope.id, response: Response::ok_with_message("done") },
        )
        .await;
    });

    let client = Client::connect(&sock).await.unwrap();
    let (id, (mut events, response)) = client.subscribe_logs("token", "pugA").unwrap();
    assert_eq!(id, 1);

    let response = response.await.unwrap();
    assert!(matches!(response, Response::Ok { .. }));

    let mut lines = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ServerEvent::Log { line, .. } => lines.push(line.message),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(lines, vec!["line 0", "line 1", "line 2"]);
}

#[tokio::test]
async fn server_disconnect_fails_pending_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let sock = tmp.path().join("test.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_envelope(&mut stream).await;
        // Close without answering
    });

    let client = Client::connect(&sock).await.unwrap();
    let result = client.ping().await;
    assert!(matches!(result, Err(ClientError::Disconnected)));
}

#[tokio::test]
async fn connect_to_missing_socket_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let result = Client::connect(&tmp.path().join("missing.sock")).await;
    assert!(matches!(result, Err(ClientError::Connect(_))));
}

#[tokio::test]
async fn is_daemon_running_false_without_socket() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(!Client::is_daemon_running(&tmp.path().join("none.sock")).await);
}
