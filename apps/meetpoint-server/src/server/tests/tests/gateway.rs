use super::*;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve_app(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("server should run");
    });
    addr
}

async fn connect_gateway(addr: std::net::SocketAddr, token: &str) -> WsStream {
    let url = format!("ws://{addr}/api/gateway/ws?token={token}");
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket handshake should succeed");
    socket
}

/// Next text frame, skipping pings.
async fn next_envelope(socket: &mut WsStream) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame should arrive in time")
            .expect("stream should stay open")
            .expect("frame should decode");
        match frame {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn connecting_replays_the_handshake_and_recent_notifications() {
    let app = test_app();
    let addr = serve_app(app.clone()).await;
    let alice = register_and_login_as(&app, "alice.gw@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.gw@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    // A pending friend request seeds Bob's replay backlog.
    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&alice.token),
        Some(json!({"recipient_user_id": bob_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut socket = connect_gateway(addr, &bob.token).await;

    let connected = next_envelope(&mut socket).await;
    assert_eq!(connected["v"], 1);
    assert_eq!(connected["t"], "connected");

    let replay = next_envelope(&mut socket).await;
    assert_eq!(replay["v"], 1);
    assert_eq!(replay["t"], "notifications");
    let backlog = replay["d"]["notifications"].as_array().unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0]["kind"], "friend_request");
}

#[tokio::test]
async fn live_events_are_pushed_to_the_connected_user() {
    let app = test_app();
    let addr = serve_app(app.clone()).await;
    let alice = register_and_login_as(&app, "alice.gp@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.gp@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let mut socket = connect_gateway(addr, &bob.token).await;
    assert_eq!(next_envelope(&mut socket).await["t"], "connected");
    assert_eq!(next_envelope(&mut socket).await["t"], "notifications");

    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&alice.token),
        Some(json!({"recipient_user_id": bob_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // The request lands as both a friend_update and a persisted notification.
    let mut seen = Vec::new();
    for _ in 0..2 {
        let envelope = next_envelope(&mut socket).await;
        seen.push(envelope["t"].as_str().unwrap().to_owned());
    }
    assert!(seen.contains(&String::from("friend_update")));
    assert!(seen.contains(&String::from("notification")));
}

#[tokio::test]
async fn the_newest_connection_supersedes_the_previous_one() {
    let app = test_app();
    let addr = serve_app(app.clone()).await;
    let bob = register_and_login_as(&app, "bob.gl@example.com", "Bob").await;

    let mut first = connect_gateway(addr, &bob.token).await;
    assert_eq!(next_envelope(&mut first).await["t"], "connected");
    assert_eq!(next_envelope(&mut first).await["t"], "notifications");

    let mut second = connect_gateway(addr, &bob.token).await;
    assert_eq!(next_envelope(&mut second).await["t"], "connected");

    // The first socket is closed once the second one takes the slot.
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), first.next())
            .await
            .expect("close should arrive in time");
        match frame {
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }
}

#[tokio::test]
async fn client_frames_must_be_well_formed_envelopes() {
    let app = test_app();
    let addr = serve_app(app.clone()).await;
    let alice = register_and_login_as(&app, "alice.gf@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.gf@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let mut socket = connect_gateway(addr, &bob.token).await;
    assert_eq!(next_envelope(&mut socket).await["t"], "connected");
    assert_eq!(next_envelope(&mut socket).await["t"], "notifications");

    // A valid envelope is tolerated; pushes keep arriving afterwards.
    socket
        .send(WsMessage::Text(
            r#"{"v":1,"t":"client_hello","d":{}}"#.into(),
        ))
        .await
        .unwrap();
    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&alice.token),
        Some(json!({"recipient_user_id": bob_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let pushed = next_envelope(&mut socket).await;
    assert!(pushed["t"] == "friend_update" || pushed["t"] == "notification");

    // Garbage terminates the connection.
    socket
        .send(WsMessage::Text("not an envelope".into()))
        .await
        .unwrap();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("close should arrive in time");
        match frame {
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn the_gateway_rejects_missing_and_invalid_tokens() {
    let app = test_app();
    let addr = serve_app(app).await;

    for url in [
        format!("ws://{addr}/api/gateway/ws"),
        format!("ws://{addr}/api/gateway/ws?token=not-a-session"),
    ] {
        let result = tokio_tungstenite::connect_async(url).await;
        assert!(result.is_err());
    }
}
