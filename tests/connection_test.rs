//! Connection tests against a scripted in-memory peer.
//!
//! Each test wires a [`Connection`] to one end of a duplex pipe and plays the
//! server side by hand, so every frame the driver emits is asserted exactly.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use reql_driver::{
    ConnectOptions, Connection, Datum, Error, FormatOptions, RunOptions, RunResult, Term,
    TimeFormat,
};

fn connected(opts: ConnectOptions) -> (Connection, DuplexStream) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (client, server) = tokio::io::duplex(1 << 16);
    (Connection::from_stream(client, opts), server)
}

async fn read_request(server: &mut DuplexStream) -> (u32, Value) {
    let token = server.read_u32_le().await.unwrap();
    assert_eq!(server.read_u32_le().await.unwrap(), 0, "token high word");
    let len = server.read_u32_le().await.unwrap();
    let mut payload = vec![0u8; len as usize];
    server.read_exact(&mut payload).await.unwrap();
    (token, serde_json::from_slice(&payload).unwrap())
}

async fn send_frame(server: &mut DuplexStream, token: u32, payload: &[u8]) {
    server.write_u32_le(token).await.unwrap();
    server.write_u32_le(0).await.unwrap();
    server.write_u32_le(payload.len() as u32).await.unwrap();
    server.write_all(payload).await.unwrap();
}

async fn send_response(server: &mut DuplexStream, token: u32, body: Value) {
    send_frame(server, token, body.to_string().as_bytes()).await;
}

#[tokio::test]
async fn atom_result() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, request) = read_request(&mut server).await;
        assert_eq!(token, 1);
        assert_eq!(request, json!([1, [79, []]]));
        send_response(&mut server, token, json!({"t": 1, "r": [["test", "prod"]]})).await;
        server
    });

    let outcome = conn
        .run(Term::db_list(), RunOptions::default())
        .await
        .unwrap();
    match outcome.result {
        RunResult::Atom(Datum::Array(dbs)) => assert_eq!(dbs.len(), 2),
        _ => panic!("expected an atom array"),
    }
    assert!(outcome.profile.is_none());
    assert!(conn.is_open());
    peer.await.unwrap();
}

#[tokio::test]
async fn partial_stream_continues_until_sequence() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, _) = read_request(&mut server).await;
        send_response(&mut server, token, json!({"t": 3, "r": [1, 2, 3], "n": []})).await;

        let (token2, request) = read_request(&mut server).await;
        assert_eq!(token2, token);
        assert_eq!(request, json!([2]));
        send_response(&mut server, token, json!({"t": 2, "r": [4, 5]})).await;
        server
    });

    let outcome = conn
        .run(Term::table("users"), RunOptions::default())
        .await
        .unwrap();
    let RunResult::Cursor(mut cursor) = outcome.result else {
        panic!("expected a cursor");
    };
    assert!(!cursor.is_feed());

    let mut seen = Vec::new();
    while let Some(item) = cursor.next().await.unwrap() {
        seen.push(item.as_number().unwrap());
    }
    assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(cursor.next().await.unwrap(), None);
    drop(cursor);

    assert!(!conn.is_active(1));
    peer.await.unwrap();
}

#[tokio::test]
async fn complete_sequence_needs_no_continue() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, _) = read_request(&mut server).await;
        assert_eq!(token, 1);
        send_response(&mut server, token, json!({"t": 2, "r": ["a", "b"]})).await;
        // Dropping the peer here proves no further I/O happens.
    });

    let outcome = conn
        .run(Term::table_list(), RunOptions::default())
        .await
        .unwrap();
    peer.await.unwrap();
    let RunResult::Cursor(cursor) = outcome.result else {
        panic!("expected a cursor");
    };
    // The peer is gone; a complete sequence must drain without further I/O.
    let items = cursor.to_vec().await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(!conn.is_active(1));
}

#[tokio::test]
async fn stop_discards_open_stream() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, _) = read_request(&mut server).await;
        send_response(&mut server, token, json!({"t": 3, "r": [1]})).await;

        let (token2, request) = read_request(&mut server).await;
        assert_eq!(token2, token);
        assert_eq!(request, json!([3]));
        // The acknowledgement payload is not inspected.
        send_frame(&mut server, token, b"whatever").await;
        server
    });

    let outcome = conn
        .run(Term::table("users"), RunOptions::default())
        .await
        .unwrap();
    let RunResult::Cursor(mut cursor) = outcome.result else {
        panic!("expected a cursor");
    };
    cursor.stop().await.unwrap();
    cursor.stop().await.unwrap(); // idempotent
    assert_eq!(cursor.next().await.unwrap(), None);
    drop(cursor);

    assert!(!conn.is_active(1));
    assert!(conn.is_open());
    peer.await.unwrap();
}

#[tokio::test]
async fn mismatched_token_is_an_error() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (_, _) = read_request(&mut server).await;
        send_response(&mut server, 999, json!({"t": 1, "r": [true]})).await;
        server
    });

    let err = conn
        .run(Term::db_list(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TokenMismatch { expected: 1, got: 999 }
    ));
    // The frame itself was well formed, so the connection survives.
    assert!(conn.is_open());
    peer.await.unwrap();
}

#[tokio::test]
async fn noreply_and_noreply_wait() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, request) = read_request(&mut server).await;
        assert_eq!(token, 1);
        assert_eq!(request[2]["noreply"], json!(true));

        let (token, request) = read_request(&mut server).await;
        assert_eq!(token, 2);
        assert_eq!(request, json!([4]));
        send_response(&mut server, token, json!({"t": 4, "r": []})).await;
        server
    });

    let doc = Datum::from(serde_json::json!({"id": 1}));
    let outcome = conn
        .run(
            Term::insert(Term::table("users"), vec![doc]),
            RunOptions::default().noreply(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome.result, RunResult::NoReply));

    conn.noreply_wait().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn server_info_round_trip() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, request) = read_request(&mut server).await;
        assert_eq!(request, json!([5]));
        send_response(
            &mut server,
            token,
            json!({"t": 5, "r": [{"id": "d0c-4a1b", "name": "wil", "proxy": false}]}),
        )
        .await;
        server
    });

    let info = conn.server_info().await.unwrap();
    let obj = info.as_object().unwrap();
    assert_eq!(obj["name"].as_string(), Some("wil"));
    assert_eq!(obj["proxy"].as_bool(), Some(false));
    peer.await.unwrap();
}

#[tokio::test]
async fn runtime_error_carries_backtrace_and_query() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, _) = read_request(&mut server).await;
        send_response(
            &mut server,
            token,
            json!({
                "t": 18,
                "r": ["Table `test.missing` does not exist."],
                "b": [0, "db"],
                "e": 3_100_000,
            }),
        )
        .await;
        server
    });

    let err = conn
        .run(Term::table("missing"), RunOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_server_error());
    assert_eq!(err.backtrace().unwrap().to_string(), "query[0].db");
    assert!(err.query().is_some());
    // Query errors do not take the connection down.
    assert!(conn.is_open());
    peer.await.unwrap();
}

#[tokio::test]
async fn default_db_is_attached_as_global_optarg() {
    let opts = ConnectOptions::default().with_db("app");
    let (mut conn, mut server) = connected(opts);

    let peer = tokio::spawn(async move {
        let (token, request) = read_request(&mut server).await;
        assert_eq!(request, json!([1, [82, []], {"db": [9, ["app"]]}]));
        send_response(&mut server, token, json!({"t": 1, "r": [[]]})).await;
        server
    });

    conn.run(Term::table_list(), RunOptions::default())
        .await
        .unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn profile_is_decoded_when_requested() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, request) = read_request(&mut server).await;
        assert_eq!(request[2]["profile"], json!(true));
        send_response(
            &mut server,
            token,
            json!({"t": 1, "r": [7], "p": [{"duration(ms)": 1.5}]}),
        )
        .await;
        server
    });

    let outcome = conn
        .run(Term::count(Term::table("users")), RunOptions::default().profiled())
        .await
        .unwrap();
    assert!(outcome.profile.is_some());
    peer.await.unwrap();
}

#[tokio::test]
async fn raw_time_format_is_forwarded_and_honored() {
    let formats = FormatOptions {
        time_format: TimeFormat::Raw,
        ..FormatOptions::default()
    };
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, request) = read_request(&mut server).await;
        assert_eq!(request[2]["time_format"], json!("raw"));
        send_response(
            &mut server,
            token,
            json!({"t": 1, "r": [{"$reql_type$": "TIME", "epoch_time": 0.0, "timezone": "+00:00"}]}),
        )
        .await;
        server
    });

    let outcome = conn
        .run(
            Term::get(Term::table("events"), Datum::from(1)),
            RunOptions::default().with_formats(formats),
        )
        .await
        .unwrap();
    let RunResult::Atom(datum) = outcome.result else {
        panic!("expected an atom");
    };
    assert!(datum.as_object().is_some(), "raw time stays an object");
    peer.await.unwrap();
}

#[tokio::test]
async fn read_timeout_closes_the_connection() {
    let opts = ConnectOptions::default().with_timeout(Duration::from_millis(50));
    let (mut conn, server) = connected(opts);

    // Peer stays alive but never answers.
    let err = conn
        .run(Term::db_list(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(!conn.is_open());

    let err = conn
        .run(Term::db_list(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    drop(server);
}

#[tokio::test]
async fn peer_disconnect_closes_the_connection() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let _ = read_request(&mut server).await;
        drop(server);
    });

    let err = conn
        .run(Term::db_list(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected));
    assert!(!conn.is_open());
    peer.await.unwrap();
}

#[tokio::test]
async fn changefeed_note_marks_cursor_as_feed() {
    let (mut conn, mut server) = connected(ConnectOptions::default());

    let peer = tokio::spawn(async move {
        let (token, _) = read_request(&mut server).await;
        send_response(
            &mut server,
            token,
            json!({"t": 3, "r": [{"new_val": {"id": 1}}], "n": [1]}),
        )
        .await;
        server
    });

    let outcome = conn
        .run(Term::table("users"), RunOptions::default())
        .await
        .unwrap();
    let RunResult::Cursor(mut cursor) = outcome.result else {
        panic!("expected a cursor");
    };
    assert!(cursor.is_feed());
    assert!(cursor.next().await.unwrap().is_some());
    peer.await.unwrap();
}

#[tokio::test]
async fn failed_handshake_leaves_connection_unusable() {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut magic = [0u8; 4];
        socket.read_exact(&mut magic).await.unwrap();
        // Drain the null-terminated client-first document, then reject.
        let mut byte = [0u8; 1];
        loop {
            socket.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
        }
        socket
            .write_all(br#"{"success":false,"error":"Wrong password","error_code":12}"#)
            .await
            .unwrap();
        socket.write_all(&[0]).await.unwrap();
        socket
    });

    let opts = ConnectOptions::default()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_user("admin", "wrong");
    let mut conn = Connection::new(opts);

    let err = conn.connect().await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(!conn.is_open());

    let err = conn
        .run(Term::db_list(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    peer.await.unwrap();
}

#[tokio::test]
async fn close_is_single_shot() {
    let (mut conn, _server) = connected(ConnectOptions::default());

    conn.close(false).await.unwrap();
    assert!(!conn.is_open());
    assert!(matches!(conn.close(false).await, Err(Error::NotConnected)));
}
