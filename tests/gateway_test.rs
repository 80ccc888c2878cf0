//! End-to-end tests for the gateway over loopback TCP
//!
//! Every test starts a real [`Server`] from YAML on an ephemeral port and,
//! where a login should succeed, a scripted fake Postgres server behind it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

use pggateway::config::load_config_from_str;
use pggateway::crypto::{
    compute_md5_password, md5_user_password, ScramClient, ScramConversation, ScramServer,
    ScramStep, StoredCredentials,
};
use pggateway::protocol::{
    parse_authentication, parse_error_response, parse_sasl_initial_response, read_message,
    read_startup_message, write_message, write_startup_message, AuthenticationRequest, Message,
    PasswordMessage, SaslInitialResponse, StartupMessage, StartupMessageType, MSG_AUTH_REQUEST,
    MSG_COMMAND_COMPLETE, MSG_DATA_ROW, MSG_ERROR_RESPONSE, MSG_PASSWORD, MSG_QUERY,
    MSG_READY_FOR_QUERY, MSG_TERMINATE, SASL_MECHANISM_SCRAM_SHA_256,
};
use pggateway::server::local_addrs;
use pggateway::Server;

/// Default test timeout
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const UPSTREAM_USER: &str = "app_owner";
const UPSTREAM_PASSWORD: &str = "owner-pw";

/// Start a gateway and return its address.
async fn start_gateway(yaml: &str) -> (SocketAddr, Arc<Server>) {
    let config = load_config_from_str(yaml).expect("config");
    let server = Arc::new(Server::new(&config).expect("server"));
    let listeners = server.bind().await.expect("bind");
    let addr = local_addrs(&listeners)[0];

    let running = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = running.serve(listeners).await;
    });
    (addr, server)
}

fn virtual_user_yaml(upstream_port: u16) -> String {
    let carol = StoredCredentials::derive("carol-pw", b"carol-salt", 4096);
    format!(
        r#"
listeners:
  "127.0.0.1:0":
    authentication:
      virtualuser-authentication:
        - name: app
          target:
            host: 127.0.0.1
            port: {port}
            user: {user}
            password: {password}
            databases: [app]
          users:
            bob: "{bob}"
            carol: "{carol}"
            dave: dave-pw
"#,
        port = upstream_port,
        user = UPSTREAM_USER,
        password = UPSTREAM_PASSWORD,
        bob = md5_user_password("bob", "bob-pw"),
        carol = carol,
    )
}

fn ready_for_query() -> Message {
    Message::new(MSG_READY_FOR_QUERY, vec![b'I'])
}

fn data_row(i: u32) -> Message {
    let value = i.to_string();
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_be_bytes());
    payload.extend_from_slice(value.as_bytes());
    Message::new(MSG_DATA_ROW, payload)
}

async fn expect_auth(stream: &mut TcpStream) -> AuthenticationRequest {
    let msg = read_message(stream).await.expect("auth message");
    assert_eq!(msg.tag, MSG_AUTH_REQUEST, "expected auth request, got {:?}", msg);
    parse_authentication(&msg.payload).expect("parse auth")
}

async fn expect_fatal(stream: &mut TcpStream) -> String {
    let msg = read_message(stream).await.expect("error message");
    assert_eq!(msg.tag, MSG_ERROR_RESPONSE, "expected error, got {:?}", msg);
    let error = parse_error_response(&msg.payload).expect("parse error");
    assert_eq!(error.severity(), Some("FATAL"));
    error.message().unwrap_or_default().to_string()
}

/// Fake upstream: accepts one connection and runs MD5 login for
/// `app_owner`, then hands the stream back.
async fn upstream_md5_login(listener: &TcpListener) -> (TcpStream, StartupMessage) {
    let (mut stream, _) = listener.accept().await.expect("upstream accept");
    let StartupMessageType::Startup(startup) =
        read_startup_message(&mut stream).await.expect("startup")
    else {
        panic!("expected a plain startup message");
    };
    assert_eq!(startup.user(), Some(UPSTREAM_USER));

    let salt = [9, 8, 7, 6];
    write_message(
        &mut stream,
        &AuthenticationRequest::Md5Password { salt }.to_message(),
    )
    .await
    .unwrap();

    let reply = read_message(&mut stream).await.expect("password");
    assert_eq!(reply.tag, MSG_PASSWORD);
    let expected = compute_md5_password(UPSTREAM_USER, UPSTREAM_PASSWORD, &salt);
    assert_eq!(PasswordMessage::from_bytes(reply.payload).password(), expected.as_bytes());

    write_message(&mut stream, &AuthenticationRequest::Ok.to_message())
        .await
        .unwrap();
    (stream, startup)
}

/// Client side of an MD5 login as `user`.
async fn client_md5_login(addr: SocketAddr, user: &str, password: &str) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.expect("connect");
    write_startup_message(&mut client, &StartupMessage::with_database(user, "app"))
        .await
        .unwrap();

    let AuthenticationRequest::Md5Password { salt } = expect_auth(&mut client).await else {
        panic!("expected MD5 challenge");
    };
    let response = compute_md5_password(user, password, &salt);
    write_message(&mut client, &PasswordMessage::from_password(&response).to_message())
        .await
        .unwrap();
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ssl_required_rejects_plain_client() {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("server.crt");
    let key_path = dir.path().join("server.key");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let yaml = format!(
        r#"
listeners:
  "127.0.0.1:0":
    ssl:
      enabled: true
      required: true
      certificate: {}
      key: {}
    authentication:
      passthrough: {{ host: 127.0.0.1, port: {} }}
"#,
        cert_path.display(),
        key_path.display(),
        upstream.local_addr().unwrap().port()
    );
    let (addr, _server) = start_gateway(&yaml).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(addr).await.unwrap();
        write_startup_message(&mut client, &StartupMessage::with_database("alice", "app"))
            .await
            .unwrap();

        let message = expect_fatal(&mut client).await;
        assert_eq!(message, "server does not support SSL, but SSL was required");

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    })
    .await
    .expect("test timed out");

    // No upstream dial happened
    assert!(timeout(Duration::from_millis(200), upstream.accept())
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_virtual_user_md5_login_and_relay() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _server) =
        start_gateway(&virtual_user_yaml(upstream.local_addr().unwrap().port())).await;

    let query = Message::new(MSG_QUERY, b"SELECT 1\0".to_vec());
    let expected_query = query.encode();

    let upstream_task = tokio::spawn(async move {
        let (mut stream, startup) = upstream_md5_login(&upstream).await;
        // Every other startup option is copied from the client
        assert_eq!(startup.database(), Some("app"));
        write_message(&mut stream, &ready_for_query()).await.unwrap();

        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut body = vec![0u8; len - 4];
        stream.read_exact(&mut body).await.unwrap();
        let mut raw = header.to_vec();
        raw.extend(body);

        write_message(
            &mut stream,
            &Message::new(MSG_COMMAND_COMPLETE, b"SELECT 1\0".to_vec()),
        )
        .await
        .unwrap();
        write_message(&mut stream, &ready_for_query()).await.unwrap();
        raw
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = client_md5_login(addr, "bob", "bob-pw").await;
        assert_eq!(expect_auth(&mut client).await, AuthenticationRequest::Ok);
        assert_eq!(read_message(&mut client).await.unwrap(), ready_for_query());

        write_message(&mut client, &query).await.unwrap();
        let relayed = upstream_task.await.unwrap();
        assert_eq!(relayed, expected_query);

        let complete = read_message(&mut client).await.unwrap();
        assert_eq!(complete.tag, MSG_COMMAND_COMPLETE);
        assert_eq!(read_message(&mut client).await.unwrap(), ready_for_query());

        write_message(&mut client, &Message::new(MSG_TERMINATE, Vec::new()))
            .await
            .unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_output_batched_until_ready_for_query() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _server) =
        start_gateway(&virtual_user_yaml(upstream.local_addr().unwrap().port())).await;

    let (release_tx, release_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = upstream_md5_login(&upstream).await;
        write_message(&mut stream, &ready_for_query()).await.unwrap();

        let query = read_message(&mut stream).await.unwrap();
        assert_eq!(query.tag, MSG_QUERY);
        for i in 0..20 {
            write_message(&mut stream, &data_row(i)).await.unwrap();
        }
        // Hold back ReadyForQuery until the client has looked
        let _ = release_rx.await;
        write_message(&mut stream, &ready_for_query()).await.unwrap();
        let _ = read_message(&mut stream).await;
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = client_md5_login(addr, "bob", "bob-pw").await;
        assert_eq!(expect_auth(&mut client).await, AuthenticationRequest::Ok);
        assert_eq!(read_message(&mut client).await.unwrap(), ready_for_query());

        write_message(&mut client, &Message::new(MSG_QUERY, b"SELECT i\0".to_vec()))
            .await
            .unwrap();

        // The first fifteen rows arrive as soon as the batch is full
        for i in 0..15 {
            assert_eq!(read_message(&mut client).await.unwrap(), data_row(i));
        }
        // The last five wait for a flush point
        assert!(
            timeout(Duration::from_millis(300), read_message(&mut client))
                .await
                .is_err(),
            "rows beyond the first batch were flushed early"
        );

        release_tx.send(()).unwrap();
        for i in 15..20 {
            assert_eq!(read_message(&mut client).await.unwrap(), data_row(i));
        }
        assert_eq!(read_message(&mut client).await.unwrap(), ready_for_query());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_virtual_user_wrong_password() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _server) =
        start_gateway(&virtual_user_yaml(upstream.local_addr().unwrap().port())).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = client_md5_login(addr, "bob", "guess").await;
        assert_eq!(expect_fatal(&mut client).await, "failed to authenticate");
    })
    .await
    .expect("test timed out");

    assert!(timeout(Duration::from_millis(200), upstream.accept())
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_database_not_allowed() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _server) =
        start_gateway(&virtual_user_yaml(upstream.local_addr().unwrap().port())).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(addr).await.unwrap();
        write_startup_message(&mut client, &StartupMessage::with_database("dave", "billing"))
            .await
            .unwrap();
        assert_eq!(
            expect_fatal(&mut client).await,
            "database \"billing\" is not allowed"
        );
    })
    .await
    .expect("test timed out");

    assert!(timeout(Duration::from_millis(200), upstream.accept())
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_virtual_user_scram_on_both_legs() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _server) =
        start_gateway(&virtual_user_yaml(upstream.local_addr().unwrap().port())).await;

    // Upstream plays the SCRAM server for app_owner
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let _startup = read_startup_message(&mut stream).await.unwrap();

        let advertise = AuthenticationRequest::Sasl {
            mechanisms: vec![
                "SCRAM-SHA-256-PLUS".to_string(),
                SASL_MECHANISM_SCRAM_SHA_256.to_string(),
            ],
        };
        write_message(&mut stream, &advertise.to_message()).await.unwrap();

        let initial = read_message(&mut stream).await.unwrap();
        let initial = parse_sasl_initial_response(&initial.payload).unwrap();
        assert_eq!(initial.mechanism, SASL_MECHANISM_SCRAM_SHA_256);

        let stored = StoredCredentials::derive(UPSTREAM_PASSWORD, b"owner-salt", 4096);
        let mut server = ScramServer::new(move |_: &str| Ok(stored.clone()));
        let ScramStep::Continue(first) = server.step(&initial.data).unwrap() else {
            panic!("expected server-first");
        };
        write_message(
            &mut stream,
            &AuthenticationRequest::SaslContinue { data: first }.to_message(),
        )
        .await
        .unwrap();

        let last = read_message(&mut stream).await.unwrap();
        let ScramStep::Done(outcome) = server.step(&last.payload).unwrap() else {
            panic!("expected server-final");
        };
        server.verify().unwrap();
        write_message(
            &mut stream,
            &AuthenticationRequest::SaslFinal { data: outcome }.to_message(),
        )
        .await
        .unwrap();
        write_message(&mut stream, &AuthenticationRequest::Ok.to_message())
            .await
            .unwrap();
        write_message(&mut stream, &ready_for_query()).await.unwrap();
        let _ = read_message(&mut stream).await;
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(addr).await.unwrap();
        write_startup_message(&mut client, &StartupMessage::with_database("carol", "app"))
            .await
            .unwrap();

        let AuthenticationRequest::Sasl { mechanisms } = expect_auth(&mut client).await else {
            panic!("expected SASL");
        };
        assert_eq!(mechanisms, vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()]);

        let mut scram = ScramClient::new("", "carol-pw");
        let ScramStep::Continue(first) = scram.step(&[]).unwrap() else {
            panic!("expected client-first");
        };
        let initial = SaslInitialResponse {
            mechanism: SASL_MECHANISM_SCRAM_SHA_256.to_string(),
            data: first,
        };
        write_message(&mut client, &initial.to_message()).await.unwrap();

        let AuthenticationRequest::SaslContinue { data } = expect_auth(&mut client).await else {
            panic!("expected SASL continue");
        };
        let ScramStep::Continue(last) = scram.step(&data).unwrap() else {
            panic!("expected client-final");
        };
        write_message(&mut client, &PasswordMessage::from_bytes(last).to_message())
            .await
            .unwrap();

        let AuthenticationRequest::SaslFinal { data } = expect_auth(&mut client).await else {
            panic!("expected SASL final");
        };
        scram.step(&data).unwrap();
        scram.verify().unwrap();

        assert_eq!(expect_auth(&mut client).await, AuthenticationRequest::Ok);
        assert_eq!(read_message(&mut client).await.unwrap(), ready_for_query());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_passthrough_relays_upstream_login() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let yaml = format!(
        r#"
listeners:
  "127.0.0.1:0":
    authentication:
      passthrough: {{ host: 127.0.0.1, port: {} }}
"#,
        upstream.local_addr().unwrap().port()
    );
    let (addr, _server) = start_gateway(&yaml).await;

    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let StartupMessageType::Startup(startup) = read_startup_message(&mut stream).await.unwrap()
        else {
            panic!("expected startup");
        };
        // Forwarded untouched
        assert_eq!(startup.user(), Some("erin"));
        assert_eq!(startup.get("application_name"), Some("tests"));

        write_message(
            &mut stream,
            &AuthenticationRequest::CleartextPassword.to_message(),
        )
        .await
        .unwrap();
        let reply = read_message(&mut stream).await.unwrap();
        assert_eq!(PasswordMessage::from_bytes(reply.payload).password(), b"erin-pw");
        write_message(&mut stream, &AuthenticationRequest::Ok.to_message())
            .await
            .unwrap();
        write_message(&mut stream, &ready_for_query()).await.unwrap();
        let _ = read_message(&mut stream).await;
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut startup = StartupMessage::with_database("erin", "app");
        startup.set("application_name", "tests");
        write_startup_message(&mut client, &startup).await.unwrap();

        assert_eq!(
            expect_auth(&mut client).await,
            AuthenticationRequest::CleartextPassword
        );
        write_message(&mut client, &PasswordMessage::from_password("erin-pw").to_message())
            .await
            .unwrap();
        assert_eq!(expect_auth(&mut client).await, AuthenticationRequest::Ok);
        assert_eq!(read_message(&mut client).await.unwrap(), ready_for_query());
    })
    .await
    .expect("test timed out");
}
