//! End-to-end chat sessions over real TCP connections

use std::time::Duration;

use huddle_net::protocol::{RoomList, UserList};
use huddle_net::{Client, ErrorCode, Message, Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

async fn start(config: ServerConfig) -> Server {
    Server::start(config.with_host("127.0.0.1").with_port(0))
        .await
        .unwrap()
}

async fn next(client: &mut Client) -> Option<Message> {
    tokio::time::timeout(WAIT, client.next_message())
        .await
        .expect("timed out waiting for the server")
}

/// Connect and log in, consuming the Join acknowledgment and every reply
/// up to the room list that completes a login.
async fn login(server: &Server, name: &str) -> Client {
    let mut client = Client::connect(server.addr()).await.unwrap();
    client.join(name).await.unwrap();
    loop {
        match next(&mut client).await {
            Some(Message::RoomList(_)) => return client,
            Some(_) => continue,
            None => panic!("{} was disconnected during login", name),
        }
    }
}

fn broadcast_content(msg: Option<Message>) -> String {
    match msg {
        Some(Message::Broadcast(chat)) => chat.content,
        other => panic!("expected a broadcast, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lobby_hello_and_leave() {
    let server = start(ServerConfig::default()).await;

    let mut alice = Client::connect(server.addr()).await.unwrap();
    alice.join("alice").await.unwrap();
    assert!(matches!(next(&mut alice).await, Some(Message::Join(p)) if p.sender == "alice"));
    assert_eq!(next(&mut alice).await, Some(Message::room_join("lobby")));
    assert!(matches!(next(&mut alice).await, Some(Message::RoomList(_))));

    let mut bob = login(&server, "bob").await;
    match next(&mut alice).await {
        Some(Message::Join(p)) => {
            assert_eq!(p.sender, "bob");
            assert_eq!(p.room.as_deref(), Some("lobby"));
        }
        other => panic!("expected bob's arrival, got {:?}", other),
    }

    alice.say("hello").await.unwrap();
    for client in [&mut alice, &mut bob] {
        match next(client).await {
            Some(Message::Broadcast(chat)) => {
                assert_eq!(chat.sender, "alice");
                assert_eq!(chat.receiver.as_deref(), Some("lobby"));
                assert_eq!(chat.content, "hello");
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    bob.quit().await.unwrap();
    match next(&mut alice).await {
        Some(Message::Leave(p)) => {
            assert_eq!(p.sender, "bob");
            assert_eq!(p.room.as_deref(), Some("lobby"));
        }
        other => panic!("expected bob's departure, got {:?}", other),
    }
    assert!(next(&mut bob).await.is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_private_to_unknown_user() {
    let server = start(ServerConfig::default()).await;
    let mut alice = login(&server, "alice").await;
    let mut bob = login(&server, "bob").await;
    // bob's arrival
    next(&mut alice).await;

    alice.private_message("ghost", "boo").await.unwrap();
    match next(&mut alice).await {
        Some(Message::Error(e)) => assert_eq!(e.code, ErrorCode::UserNotFound),
        other => panic!("expected UserNotFound, got {:?}", other),
    }

    // Connection is still usable and bob saw nothing
    alice.private_message("bob", "psst").await.unwrap();
    assert!(matches!(next(&mut bob).await, Some(Message::Private(c)) if c.content == "psst"));
    assert!(matches!(next(&mut alice).await, Some(Message::Private(c)) if c.content == "psst"));

    server.shutdown();
}

#[tokio::test]
async fn test_history_replayed_to_newcomer() {
    let server = start(ServerConfig::default()).await;
    let mut alice = login(&server, "alice").await;
    for text in ["first", "second"] {
        alice.say(text).await.unwrap();
        assert_eq!(broadcast_content(next(&mut alice).await), text);
    }

    let mut bob = Client::connect(server.addr()).await.unwrap();
    bob.join("bob").await.unwrap();
    assert!(matches!(next(&mut bob).await, Some(Message::Join(_))));
    assert_eq!(next(&mut bob).await, Some(Message::room_join("lobby")));
    assert_eq!(broadcast_content(next(&mut bob).await), "first");
    assert_eq!(broadcast_content(next(&mut bob).await), "second");
    match next(&mut bob).await {
        Some(Message::RoomList(RoomList { rooms })) => {
            assert_eq!(rooms.len(), 1);
            assert_eq!(rooms[0].members, 2);
        }
        other => panic!("expected the room list, got {:?}", other),
    }

    server.shutdown();
}

#[tokio::test]
async fn test_full_history_replay_fits_the_queue() {
    let mut config = ServerConfig::default().with_history_capacity(300);
    config.outbound_queue = 16;
    let server = start(config).await;

    let mut alice = login(&server, "alice").await;
    for i in 0..300 {
        alice.say(&format!("line {}", i)).await.unwrap();
        assert_eq!(broadcast_content(next(&mut alice).await), format!("line {}", i));
    }

    let mut bob = Client::connect(server.addr()).await.unwrap();
    bob.join("bob").await.unwrap();
    assert!(matches!(next(&mut bob).await, Some(Message::Join(_))));
    assert_eq!(next(&mut bob).await, Some(Message::room_join("lobby")));
    for i in 0..300 {
        assert_eq!(broadcast_content(next(&mut bob).await), format!("line {}", i));
    }
    assert!(matches!(next(&mut bob).await, Some(Message::RoomList(_))));
    assert_eq!(server.rooms().members("lobby").await, vec!["alice", "bob"]);

    server.shutdown();
}

#[tokio::test]
async fn test_leave_room_is_confirmed() {
    let server = start(ServerConfig::default()).await;
    let mut alice = login(&server, "alice").await;

    alice.leave_room("lobby").await.unwrap();
    assert_eq!(next(&mut alice).await, Some(Message::room_leave("lobby")));

    // Leaving again is a protocol violation
    alice.leave_room("lobby").await.unwrap();
    match next(&mut alice).await {
        Some(Message::Error(e)) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("expected a protocol error, got {:?}", other),
    }
    assert!(next(&mut alice).await.is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start(ServerConfig::default()).await;
    let mut alice = login(&server, "alice").await;
    let mut bob = login(&server, "bob").await;
    next(&mut alice).await;

    bob.join_room("den").await.unwrap();
    assert_eq!(next(&mut bob).await, Some(Message::room_join("den")));
    assert!(matches!(next(&mut alice).await, Some(Message::Leave(p)) if p.sender == "bob"));

    alice.say("lobby only").await.unwrap();
    assert_eq!(broadcast_content(next(&mut alice).await), "lobby only");

    bob.say("den only").await.unwrap();
    assert_eq!(broadcast_content(next(&mut bob).await), "den only");

    bob.list_users().await.unwrap();
    match next(&mut bob).await {
        Some(Message::UserList(UserList { users })) => assert_eq!(users, vec!["alice", "bob"]),
        other => panic!("expected the user list, got {:?}", other),
    }

    bob.list_rooms().await.unwrap();
    match next(&mut bob).await {
        Some(Message::RoomList(RoomList { rooms })) => {
            let summary: Vec<(String, usize)> =
                rooms.into_iter().map(|r| (r.name, r.members)).collect();
            assert_eq!(summary, vec![("den".into(), 1), ("lobby".into(), 1)]);
        }
        other => panic!("expected the room list, got {:?}", other),
    }

    server.shutdown();
}

#[tokio::test]
async fn test_duplicate_name() {
    let server = start(ServerConfig::default()).await;
    let _alice = login(&server, "alice").await;

    let mut second = Client::connect(server.addr()).await.unwrap();
    second.join("alice").await.unwrap();
    match next(&mut second).await {
        Some(Message::Error(e)) => assert_eq!(e.code, ErrorCode::NameTaken),
        other => panic!("expected NameTaken, got {:?}", other),
    }

    second.join("alice2").await.unwrap();
    assert!(matches!(next(&mut second).await, Some(Message::Join(p)) if p.sender == "alice2"));

    server.shutdown();
}

#[tokio::test]
async fn test_connection_limit() {
    let server = start(ServerConfig::default().with_max_connections(1)).await;
    let _alice = login(&server, "alice").await;

    let mut refused = Client::connect(server.addr()).await.unwrap();
    match next(&mut refused).await {
        Some(Message::Error(e)) => assert_eq!(e.code, ErrorCode::ServerFull),
        other => panic!("expected ServerFull, got {:?}", other),
    }
    assert!(next(&mut refused).await.is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_idle_session_is_closed() {
    let config = ServerConfig::default().with_idle_timeout(Some(Duration::from_secs(1)));
    let server = start(config).await;
    let mut alice = login(&server, "alice").await;
    let mut bob = login(&server, "bob").await;
    next(&mut alice).await;

    // alice keeps talking, bob goes quiet
    let mut saw_leave = false;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        alice.heartbeat().await.unwrap();
        match next(&mut alice).await {
            Some(Message::Heartbeat(_)) => {}
            Some(Message::Leave(p)) if p.sender == "bob" => {
                saw_leave = true;
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(saw_leave);
    assert!(next(&mut bob).await.is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_garbage_closes_connection() {
    let server = start(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();

    // One Error frame, then EOF
    assert!(reply.len() > 16);
    assert_eq!(&reply[0..4], b"SAVI");
    assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 0x0002);

    server.shutdown();
}

#[tokio::test]
async fn test_server_only_kind_from_client() {
    let server = start(ServerConfig::default()).await;
    let mut client = login(&server, "alice").await;

    client
        .send(Message::UserList(UserList { users: vec![] }))
        .await
        .unwrap();
    match next(&mut client).await {
        Some(Message::Error(e)) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("expected a protocol error, got {:?}", other),
    }
    assert!(next(&mut client).await.is_none());

    server.shutdown();
}
