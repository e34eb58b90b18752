//! End-to-end request/response scenarios over real shared memory.

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{TempBase, init_tracing};
use shmlane::{Address, FrameFlags, Incoming, MessageStream, MessageType, SendOptions};

/// Echo every message back as a response with the same type and id.
async fn echo(mut stream: MessageStream) {
    loop {
        let message = match stream.next_message().await {
            Ok(incoming) => incoming.into_message(),
            Err(_) => return,
        };
        if stream
            .reply(message.msg_type, message.payload, message.message_id)
            .await
            .is_err()
        {
            return;
        }
    }
}

fn expect_message(incoming: Incoming) -> shmlane::Message {
    match incoming {
        Incoming::Message(m) => m,
        Incoming::Unrecognized(m) => panic!("unexpected type {:?}", m.msg_type),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_round_trip() {
    init_tracing();
    let base = TempBase::new("heartbeat");
    let config = base.config();
    let address = Address::new("scenario-a");
    let mut server = shmlane::listen(&address, config.clone()).await.unwrap();

    let server_task = tokio::spawn(async move {
        let stream = server.accept().await.unwrap();
        echo(stream).await;
        server
    });

    let mut client = shmlane::connect(&address, &config).await.unwrap();
    let started = Instant::now();
    let id = client.heartbeat().await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), client.next_message())
        .await
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();

    let reply = expect_message(reply);
    assert_eq!(reply.msg_type, MessageType::HEARTBEAT);
    assert!(reply.payload.is_empty());
    assert_eq!(reply.message_id, id);
    assert!(reply.is_response());
    assert!(elapsed < Duration::from_millis(500), "round trip took {elapsed:?}");

    client.close();
    let server = server_task.await.unwrap();
    let metrics = server.metrics();
    assert_eq!(metrics.connections_opened, 1);
    assert!(metrics.frames_received >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_payloads_plain_and_compressed() {
    init_tracing();
    let base = TempBase::new("large");
    let config = base.config();
    let address = Address::new("scenario-b");
    let mut server = shmlane::listen(&address, config.clone()).await.unwrap();

    let server_task = tokio::spawn(async move {
        let mut stream = server.accept().await.unwrap();
        let mut received = Vec::new();
        for _ in 0..2 {
            let message = stream.next_message().await.unwrap().into_message();
            stream
                .reply(MessageType::COMPLETION_RESPONSE, Bytes::new(), message.message_id)
                .await
                .unwrap();
            received.push(message);
        }
        received
    });

    let mut client = shmlane::connect(&address, &config).await.unwrap();

    // Pseudo-random bytes: not compressible, crosses the ring many times.
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let noisy: Vec<u8> = (0..2 * 1024 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    let plain_id = client
        .send(MessageType::COMPLETION_REQUEST, noisy.clone())
        .await
        .unwrap();
    let ack = client.next_message().await.unwrap().into_message();
    assert_eq!(ack.message_id, plain_id);

    let text = "the quick brown fox jumps over the lazy dog\n".repeat(48 * 1024);
    let compressed_id = client
        .send_with(
            MessageType::COMPLETION_REQUEST,
            text.clone(),
            SendOptions {
                flags: FrameFlags::REQUEST,
                compress: true,
                message_id: None,
            },
        )
        .await
        .unwrap();
    let ack = client.next_message().await.unwrap().into_message();
    assert_eq!(ack.message_id, compressed_id);

    let received = server_task.await.unwrap();
    assert_eq!(received[0].message_id, plain_id);
    assert_eq!(received[0].payload.as_ref(), noisy.as_slice());
    assert_eq!(received[1].message_id, compressed_id);
    assert_eq!(received[1].payload.as_ref(), text.as_bytes());
    assert!(!received[1].flags.contains(FrameFlags::COMPRESSED));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_keep_ids_straight() {
    const CLIENTS: usize = 32;
    const MESSAGES: usize = 1000;

    init_tracing();
    let base = TempBase::new("concurrent");
    let config = base.config();
    let address = Address::new("scenario-c");
    let mut server = shmlane::listen(&address, config.clone()).await.unwrap();

    let acceptor = tokio::spawn(async move {
        let mut echoes = Vec::new();
        for _ in 0..CLIENTS {
            let stream = server.accept().await.unwrap();
            echoes.push(tokio::spawn(echo(stream)));
        }
        (server, echoes)
    });

    let mut clients = Vec::new();
    for n in 0..CLIENTS {
        let config = config.clone();
        let address = address.clone();
        clients.push(tokio::spawn(async move {
            let mut stream = shmlane::connect(&address, &config).await.unwrap();
            for i in 0..MESSAGES {
                let payload = format!("client {n} message {i}");
                let id = stream
                    .send(MessageType::CHAT_MESSAGE, payload.clone())
                    .await
                    .unwrap();
                let reply = stream.next_message().await.unwrap().into_message();
                assert_eq!(reply.message_id, id);
                assert_eq!(reply.payload.as_ref(), payload.as_bytes());
            }
            stream.close();
            MESSAGES
        }));
    }

    let mut total = 0;
    for client in clients {
        total += tokio::time::timeout(Duration::from_secs(120), client)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(total, CLIENTS * MESSAGES);

    let (server, echoes) = acceptor.await.unwrap();
    for echo in echoes {
        echo.await.unwrap();
    }
    let metrics = server.metrics();
    assert_eq!(metrics.connections_opened, CLIENTS as u64);
    // Requests plus one DISCONNECT per client.
    assert_eq!(metrics.frames_received, (CLIENTS * (MESSAGES + 1)) as u64);
    assert_eq!(metrics.protocol_errors, 0);
}
