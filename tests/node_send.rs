#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;

use common::{make_key, make_node, TestNode};
use peer_dht::framing::{read_frame, write_frame};
use peer_dht::protocol::{Negotiation, StreamHello};
use peer_dht::{
    Error, Hash, Message, MessageHandler, MsgType, Node, NodeConfig, PeerId, Protocol,
    ProtocolBinding, PutRequest, Result, DHT_PROTOCOL, SOURCE_PROTOCOL,
};

const ECHO_PROTOCOL: Protocol = Protocol::new("/test-echo/1.0.0", "test-echo");

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, _from: PeerId, msg: Message) -> Result<Message> {
        Ok(msg)
    }
}

struct Slow(Duration);

#[async_trait]
impl MessageHandler for Slow {
    async fn handle(&self, _from: PeerId, _msg: Message) -> Result<Message> {
        tokio::time::sleep(self.0).await;
        Ok(Message::OkResponse)
    }
}

fn fish_put() -> Message {
    Message::PutRequest(PutRequest {
        key: Hash::digest(b"fish"),
        value: b"fish".to_vec(),
    })
}

#[tokio::test]
async fn put_request_on_dht_protocol_is_acknowledged() {
    let a = TestNode::new(1).await;
    let b = TestNode::new(2).await;
    b.learn(&a).await;

    let response = b
        .node
        .send(&DHT_PROTOCOL, a.id(), &fish_put())
        .await
        .expect("send succeeds");

    assert_eq!(response, Message::OkResponse);
    assert_eq!(response.to_string(), "{1 <nil>}");
    assert_eq!(a.dht.get(&Hash::digest(b"fish")).await.unwrap(), b"fish");
}

#[tokio::test]
async fn put_request_on_source_protocol_is_rejected_by_whitelist() {
    let a = TestNode::new(3).await;
    let b = TestNode::new(4).await;
    a.learn(&b).await;

    let response = a
        .node
        .send(&SOURCE_PROTOCOL, b.id(), &fish_put())
        .await
        .expect("rejection is a response, not a transport failure");

    assert_eq!(response.msg_type(), MsgType::ErrorResponse);
    assert_eq!(
        response,
        Message::error("message type 2 not in holochain-src protocol")
    );
    assert_eq!(b.dht.stored_keys().await, 0);
}

#[tokio::test]
async fn unknown_peer_is_a_transport_error() {
    let a = TestNode::new(5).await;
    let stranger = PeerId::from_private_key(&make_key(999)).unwrap();

    let err = a
        .node
        .send(&DHT_PROTOCOL, stranger, &fish_put())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn protocol_not_started_is_a_protocol_error() {
    let a = TestNode::new(6).await;
    let bare = make_node(7, NodeConfig::default()).await.unwrap();
    a.node.add_peer(bare.peer_id(), bare.net_addr()).await;

    let err = a
        .node
        .send(&DHT_PROTOCOL, bare.peer_id(), &fish_put())
        .await
        .unwrap_err();
    match err {
        Error::Protocol { protocol, peer } => {
            assert_eq!(protocol, DHT_PROTOCOL.id);
            assert_eq!(peer, bare.peer_id());
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn dialing_the_wrong_listener_is_a_transport_error() {
    let a = TestNode::new(8).await;
    let b = TestNode::new(9).await;
    let impostor = PeerId::from_private_key(&make_key(10)).unwrap();
    a.node.add_peer(impostor, b.node.net_addr()).await;

    let err = a
        .node
        .send(&DHT_PROTOCOL, impostor, &fish_put())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn slow_handler_times_out() {
    let a = make_node(11, NodeConfig::default()).await.unwrap();
    let b = make_node(12, NodeConfig::default()).await.unwrap();
    b.register(
        ProtocolBinding::new(ECHO_PROTOCOL).route(MsgType::GetRequest, Slow(Duration::from_secs(5))),
    )
    .await
    .unwrap();
    a.add_peer(b.peer_id(), b.net_addr()).await;

    let err = a
        .send_with_timeout(
            &ECHO_PROTOCOL,
            b.peer_id(),
            &Message::GetRequest(Hash::digest(b"slow")),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn configured_request_timeout_applies_to_send() {
    let config = NodeConfig {
        request_timeout_ms: 100,
        ..NodeConfig::default()
    };
    let a = make_node(13, config).await.unwrap();
    let b = make_node(14, NodeConfig::default()).await.unwrap();
    b.register(
        ProtocolBinding::new(ECHO_PROTOCOL).route(MsgType::OkResponse, Slow(Duration::from_secs(5))),
    )
    .await
    .unwrap();
    a.add_peer(b.peer_id(), b.net_addr()).await;

    let err = a
        .send(&ECHO_PROTOCOL, b.peer_id(), &Message::OkResponse)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn custom_protocol_round_trips_and_can_be_replaced() {
    let a = make_node(15, NodeConfig::default()).await.unwrap();
    let b = make_node(16, NodeConfig::default()).await.unwrap();
    a.add_peer(b.peer_id(), b.net_addr()).await;

    b.register(ProtocolBinding::new(ECHO_PROTOCOL).route(MsgType::ValueResponse, Echo))
        .await
        .unwrap();
    let msg = Message::ValueResponse(vec![1, 2, 3]);
    assert_eq!(a.send(&ECHO_PROTOCOL, b.peer_id(), &msg).await.unwrap(), msg);

    b.register(ProtocolBinding::new(ECHO_PROTOCOL).route(MsgType::GetRequest, Echo))
        .await
        .unwrap();
    let response = a.send(&ECHO_PROTOCOL, b.peer_id(), &msg).await.unwrap();
    assert_eq!(
        response,
        Message::error("message type 5 not in test-echo protocol")
    );
}

#[tokio::test]
async fn node_can_send_to_itself() {
    let a = TestNode::new(17).await;
    let response = a
        .node
        .send(&DHT_PROTOCOL, a.id(), &fish_put())
        .await
        .unwrap();
    assert_eq!(response, Message::OkResponse);
}

#[tokio::test]
async fn concurrent_sends_each_get_their_own_response() {
    let a = TestNode::new(18).await;
    let b = TestNode::new(19).await;
    b.learn(&a).await;

    let values: Vec<Vec<u8>> = (0..16).map(|i| format!("payload-{i}").into_bytes()).collect();
    let sends = values.iter().map(|value| {
        let node = b.node.clone();
        let msg = Message::PutRequest(PutRequest {
            key: Hash::digest(value),
            value: value.clone(),
        });
        let target = a.id();
        async move { node.send(&DHT_PROTOCOL, target, &msg).await }
    });

    for response in join_all(sends).await {
        assert_eq!(response.unwrap(), Message::OkResponse);
    }
    assert_eq!(a.dht.stored_keys().await, values.len());
    for value in &values {
        assert_eq!(&a.dht.get(&Hash::digest(value)).await.unwrap(), value);
    }
}

#[tokio::test]
async fn malformed_request_gets_error_response() {
    let a = TestNode::new(20).await;
    let max = a.node.config().max_frame_size;

    let mut stream = TcpStream::connect(a.node.net_addr().socket_addr())
        .await
        .unwrap();
    let hello = StreamHello {
        protocol: DHT_PROTOCOL.id.to_string(),
        from: PeerId::from_private_key(&make_key(21)).unwrap(),
        to: a.id(),
    };
    write_frame(&mut stream, &serde_json::to_vec(&hello).unwrap(), max)
        .await
        .unwrap();
    let negotiation = read_frame(&mut stream, max).await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_slice::<Negotiation>(&negotiation).unwrap(),
        Negotiation::Accepted
    );

    write_frame(&mut stream, &[2, b'{', b'"'], max).await.unwrap();
    let response = read_frame(&mut stream, max).await.unwrap().unwrap();
    match Message::decode(&response).unwrap() {
        Message::ErrorResponse(reason) => assert!(reason.starts_with("malformed message")),
        other => panic!("expected error response, got {other}"),
    }
}

#[tokio::test]
async fn close_is_idempotent_and_frees_the_address() {
    let a = TestNode::new(22).await;
    let b = TestNode::new(23).await;
    b.learn(&a).await;
    let addr = a.node.net_addr();

    a.node.close().await;
    a.node.close().await;
    assert!(a.node.is_closed());

    let err = b
        .node
        .send(&DHT_PROTOCOL, a.id(), &fish_put())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");

    let again = Node::new(addr, &make_key(22)).await.expect("address is free again");
    assert_eq!(again.net_addr(), addr);
    assert_eq!(again.peer_id(), a.id());
    again.close().await;
}

#[tokio::test]
async fn dropping_the_last_handle_releases_the_listener() {
    let node = make_node(24, NodeConfig::default()).await.unwrap();
    let addr = node.net_addr();
    drop(node);

    let mut rebound = None;
    for _ in 0..50 {
        if let Ok(node) = Node::new(addr, &make_key(24)).await {
            rebound = Some(node);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rebound.is_some(), "listener was not released");
}

#[tokio::test]
async fn idle_inbound_stream_does_not_keep_a_dropped_node_alive() {
    let node = TestNode::new(28).await;
    let addr = node.node.net_addr();

    let _idle = TcpStream::connect(addr.socket_addr()).await.unwrap();
    // let the accept loop pick the stream up
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(node);

    let mut rebound = None;
    for _ in 0..50 {
        if let Ok(node) = Node::new(addr, &make_key(28)).await {
            rebound = Some(node);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rebound.is_some(), "idle stream kept the listener bound");
}

#[tokio::test]
async fn idle_inbound_stream_is_closed_after_request_timeout() {
    let config = NodeConfig {
        request_timeout_ms: 100,
        ..NodeConfig::default()
    };
    let node = make_node(29, config).await.unwrap();
    let mut idle = TcpStream::connect(node.net_addr().socket_addr())
        .await
        .unwrap();

    let closed = tokio::time::timeout(
        Duration::from_secs(2),
        read_frame(&mut idle, node.config().max_frame_size),
    )
    .await
    .expect("server closed the idle stream");
    assert!(matches!(closed, Ok(None) | Err(Error::Transport(_))));
}

#[tokio::test]
async fn peer_ids_are_deterministic_per_key() {
    let a = make_node(25, NodeConfig::default()).await.unwrap();
    let b = make_node(25, NodeConfig::default()).await.unwrap();
    let c = make_node(26, NodeConfig::default()).await.unwrap();

    assert_eq!(a.peer_id(), b.peer_id());
    assert_ne!(a.peer_id(), c.peer_id());
    assert_eq!(a.peer_id(), PeerId::from_private_key(&make_key(25)).unwrap());
}

#[tokio::test]
async fn net_addr_is_rendered_as_multiaddr() {
    let a = make_node(27, NodeConfig::default()).await.unwrap();
    let port = a.net_addr().socket_addr().port();
    assert_eq!(a.net_addr().to_string(), format!("/ip4/127.0.0.1/tcp/{port}"));
}
