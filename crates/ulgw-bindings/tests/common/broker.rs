//! In-process MQTT broker and client helpers.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeFilter};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Start a rumqttd broker on a free local port and return the port.
pub fn start_broker() -> u16 {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let mut v4 = HashMap::new();
    v4.insert(
        "test".to_string(),
        rumqttd::ServerSettings {
            name: "ulgw-test-broker".to_string(),
            listen: addr,
            tls: None,
            next_connection_delay_ms: 1,
            connections: rumqttd::ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 1024 * 1024,
                max_inflight_count: 100,
                auth: None,
                external_auth: None,
                dynamic_filters: true,
            },
        },
    );
    let config = rumqttd::Config {
        id: 0,
        router: rumqttd::RouterConfig {
            max_connections: 100,
            max_outgoing_packet_count: 200,
            max_segment_size: 1024 * 1024,
            max_segment_count: 10,
            custom_segment: None,
            initialized_filters: None,
            ..Default::default()
        },
        v4: Some(v4),
        v5: None,
        ws: None,
        cluster: None,
        console: None,
        bridge: None,
        prometheus: None,
        metrics: None,
    };

    std::thread::Builder::new()
        .name("ulgw-test-broker".to_string())
        .spawn(move || {
            let mut broker = rumqttd::Broker::new(config);
            let _ = broker.start();
        })
        .unwrap();

    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return port;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("broker did not start on {}", addr);
}

enum Seen {
    Connected,
    Subscribed,
    Message(String, String, QoS),
}

/// MQTT client standing in for a device or an observer.
pub struct TestClient {
    pub client: AsyncClient,
    events: mpsc::UnboundedReceiver<Seen>,
}

impl TestClient {
    /// Connect and, when `topics` is not empty, wait until they are subscribed.
    pub async fn connect(port: u16, id: &str, topics: &[&str]) -> Self {
        let mut options = MqttOptions::new(id, "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let seen = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => Seen::Connected,
                    Ok(Event::Incoming(Packet::SubAck(_))) => Seen::Subscribed,
                    Ok(Event::Incoming(Packet::Publish(p))) => Seen::Message(
                        p.topic.clone(),
                        String::from_utf8_lossy(&p.payload).to_string(),
                        p.qos,
                    ),
                    Ok(_) => continue,
                    Err(_) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if tx.send(seen).is_err() {
                    break;
                }
            }
        });

        let mut test_client = Self { client, events };
        test_client.wait(|s| matches!(s, Seen::Connected)).await;
        if !topics.is_empty() {
            test_client
                .client
                .subscribe_many(
                    topics
                        .iter()
                        .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtLeastOnce)),
                )
                .await
                .unwrap();
            test_client.wait(|s| matches!(s, Seen::Subscribed)).await;
        }
        test_client
    }

    async fn wait(&mut self, wanted: impl Fn(&Seen) -> bool) -> Seen {
        loop {
            let seen = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for the broker")
                .expect("client event loop ended");
            if wanted(&seen) {
                return seen;
            }
        }
    }

    /// Next publish received: topic, payload and delivery QoS.
    pub async fn next_message(&mut self) -> (String, String, QoS) {
        match self.wait(|s| matches!(s, Seen::Message(..))).await {
            Seen::Message(topic, payload, qos) => (topic, payload, qos),
            _ => unreachable!(),
        }
    }

    pub async fn publish(&self, topic: &str, payload: &str) {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .unwrap();
    }
}

/// Accept one connection, acknowledge its CONNECT, then hold it open for
/// `hold` before closing. The listener is dropped after the first accept.
pub fn fake_broker_once(listener: tokio::net::TcpListener, hold: Duration) {
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        drop(listener);
        let mut buf = [0u8; 512];
        let _ = socket.read(&mut buf).await;
        // CONNACK, session not present, accepted
        let _ = socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
        tokio::time::sleep(hold).await;
    });
}
