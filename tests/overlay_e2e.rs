//! Peer overlay tests: meshed brokers on loopback ports.

use std::net::TcpListener;
use std::time::{Duration, Instant};

use marketbus::{
    Broker, BrokerConfig, ComparisonOperator, Event, EventBody, FilterCondition, Publisher,
    Subscriber, Subscription,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Reserves a loopback port by binding ephemerally and releasing it.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

fn mesh_config(broker_id: &str, peer_port: u16, peers: &[u16]) -> BrokerConfig {
    BrokerConfig {
        broker_id: broker_id.to_string(),
        publisher_port: 0,
        subscriber_port: 0,
        peer_port,
        peer_endpoints: peers.iter().map(|p| format!("127.0.0.1:{p}")).collect(),
        ..BrokerConfig::default()
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn purchase(category: &str, price: f64) -> Event {
    Event::new(EventBody::Purchase {
        user_id: "u-1".into(),
        product_id: "p-1".into(),
        category: category.into(),
        price,
        quantity: 1,
        warehouse_id: "w-1".into(),
    })
}

#[test]
fn notification_routes_to_the_home_broker() {
    init_tracing();
    let (p1, p2, p3) = (free_port(), free_port(), free_port());
    let b1 = Broker::start(mesh_config("b1", p1, &[p2, p3])).unwrap();
    let b2 = Broker::start(mesh_config("b2", p2, &[p1, p3])).unwrap();
    let b3 = Broker::start(mesh_config("b3", p3, &[p1, p2])).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            b1.stats().peers_up == 2 && b2.stats().peers_up == 2 && b3.stats().peers_up == 2
        }),
        "mesh links must come up"
    );

    // Subscriber homes at B2; the summary is announced to B1 and B3.
    let subscriber =
        Subscriber::connect(b2.addrs().management, b2.addrs().subscriber, "client-1").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    let sub_id = subscriber
        .subscribe(Subscription::simple(
            "",
            "client-1",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Electronics")],
        ))
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // Event arrives at B1, matches there, and the notification is routed
    // home to B2 for delivery.
    let mut publisher = Publisher::connect(b1.addrs().publisher).unwrap();
    let hit = purchase("Electronics", 120.0);
    let hit_id = hit.event_id.clone();
    publisher.publish(hit).unwrap();

    let notification = subscriber.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(notification.subscription_id, sub_id);
    assert_eq!(notification.matched_event().unwrap().event_id, hit_id);

    // Exactly once: nothing else shows up, and B3 forwarded nothing.
    assert!(subscriber.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(b3.stats().notifications_sent, 0);
    assert_eq!(b1.stats().events_matched, 1);

    b1.shutdown();
    b2.shutdown();
    b3.shutdown();
}

#[test]
fn summaries_replay_when_a_peer_joins_late() {
    init_tracing();
    let (p1, p2) = (free_port(), free_port());
    let b1 = Broker::start(mesh_config("b1", p1, &[p2])).unwrap();

    // Subscribe at B1 while B2 does not exist yet.
    let subscriber =
        Subscriber::connect(b1.addrs().management, b1.addrs().subscriber, "client-1").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    subscriber
        .subscribe(Subscription::simple(
            "",
            "client-1",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Books")],
        ))
        .unwrap();

    // B2 joins late; B1's link thread reconnects and announces the summary
    // snapshot.
    let b2 = Broker::start(mesh_config("b2", p2, &[p1])).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            b1.stats().peers_up == 1 && b2.stats().peers_up == 1
        }),
        "late mesh link must come up"
    );
    std::thread::sleep(Duration::from_millis(300));

    let mut publisher = Publisher::connect(b2.addrs().publisher).unwrap();
    publisher.publish(purchase("Books", 30.0)).unwrap();

    let notification = subscriber.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(notification.subscriber_id, "client-1");

    b1.shutdown();
    b2.shutdown();
}

#[test]
fn partitioned_broker_keeps_serving_local_subscriptions() {
    init_tracing();
    let (p1, p2) = (free_port(), free_port());
    let b1 = Broker::start(mesh_config("b1", p1, &[p2])).unwrap();
    let b2 = Broker::start(mesh_config("b2", p2, &[p1])).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            b1.stats().peers_up == 1 && b2.stats().peers_up == 1
        }),
        "mesh link must come up"
    );

    let subscriber =
        Subscriber::connect(b2.addrs().management, b2.addrs().subscriber, "client-1").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    subscriber
        .subscribe(Subscription::simple(
            "",
            "client-1",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Sports")],
        ))
        .unwrap();

    // Take B1 away; B2 keeps matching and delivering its local traffic.
    b1.shutdown();
    std::thread::sleep(Duration::from_millis(300));

    let mut publisher = Publisher::connect(b2.addrs().publisher).unwrap();
    publisher.publish(purchase("Sports", 60.0)).unwrap();

    let notification = subscriber.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(notification.subscriber_id, "client-1");

    b2.shutdown();
}
