//! End-to-end tests against a live broker on loopback ports.

use std::net::TcpStream;
use std::time::Duration;

use marketbus::wire::frame::write_envelope;
use marketbus::{
    Aggregation, Broker, BrokerConfig, ComparisonOperator, Envelope, Event, EventBody,
    FilterCondition, NotificationBody, Payload, Publisher, Subscriber, Subscription, WindowSpec,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

fn start_broker(broker_id: &str) -> Broker {
    init_tracing();
    let cfg = BrokerConfig {
        broker_id: broker_id.to_string(),
        publisher_port: 0,
        subscriber_port: 0,
        peer_port: 0,
        ..BrokerConfig::default()
    };
    Broker::start(cfg).expect("broker must start")
}

fn connect_subscriber(broker: &Broker, subscriber_id: &str) -> Subscriber {
    let subscriber = Subscriber::connect(
        broker.addrs().management,
        broker.addrs().subscriber,
        subscriber_id,
    )
    .expect("subscriber must connect");
    // Give the egress attach a moment to land in the core.
    std::thread::sleep(Duration::from_millis(150));
    subscriber
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

fn rating(category: &str, value: f64) -> Event {
    Event::new(EventBody::UserRating {
        user_id: "u-1".into(),
        product_id: "p-1".into(),
        category: category.into(),
        rating: value,
        review_text: "review".into(),
    })
}

#[test]
fn simple_subscription_end_to_end() {
    let broker = start_broker("b-e2e-1");
    let subscriber = connect_subscriber(&broker, "client-1");

    let sub_id = subscriber
        .subscribe(Subscription::simple(
            "",
            "client-1",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Electronics")],
        ))
        .unwrap();
    assert!(!sub_id.is_empty());

    let mut publisher = Publisher::connect(broker.addrs().publisher).unwrap();
    let hit = purchase("Electronics", 99.0);
    let hit_id = hit.event_id.clone();
    publisher.publish(hit).unwrap();

    let notification = subscriber.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(notification.subscription_id, sub_id);
    assert_eq!(notification.subscriber_id, "client-1");
    assert_eq!(notification.matched_event().unwrap().event_id, hit_id);

    publisher.publish(purchase("Books", 10.0)).unwrap();
    assert!(subscriber.recv_timeout(Duration::from_millis(300)).is_err());

    let stats = broker.stats();
    assert!(stats.events_ingested >= 2);
    assert_eq!(stats.events_matched, 1);
    assert_eq!(stats.notifications_sent, 1);
    assert_eq!(stats.decode_errors, 0);

    let client_stats = subscriber.stats();
    assert_eq!(client_stats.notifications_received, 1);

    broker.shutdown();
}

#[test]
fn unsubscribe_stops_delivery() {
    let broker = start_broker("b-e2e-2");
    let subscriber = connect_subscriber(&broker, "client-2");
    let mut publisher = Publisher::connect(broker.addrs().publisher).unwrap();

    let sub_id = subscriber
        .subscribe(Subscription::simple(
            "",
            "client-2",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Books")],
        ))
        .unwrap();

    publisher.publish(purchase("Books", 5.0)).unwrap();
    subscriber.recv_timeout(Duration::from_secs(2)).unwrap();

    subscriber.unsubscribe(&sub_id).unwrap();
    assert!(subscriber.registered_ids().is_empty());

    publisher.publish(purchase("Books", 5.0)).unwrap();
    assert!(subscriber.recv_timeout(Duration::from_millis(400)).is_err());

    broker.shutdown();
}

#[test]
fn windowed_subscription_end_to_end() {
    let broker = start_broker("b-e2e-3");
    let subscriber = connect_subscriber(&broker, "client-3");
    let mut publisher = Publisher::connect(broker.addrs().publisher).unwrap();

    subscriber
        .subscribe(Subscription::complex(
            "",
            "client-3",
            vec![
                FilterCondition::simple("category", ComparisonOperator::Eq, "Electronics"),
                FilterCondition::windowed("avg_rating", ComparisonOperator::Gt, "4.0"),
            ],
            WindowSpec {
                window_size: 3,
                aggregation: Aggregation::Avg,
            },
        ))
        .unwrap();

    for value in [3.0, 5.0, 5.0, 4.0] {
        publisher.publish(rating("Electronics", value)).unwrap();
    }

    let notification = subscriber.recv_timeout(Duration::from_secs(2)).unwrap();
    let NotificationBody::Complex {
        aggregated_value,
        window_size,
        condition_met,
        ..
    } = notification.body
    else {
        panic!("expected complex notification");
    };
    assert!((aggregated_value - 13.0 / 3.0).abs() < 1e-9);
    assert_eq!(window_size, 3);
    assert!(condition_met);

    // The fourth rating opened a new window: nothing further.
    assert!(subscriber.recv_timeout(Duration::from_millis(400)).is_err());

    broker.shutdown();
}

#[test]
fn replayed_message_id_has_no_side_effects() {
    let broker = start_broker("b-e2e-4");
    let subscriber = connect_subscriber(&broker, "client-4");

    subscriber
        .subscribe(Subscription::simple(
            "",
            "client-4",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Home")],
        ))
        .unwrap();

    // Hand-rolled publisher so the exact same envelope (same message_id)
    // can be written twice.
    let env = Envelope::new(Payload::Event(purchase("Home", 42.0)));
    let mut stream = TcpStream::connect(broker.addrs().publisher).unwrap();
    write_envelope(&mut stream, &env).unwrap();
    write_envelope(&mut stream, &env).unwrap();

    subscriber.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(subscriber.recv_timeout(Duration::from_millis(400)).is_err());

    let stats = broker.stats();
    assert_eq!(stats.events_ingested, 1);
    assert_eq!(stats.notifications_sent, 1);

    broker.shutdown();
}

#[test]
fn invalid_subscription_is_rejected_synchronously() {
    let broker = start_broker("b-e2e-5");
    let subscriber = connect_subscriber(&broker, "client-5");

    let err = subscriber
        .subscribe(Subscription::simple("", "client-5", Vec::new()))
        .unwrap_err();
    assert!(err.to_string().contains("conditions"));

    // A complex subscription without a window config is rejected too.
    let mut bad = Subscription::complex(
        "",
        "client-5",
        vec![FilterCondition::windowed("avg_rating", ComparisonOperator::Gt, "4")],
        WindowSpec {
            window_size: 3,
            aggregation: Aggregation::Avg,
        },
    );
    bad.window = None;
    assert!(subscriber.subscribe(bad).is_err());

    // The connection stays usable for a valid registration afterwards.
    subscriber
        .subscribe(Subscription::simple(
            "",
            "client-5",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Toys")],
        ))
        .unwrap();

    broker.shutdown();
}

#[test]
fn wildcard_notifications_arrive_in_publish_order() {
    let broker = start_broker("b-e2e-6");
    let subscriber = connect_subscriber(&broker, "client-6");
    let mut publisher = Publisher::connect(broker.addrs().publisher).unwrap();

    subscriber
        .subscribe(Subscription::simple(
            "",
            "client-6",
            vec![FilterCondition::simple("price", ComparisonOperator::Gt, "1000")],
        ))
        .unwrap();

    let first = purchase("Electronics", 1200.0);
    let second = purchase("Automotive", 1500.0);
    let expected = [first.event_id.clone(), second.event_id.clone()];
    publisher.publish(first).unwrap();
    publisher.publish(second).unwrap();
    publisher.publish(purchase("Books", 20.0)).unwrap();

    let got = [
        subscriber
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .matched_event()
            .unwrap()
            .event_id
            .clone(),
        subscriber
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .matched_event()
            .unwrap()
            .event_id
            .clone(),
    ];
    assert_eq!(got, expected);
    assert!(subscriber.recv_timeout(Duration::from_millis(300)).is_err());

    broker.shutdown();
}
