use gantry_broker::TestBroker;
use gantry_messaging::config::PROP_POLL_WAIT_MS;
use gantry_messaging::{
    Channel, HttpClient, Message, MessageQueue, MessagingClient, MessagingConfig,
};
use gantry_model::InstancePath;
use std::time::{Duration, Instant};

fn client(broker: &TestBroker, owner: &str) -> (HttpClient, MessageQueue) {
    let config = MessagingConfig::http(&broker.url).with_property(PROP_POLL_WAIT_MS, "100");
    let client = HttpClient::new(&config, owner).unwrap();
    let queue = MessageQueue::new();
    client.set_message_queue(queue.clone());
    client.open_connection().unwrap();
    (client, queue)
}

fn wait_for(queue: &MessageQueue, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.len() < count {
        assert!(Instant::now() < deadline, "expected {count} message(s)");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn start(path: &str) -> Message {
    Message::StartInstance {
        path: InstancePath::parse(path).unwrap(),
    }
}

#[test]
fn messages_flow_between_http_clients_in_order() {
    let broker = TestBroker::start().unwrap();
    let (agent, inbox) = client(&broker, "agent");
    let (dm, _) = client(&broker, "dm");
    let channel = Channel::agent("shop", "vm1");
    agent.subscribe(&channel).unwrap();

    for i in 0..5 {
        dm.publish(&channel, &start(&format!("/vm1/n{i}"))).unwrap();
    }
    wait_for(&inbox, 5);
    for i in 0..5 {
        assert_eq!(inbox.try_take(), Some(start(&format!("/vm1/n{i}"))));
    }
}

#[test]
fn close_drops_subscriptions_on_the_broker() {
    let broker = TestBroker::start().unwrap();
    let (agent, _) = client(&broker, "agent");
    agent.subscribe(&Channel::dm("shop")).unwrap();
    assert_eq!(broker.hub().subscriber_count("shop/dm"), 1);
    agent.close_connection().unwrap();
    assert_eq!(broker.hub().subscriber_count("shop/dm"), 0);
    assert_eq!(broker.hub().stats().clients, 0);
}

#[test]
fn purge_removes_only_that_application() {
    let broker = TestBroker::start().unwrap();
    let (c, _) = client(&broker, "c");
    c.subscribe(&Channel::imports("shop", "db")).unwrap();
    c.subscribe(&Channel::imports("blog", "db")).unwrap();
    c.delete_messaging_server_artifacts("shop").unwrap();
    assert_eq!(broker.hub().subscriber_count("shop/imports/db"), 0);
    assert_eq!(broker.hub().subscriber_count("blog/imports/db"), 1);
}

#[test]
fn client_recovers_after_broker_forgets_it() {
    let broker = TestBroker::start().unwrap();
    let (agent, inbox) = client(&broker, "agent");
    let (dm, _) = client(&broker, "dm");
    let channel = Channel::agent("shop", "vm1");
    agent.subscribe(&channel).unwrap();

    broker.hub().reset();
    // Both clients re-register from their poll loops.
    let deadline = Instant::now() + Duration::from_secs(10);
    while broker.hub().subscriber_count("shop/agent/vm1") == 0 {
        assert!(Instant::now() < deadline, "subscription was not restored");
        std::thread::sleep(Duration::from_millis(20));
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while !broker.hub().is_connected(dm.client_id()) {
        assert!(Instant::now() < deadline, "publisher did not re-register");
        std::thread::sleep(Duration::from_millis(20));
    }

    dm.publish(&channel, &start("/vm1/after")).unwrap();
    wait_for(&inbox, 1);
    assert_eq!(inbox.try_take(), Some(start("/vm1/after")));
}
