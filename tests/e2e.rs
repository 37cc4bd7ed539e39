//! End-to-end scenarios over loopback TCP: a real broker, real post
//! offices, real sockets.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tempfile::TempDir;

use courier::{
    CentralPostOffice, ClientEntry, CpoConfig, Mailbox, OverflowPolicy, PoConfig, PostOffice,
};

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const DELIVERY_DEADLINE: Duration = Duration::from_secs(5);

struct Rig {
    cpo: CentralPostOffice,
    alpha: PostOffice,
    beta: PostOffice,
    admin: PostOffice,
    port: u16,
    _secrets_dir: TempDir,
}

fn secret(tag: &str) -> String {
    STANDARD.encode(format!("secret for {tag}"))
}

fn po_config(name: &str, port: u16) -> PoConfig {
    PoConfig {
        name: name.into(),
        secret: secret(name),
        queue_size: 32,
        cpo_host: "127.0.0.1".into(),
        cpo_port: port,
        overflow: OverflowPolicy::DropNewest,
    }
}

fn start_rig() -> Rig {
    let secrets_dir = TempDir::new().expect("temp dir");
    let secrets_path = secrets_dir.path().join("clients.toml");

    let config = CpoConfig {
        name: "central".into(),
        local_address: "127.0.0.1".into(),
        port: 0,
        ping_interval_ms: 500,
        max_message_size: 5000,
        overflow: OverflowPolicy::DropNewest,
    };
    let clients = vec![
        ClientEntry {
            name: "alpha".into(),
            secret: secret("alpha"),
            manager: false,
        },
        ClientEntry {
            name: "beta".into(),
            secret: secret("beta"),
            manager: false,
        },
        ClientEntry {
            name: "admin".into(),
            secret: secret("admin"),
            manager: true,
        },
    ];

    let cpo = CentralPostOffice::start(config, clients, secrets_path).expect("start cpo");
    let port = cpo.local_addr().port();

    let alpha = PostOffice::new(po_config("alpha", port)).expect("start alpha");
    let beta = PostOffice::new(po_config("beta", port)).expect("start beta");
    let admin = PostOffice::new(po_config("admin", port)).expect("start admin");

    for po in [&alpha, &beta, &admin] {
        assert!(
            wait_for(CONNECT_DEADLINE, || po.is_connected()),
            "{} did not connect",
            po.name()
        );
    }

    Rig {
        cpo,
        alpha,
        beta,
        admin,
        port,
        _secrets_dir: secrets_dir,
    }
}

fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// Publish repeatedly from `publish` until `receive` sees a message;
// subscription plumbing is asynchronous, so the first few may be dropped.
fn publish_until_received(
    publisher: &Arc<Mailbox>,
    receiver: &Arc<Mailbox>,
    kind: &str,
    body: &[(&str, serde_json::Value)],
) -> courier::Message {
    let start = Instant::now();
    while start.elapsed() < DELIVERY_DEADLINE {
        let mut message = publisher.create_publish(kind).expect("create publish");
        for (key, value) in body {
            message.put(key, value.clone());
        }
        publisher.send(message);
        if let Some(received) = receiver.poll(Duration::from_millis(200)) {
            return received;
        }
    }
    panic!("no publish delivered within the deadline");
}

#[test]
fn publish_reaches_foreign_subscriber_with_envelope_intact() {
    let rig = start_rig();
    let alpha_io = rig.alpha.create_mailbox("io").unwrap();
    let beta_io = rig.beta.create_mailbox("io").unwrap();

    beta_io.subscribe("alpha.io", "sensor").unwrap();

    let received = publish_until_received(
        &alpha_io,
        &beta_io,
        "sensor.temperature",
        &[("temp", serde_json::json!(21.5))],
    );

    assert_eq!(received.from, "alpha.io");
    assert_eq!(received.kind.as_deref(), Some("sensor.temperature"));
    assert!(received.to.is_none());
    assert_eq!(received.get("temp").and_then(|v| v.as_f64()), Some(21.5));
}

#[test]
fn direct_message_round_trips_with_reply() {
    let rig = start_rig();
    let alpha_io = rig.alpha.create_mailbox("io").unwrap();
    let beta_io = rig.beta.create_mailbox("io").unwrap();

    // responder: answer every ping with an empty reply of the same type
    let responder = beta_io.clone();
    thread::spawn(move || {
        for _ in 0..100 {
            if let Some(message) = responder.poll(Duration::from_millis(200)) {
                if message.kind.as_deref() == Some("ping") {
                    let reply = responder.create_reply(&message, Some("ping")).unwrap();
                    responder.send(reply);
                    return;
                }
            }
        }
    });

    let message = alpha_io
        .create_direct("beta.io", Some("ping"), true)
        .unwrap();
    let id = message.id.clone();
    let reply = alpha_io.send_and_wait(message, Duration::from_secs(3));

    let reply = reply.expect("no reply within deadline");
    assert_eq!(reply.reply.as_deref(), Some(id.as_str()));
    assert_eq!(reply.from, "beta.io");
    assert_eq!(reply.to.as_deref(), Some("alpha.io"));
}

#[test]
fn encrypted_field_crosses_the_broker_and_decrypts_at_the_peer() {
    let rig = start_rig();
    let alpha_io = rig.alpha.create_mailbox("io").unwrap();
    let beta_io = rig.beta.create_mailbox("io").unwrap();

    let mut message = alpha_io
        .create_direct("beta.io", Some("login"), false)
        .unwrap();
    message.put_dotted("body.cred", "xyz");
    alpha_io.encrypt(&mut message, &["body.cred"]).unwrap();
    assert!(message.is_encrypted());
    assert!(!message.to_json().contains("xyz"));
    alpha_io.send(message);

    let received = beta_io
        .poll(DELIVERY_DEADLINE)
        .expect("no delivery within deadline");
    assert!(!received.is_encrypted());
    assert_eq!(received.get_dotted_str("body.cred"), Some("xyz"));
}

#[test]
fn link_failure_reconnects_and_message_still_arrives() {
    let rig = start_rig();
    let alpha_io = rig.alpha.create_mailbox("io").unwrap();
    let beta_io = rig.beta.create_mailbox("io").unwrap();

    assert_eq!(rig.alpha.connection_count(), 1);

    rig.alpha.kill_socket();
    let message = alpha_io
        .create_direct("beta.io", Some("note"), false)
        .unwrap();
    let payload = "x".repeat(2048);
    let mut message = message;
    message.put("payload", payload.clone());
    alpha_io.send(message);

    let received = beta_io
        .poll(DELIVERY_DEADLINE)
        .expect("message lost across reconnect");
    assert_eq!(received.get_str("payload"), Some(payload.as_str()));

    assert!(wait_for(CONNECT_DEADLINE, || {
        rig.alpha.is_connected() && rig.alpha.connection_count() >= 2
    }));
    assert!(rig.cpo.is_client_connected("alpha"));
}

#[test]
fn broker_replays_subscriptions_to_a_restarted_source() {
    let rig = start_rig();
    let alpha_io = rig.alpha.create_mailbox("io").unwrap();
    let beta_io = rig.beta.create_mailbox("io").unwrap();

    beta_io.subscribe("alpha.io", "periodic.1000ms").unwrap();
    publish_until_received(&alpha_io, &beta_io, "periodic.1000ms", &[]);

    // restart alpha: its in-memory proxy subscriptions are gone, so only
    // the broker's replay can resubscribe it
    rig.alpha.shutdown();
    drop(alpha_io);

    let alpha = PostOffice::new(po_config("alpha", rig.port)).expect("restart alpha");
    assert!(wait_for(CONNECT_DEADLINE, || alpha.is_connected()));
    let alpha_io = alpha.create_mailbox("io").unwrap();

    // beta takes no action; publishes from the restarted alpha flow again
    while let Some(_stale) = beta_io.try_take() {}
    let received = publish_until_received(&alpha_io, &beta_io, "periodic.1000ms", &[]);
    assert_eq!(received.from, "alpha.io");
}

#[test]
fn manager_surface_answers_status_and_connected() {
    let rig = start_rig();
    let ctl = rig.admin.create_mailbox("ctl").unwrap();

    let status = ctl
        .create_direct("central.po", Some("manage.status"), true)
        .unwrap();
    let reply = ctl
        .send_and_wait(status, Duration::from_secs(3))
        .expect("no status reply");
    assert_eq!(reply.kind.as_deref(), Some("manage.status"));
    assert_eq!(reply.get_str("name"), Some("central"));
    // the roster subtree was decrypted in transit by our own link
    assert_eq!(reply.get_dotted_str("clients.alpha.name"), Some("alpha"));
    assert_eq!(
        reply.get_dotted("clients.admin.manager"),
        Some(&serde_json::json!(true))
    );

    let connected = ctl
        .create_direct("central.po", Some("manage.connected"), true)
        .unwrap();
    let reply = ctl
        .send_and_wait(connected, Duration::from_secs(3))
        .expect("no connected reply");
    let list = reply.get_str("postOffices").unwrap_or_default();
    assert!(list.contains("alpha"), "got: {list}");
    assert!(list.contains("beta"), "got: {list}");
}

#[test]
fn non_manager_management_requests_are_ignored() {
    let rig = start_rig();
    let io = rig.alpha.create_mailbox("io").unwrap();

    let status = io
        .create_direct("central.po", Some("manage.status"), true)
        .unwrap();
    assert!(io.send_and_wait(status, Duration::from_millis(800)).is_none());
}

#[test]
fn mailbox_names_are_validated_and_unique() {
    let rig = start_rig();
    rig.alpha.create_mailbox("worker").unwrap();

    assert!(rig.alpha.create_mailbox("worker").is_err());
    assert!(rig.alpha.create_mailbox("").is_err());
    assert!(rig.alpha.create_mailbox("dotted.name").is_err());
    assert!(rig.alpha.create_mailbox("[({CPO})]").is_err());
    assert!(rig.alpha.create_mailbox("po").is_err());

    assert!(rig.alpha.get_mailbox("worker").is_some());
    assert!(rig.alpha.get_mailbox("missing").is_none());
}

#[test]
fn local_direct_delivery_skips_the_broker() {
    let rig = start_rig();
    let a = rig.beta.create_mailbox("a").unwrap();
    let b = rig.beta.create_mailbox("b").unwrap();

    let message = a.create_direct("b", Some("hello"), false).unwrap();
    a.send(message);

    let received = b.poll(Duration::from_secs(1)).expect("local delivery");
    assert_eq!(received.from, "beta.a");
    assert_eq!(received.to.as_deref(), Some("beta.b"));
}

#[test]
fn broker_survives_garbage_and_oversize_frames() {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use courier::crypto::Authenticator;
    use courier::message::Message;
    use courier::wire::{frame, Deframer};

    let secrets_dir = TempDir::new().expect("temp dir");
    let config = CpoConfig {
        name: "central".into(),
        local_address: "127.0.0.1".into(),
        port: 0,
        ping_interval_ms: 2000,
        max_message_size: 5000,
        overflow: OverflowPolicy::DropNewest,
    };
    let clients = vec![ClientEntry {
        name: "gamma".into(),
        secret: secret("gamma"),
        manager: false,
    }];
    let cpo = CentralPostOffice::start(config, clients, secrets_dir.path().join("clients.toml"))
        .expect("start cpo");

    let mut socket = TcpStream::connect(cpo.local_addr()).expect("connect");
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("read timeout");
    let mut deframer = Deframer::new(8192);

    let read_reply = |socket: &mut TcpStream, deframer: &mut Deframer, kind: &str| {
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            while let Some(frame) = deframer.next_frame() {
                let text = String::from_utf8_lossy(&frame).into_owned();
                let message = Message::from_json(&text).expect("decode reply");
                if message.kind.as_deref() == Some(kind) {
                    return message;
                }
            }
            match socket.read(&mut buf) {
                Ok(0) => panic!("broker closed the connection"),
                Ok(n) => {
                    deframer.push(&buf[..n]);
                }
                Err(_) => {}
            }
        }
        panic!("no {kind} reply within the deadline");
    };

    // authenticate so the broker will route for us
    let mut connect = Message::new(
        "gamma.po",
        Some("central.po"),
        Some("manage.connect"),
        "1.gamma",
        None,
        false,
    )
    .unwrap();
    let secret_bytes = STANDARD.decode(secret("gamma")).unwrap();
    let auth = Authenticator::new(&secret_bytes, "gamma", "1.gamma");
    connect.put("authenticator", auth.to_base64());
    socket.write_all(&connect.serialize()).expect("write connect");
    read_reply(&mut socket, &mut deframer, "manage.connect");

    // garbage and a correctly-framed but oversize payload
    socket.write_all(b"<<< not a frame at all >>>").unwrap();
    socket.write_all(&frame(&vec![b'x'; 5001])).unwrap();

    // the connection survives and the next well-formed request is answered
    let connected = Message::new(
        "gamma.ctl",
        Some("central.po"),
        Some("manage.connected"),
        "2.gamma",
        None,
        true,
    )
    .unwrap();
    socket.write_all(&connected.serialize()).unwrap();
    let reply = read_reply(&mut socket, &mut deframer, "manage.connected");
    assert!(reply.get_str("postOffices").unwrap_or_default().contains("gamma"));
}

#[test]
fn unsubscribe_stops_future_publishes() {
    let rig = start_rig();
    let alpha_io = rig.alpha.create_mailbox("io").unwrap();
    let beta_io = rig.beta.create_mailbox("io").unwrap();

    beta_io.subscribe("alpha.io", "tick").unwrap();
    publish_until_received(&alpha_io, &beta_io, "tick", &[]);

    beta_io.unsubscribe("alpha.io", "tick").unwrap();
    // drain anything in flight, give the unsubscribe time to propagate
    thread::sleep(Duration::from_millis(500));
    while let Some(_stale) = beta_io.try_take() {}

    let probe = alpha_io.create_publish("tick").unwrap();
    alpha_io.send(probe);
    assert!(beta_io.poll(Duration::from_millis(600)).is_none());
}
