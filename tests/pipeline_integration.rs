//! ---
//! sdc_section: "15-testing-qa-runbook"
//! sdc_subsection: "integration-test"
//! sdc_type: "source"
//! sdc_scope: "test"
//! sdc_description: "Cross-crate receiver pipeline scenarios."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! Full-pipeline scenarios: transport payloads in, controller state, ACK
//! datagrams and bus notifications out.

use std::sync::Arc;

use indexmap::IndexMap;
use sdc_bus::MessageBus;
use sdc_common::config::{ControllerSetupConfig, ServiceEntryConfig, ServiceGroupConfig};
use sdc_common::time::unix_now;
use sdc_proto::{FieldValue, SdpMessage, SignedSdp};
use sdc_receiver::{
    DatagramOutcome, HostRef, MemorySink, ReceiverConfig, ReceiverError, SdpReceiver,
};
use sdc_state::ControllerRegistry;
use serde_json::json;

struct Pipeline {
    receiver: SdpReceiver,
    controllers: Arc<ControllerRegistry>,
    bus: Arc<MessageBus>,
    sink: MemorySink,
    host: HostRef,
}

fn servicegroups() -> IndexMap<String, ServiceGroupConfig> {
    let mut pumps = ServiceGroupConfig::default();
    pumps.services.insert(
        "ABS".into(),
        ServiceEntryConfig {
            value_register: Some("ABW".into()),
            scale: Some(10.0),
            name: "flow".into(),
            unit: Some("l/min".into()),
        },
    );
    let mut groups = IndexMap::new();
    groups.insert("pumps".into(), pumps);
    groups
}

fn pipeline() -> Pipeline {
    let controllers = Arc::new(ControllerRegistry::new());
    let bus = Arc::new(MessageBus::new());
    let sink = MemorySink::new();
    let receiver = SdpReceiver::new(
        controllers.clone(),
        Arc::new(servicegroups()),
        bus.clone(),
        Arc::new(sink.clone()),
        ReceiverConfig::default(),
    );
    Pipeline {
        receiver,
        controllers,
        bus,
        sink,
        host: HostRef::new("192.0.2.7:40000".parse().unwrap()),
    }
}

fn sent_text(sink: &MemorySink) -> Vec<String> {
    sink.take()
        .into_iter()
        .map(|(_, bytes)| String::from_utf8(bytes).expect("utf8 packet"))
        .collect()
}

#[test]
fn unsigned_controller_scenario() {
    let pipeline = pipeline();
    let mut controller_events = pipeline
        .bus
        .subscribe_channel("t1", "controllers/C1", "viewer");
    let mut host_events = pipeline.bus.subscribe_channel("t1", "hosts/C1", "viewer");

    let now = unix_now() as u64;
    let wire = format!("id:C1\nin:1,{now}\nAAS:2\n");
    let outcome = pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .expect("datagram applied");
    assert_eq!(
        outcome,
        DatagramOutcome::Applied {
            controller: "C1".into(),
            updated: 1,
            queried: 0,
        }
    );

    // Register state reflects the datagram.
    let handle = pipeline.controllers.lookup("C1").expect("auto-registered");
    {
        let controller = handle.lock();
        let entry = controller.register("AAS").expect("status register");
        assert_eq!(entry.value, FieldValue::Status(2));
        assert_eq!(entry.timestamp, now as f64);
        assert_eq!(controller.last_seq(), Some(1));
        assert_eq!(controller.stats().rx_ok, 1);
    }

    // The ACK went back to the sender and echoes the time base.
    let sent = sent_text(&pipeline.sink);
    assert_eq!(sent, vec![format!("id:C1\nin:1,{now}\n")]);

    // Both per-controller subjects fired.
    let event = controller_events.try_recv().expect("controllers publish");
    assert_eq!(event.subject, "controllers/C1");
    assert_eq!(event.envelope.body["controller"], "C1");
    assert_eq!(
        event.envelope.body["registers"][0]["register"],
        json!("AAS")
    );
    let event = host_events.try_recv().expect("hosts publish");
    assert_eq!(event.envelope.body["controller"], "C1");
}

#[test]
fn service_projection_is_published_for_configured_groups() {
    let pipeline = pipeline();
    {
        let handle = pipeline.controllers.find_or_create("C1");
        handle.lock().set_setup(ControllerSetupConfig {
            secret_key: None,
            servicegroup: Some("pumps".into()),
        });
    }
    let mut service_events = pipeline
        .bus
        .subscribe_channel("t1", "services/C1", "viewer");

    let now = unix_now() as u64;
    let wire = format!("id:C1\nin:1,{now}\nABS:2\nABW:150 null 30\n");
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .expect("datagram applied");

    let event = service_events.try_recv().expect("services publish");
    assert_eq!(event.envelope.body["controller"], "C1");
    let services = event.envelope.body["services"]
        .as_array()
        .expect("service rows");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["key"], "ABW");
    assert_eq!(services[0]["status"], 2);
    assert_eq!(services[0]["value"], json!([15.0, null, 3.0]));

    // A datagram not touching the group publishes no service update.
    let wire = format!("id:C1\nin:2,{}\nZZV:1\n", now + 1);
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .expect("datagram applied");
    assert!(service_events.try_recv().is_err());
}

#[test]
fn pending_write_confirmation_over_the_pipeline() {
    let pipeline = pipeline();
    let now = unix_now() as u64;

    // Operator queues a write; the next ACK carries it.
    {
        let handle = pipeline.controllers.find_or_create("C1");
        handle.lock().queue_write("AAV", 10).unwrap();
    }
    let wire = format!("id:C1\nin:1,{now}\nABS:1\n");
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap();
    let sent = sent_text(&pipeline.sink);
    assert_eq!(sent, vec![format!("id:C1\nin:1,{now}\nAAV:10\n")]);

    // Device reports a different value: entry stays queued with a retry.
    let wire = format!("id:C1\nin:2,{}\nAAV:7\n", now + 1);
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap();
    {
        let handle = pipeline.controllers.lookup("C1").unwrap();
        let controller = handle.lock();
        let (_, pending) = controller
            .send_queue()
            .find(|(name, _)| *name == "AAV")
            .expect("still queued");
        assert_eq!(pending.tries, 1);
    }

    // Device adopts the value: entry leaves the queue, ACK carries nothing.
    let wire = format!("id:C1\nin:3,{}\nAAV:10\n", now + 2);
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap();
    let sent = sent_text(&pipeline.sink);
    let last_ack = sent.last().expect("acks sent");
    assert_eq!(*last_ack, format!("id:C1\nin:3,{}\n", now + 2));
    {
        let handle = pipeline.controllers.lookup("C1").unwrap();
        assert_eq!(handle.lock().send_queue_len(), 0);
    }
}

#[test]
fn query_marker_requests_a_resend() {
    let pipeline = pipeline();
    let now = unix_now() as u64;

    let wire = format!("id:C1\nin:1,{now}\nAAV:42\n");
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap();
    pipeline.sink.take();

    // The device asks for the current value back.
    let wire = format!("id:C1\nin:2,{}\nAAV:?\n", now + 1);
    let outcome = pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap();
    assert_eq!(
        outcome,
        DatagramOutcome::Applied {
            controller: "C1".into(),
            updated: 0,
            queried: 1,
        }
    );
    let sent = sent_text(&pipeline.sink);
    assert_eq!(sent, vec![format!("id:C1\nin:2,{}\nAAV:42\n", now + 1)]);
}

#[test]
fn secured_controller_full_cycle() {
    let pipeline = pipeline();
    {
        let handle = pipeline.controllers.find_or_create("C2");
        handle.lock().set_setup(ControllerSetupConfig {
            secret_key: Some("s3cret".into()),
            servicegroup: None,
        });
    }
    let now = unix_now() as u64;

    // 1. Any first datagram only triggers the nonce handshake.
    let hello = format!("id:C2\nin:1,{now}\nAAS:1\n");
    let outcome = pipeline
        .receiver
        .on_datagram(&pipeline.host, hello.as_bytes())
        .unwrap();
    assert_eq!(
        outcome,
        DatagramOutcome::NonceIssued {
            controller: "C2".into()
        }
    );
    let sent = sent_text(&pipeline.sink);
    assert_eq!(sent.len(), 1);
    let nonce_packet = SdpMessage::decode(&sent[0]).unwrap();
    let Some(FieldValue::Data(nonce)) = nonce_packet.get("nonce").cloned() else {
        panic!("nonce packet carries the nonce field");
    };
    {
        let handle = pipeline.controllers.lookup("C2").unwrap();
        let controller = handle.lock();
        assert!(controller.register("AAS").is_none(), "nothing applied yet");
        assert_eq!(controller.stats().tx_nonce, 1);
    }

    // 2. Signed multipart datagram under the nonce is applied atomically.
    let mut msg = SdpMessage::with_id("C2");
    let mut first = SdpMessage::new();
    first.add("in", format!("1,{now}").as_str()).unwrap();
    first.add("AAS", 1).unwrap();
    msg.push_piece(first).unwrap();
    let mut second = SdpMessage::new();
    second.add("in", format!("2,{}", now + 1).as_str()).unwrap();
    second.add("AAS", 3).unwrap();
    msg.push_piece(second).unwrap();
    let wire = SignedSdp::with_credentials(msg, Some("s3cret".into()), Some(nonce.clone()))
        .encode()
        .unwrap();
    let outcome = pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap();
    assert_eq!(
        outcome,
        DatagramOutcome::Applied {
            controller: "C2".into(),
            updated: 2,
            queried: 0,
        }
    );
    {
        let handle = pipeline.controllers.lookup("C2").unwrap();
        let controller = handle.lock();
        assert_eq!(
            controller.register("AAS").unwrap().value,
            FieldValue::Status(3),
            "last piece wins"
        );
        assert_eq!(controller.last_seq(), Some(2));
    }

    // The signed ACK echoes both pieces.
    let sent = sent_text(&pipeline.sink);
    assert_eq!(sent.len(), 1);
    let ack = SignedSdp::decode(&sent[0]).unwrap();
    assert!(ack.is_signed());
    assert!(ack.verify("s3cret", &nonce));
    let seqs: Vec<u64> = ack
        .message()
        .units()
        .filter_map(|u| u.time_base())
        .map(|tb| tb.seq)
        .collect();
    assert_eq!(seqs, vec![1, 2]);

    // 3. Replaying the datagram is rejected and triggers a fresh nonce.
    let err = pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .unwrap_err();
    assert!(matches!(err, ReceiverError::SequenceReplay { .. }));
    let sent = sent_text(&pipeline.sink);
    assert_eq!(sent.len(), 1);
    let reissue = SdpMessage::decode(&sent[0]).unwrap();
    let Some(FieldValue::Data(fresh_nonce)) = reissue.get("nonce").cloned() else {
        panic!("reissue packet carries a nonce");
    };
    assert_ne!(fresh_nonce, nonce);

    // 4. The device recovers by signing with the fresh nonce.
    let mut msg = SdpMessage::with_id("C2");
    msg.add("in", format!("1,{}", now + 2).as_str()).unwrap();
    msg.add("ABV", 9).unwrap();
    let wire = SignedSdp::with_credentials(msg, Some("s3cret".into()), Some(fresh_nonce))
        .encode()
        .unwrap();
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .expect("recovered under fresh nonce");
}

#[test]
fn one_bad_datagram_does_not_stop_the_pipeline() {
    let pipeline = pipeline();
    let now = unix_now() as u64;

    assert!(pipeline
        .receiver
        .on_datagram(&pipeline.host, b"garbage without colon\n")
        .is_err());
    assert!(pipeline
        .receiver
        .on_datagram(&pipeline.host, &[0xff, 0xfe, 0x00])
        .is_err());

    let wire = format!("id:C1\nin:1,{now}\nAAS:2\n");
    pipeline
        .receiver
        .on_datagram(&pipeline.host, wire.as_bytes())
        .expect("pipeline still accepts valid datagrams");
}
