//! ---
//! sdc_section: "02-protocol-grammar"
//! sdc_subsection: "integration-test"
//! sdc_type: "source"
//! sdc_scope: "test"
//! sdc_description: "Wire-format corpus for the SDP codec."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! Datagram corpus exercised through the public codec surface.

use sdc_proto::{DecodeError, FieldValue, Scalar, SdpMessage, SignedSdp};

#[test]
fn representative_device_datagram() {
    let wire = "id:abc123\nAAS:1\nABV:2\nACV:3.5\nADV:4\nAEV:5.5\nAFV:abc\nAGW:4\nAHW:5 6 75\nAIS:?\nAJV:?\nAKW:?\niq:?\nip:10.0.0.10\nALF:4000D3349FEBBEAE\nTOV:4000D3349FEBBEAE\nAMW:8 null 9\n";
    let msg = SdpMessage::decode(wire).expect("corpus datagram decodes");

    assert_eq!(msg.id(), Some("abc123"));
    assert_eq!(msg.get("AAS"), Some(&FieldValue::Status(1)));
    assert_eq!(
        msg.get("ABV"),
        Some(&FieldValue::Value(Scalar::Text("2".into())))
    );
    assert_eq!(
        msg.get("AEV"),
        Some(&FieldValue::Value(Scalar::Text("5.5".into())))
    );
    assert_eq!(msg.get("AGW"), Some(&FieldValue::ValueList(vec![Some(4)])));
    assert_eq!(
        msg.get("AMW"),
        Some(&FieldValue::ValueList(vec![Some(8), None, Some(9)]))
    );
    assert_eq!(msg.get("AIS"), Some(&FieldValue::Query));
    assert_eq!(msg.get("AJV"), Some(&FieldValue::Query));
    assert_eq!(msg.get("AKW"), Some(&FieldValue::Query));
    assert_eq!(msg.get("iq"), Some(&FieldValue::Query));
    assert_eq!(
        msg.get("ip"),
        Some(&FieldValue::Data("10.0.0.10".into()))
    );
    assert_eq!(
        msg.get("TOV"),
        Some(&FieldValue::FloatHex("4000D3349FEBBEAE".into()))
    );

    // Encoding the decoded message reproduces every line.
    let mut lines: Vec<&str> = wire.trim_end().split('\n').collect();
    let encoded = msg.encode().unwrap();
    let mut encoded_lines: Vec<&str> = encoded.trim_end().split('\n').collect();
    lines.sort_unstable();
    encoded_lines.sort_unstable();
    assert_eq!(lines, encoded_lines);
}

#[test]
fn multipart_batch_survives_the_wire() {
    let mut parent = SdpMessage::with_id("plant-1");
    let mut first = SdpMessage::new();
    first.add("in", "41,1700000100").unwrap();
    first.add("PWV", 230).unwrap();
    parent.push_piece(first).unwrap();
    let mut second = SdpMessage::new();
    second.add("in", "42,1700000160.5").unwrap();
    second.add("PWV", 231).unwrap();
    second.add("PWS", 1).unwrap();
    parent.push_piece(second).unwrap();

    let wire = parent.encode().unwrap();
    let decoded = SdpMessage::decode(&wire).unwrap();
    assert_eq!(decoded.pieces().len(), 2);
    assert_eq!(decoded.encode().unwrap(), wire);

    let bases: Vec<(u64, f64)> = decoded
        .units()
        .filter_map(|u| u.time_base())
        .map(|tb| (tb.seq, tb.timestamp.unwrap()))
        .collect();
    assert_eq!(bases, vec![(41, 1700000100.0), (42, 1700000160.5)]);
}

#[test]
fn signed_datagram_is_decoded_then_verified() {
    let mut msg = SdpMessage::with_id("plant-1");
    msg.add("in", "7,1700000000").unwrap();
    msg.add("AAS", 2).unwrap();
    let wire = SignedSdp::with_credentials(msg, Some("s3cret".into()), Some("n0nce".into()))
        .encode()
        .unwrap();

    // An unsigned-grammar decode refuses the reserved sha256 field.
    assert!(matches!(
        SdpMessage::decode(&wire),
        Err(DecodeError::Field(_))
    ));

    // The signed decoder captures it for deferred verification.
    let signed = SignedSdp::decode(&wire).unwrap();
    assert!(signed.is_signed());
    assert!(signed.verify("s3cret", "n0nce"));
    assert_eq!(signed.message().get("AAS"), Some(&FieldValue::Status(2)));
}
