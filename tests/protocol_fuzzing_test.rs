mod common;

use std::sync::Arc;

use bytes::BytesMut;
use common::*;
use pgtde::protocol::DecoderState;
use pgtde::security::{AuditConfig, SecurityAuditLogger};
use pgtde::session::{FilterSettings, TdeFilter};
use postgres_protocol::message::frontend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_message(rng: &mut StdRng) -> Vec<u8> {
    let body_len = rng.random_range(0..64usize);
    let mut message = vec![0u8; 5 + body_len];
    message[0] = *b"QPBEDSCHXdcfp".get(rng.random_range(0..13)).unwrap_or(&b'Q');
    let declared = if rng.random_bool(0.8) {
        (body_len + 4) as u32
    } else {
        rng.random_range(0..200u32)
    };
    message[1..5].copy_from_slice(&declared.to_be_bytes());
    rng.fill(&mut message[5..]);
    message
}

// Arbitrary frontend traffic must never panic the filter, and once the stream is out of sync
// every byte is relayed untouched.
#[test]
fn test_fuzz_frontend_messages() {
    let mut rng = StdRng::seed_from_u64(0x7d3e);

    for _ in 0..200 {
        let mut filter = connected_filter();
        for _ in 0..20 {
            let message = random_message(&mut rng);
            let was_out_of_sync = filter.state() == DecoderState::OutOfSync;
            let output = filter.on_frontend_data(&message);
            if was_out_of_sync {
                assert_eq!(output.to_upstream.as_ref(), message.as_slice());
                assert!(output.to_downstream.is_empty());
            }
        }
    }
}

#[test]
fn test_fuzz_startup_packets() {
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..500 {
        let mut filter = connected_filter_without_startup();
        let len = rng.random_range(0..48usize);
        let mut packet = vec![0u8; len];
        rng.fill(&mut packet[..]);
        if len >= 4 && rng.random_bool(0.5) {
            packet[0..4].copy_from_slice(&(len as u32).to_be_bytes());
        }
        let output = filter.on_frontend_data(&packet);
        assert!(output.to_downstream.is_empty());
    }
}

#[test]
fn test_byte_at_a_time_matches_single_read() {
    let mut conversation = BytesMut::new();
    conversation.extend_from_slice(&query("SELECT c.id FROM cities c WHERE c.name = 'Ufa'"));
    conversation.extend_from_slice(&query("SELECT 1"));
    frontend::sync(&mut conversation);

    let mut whole = connected_filter();
    let expected = whole.on_frontend_data(&conversation).to_upstream;

    let mut split = connected_filter();
    let mut received = Vec::new();
    for byte in conversation.iter() {
        received.extend_from_slice(&split.on_frontend_data(&[*byte]).to_upstream);
    }
    assert_eq!(received, expected.to_vec());
    assert_eq!(tags(&received), "QQS");
}

#[test]
fn test_oversized_message_is_a_reported_violation() {
    let audit = Arc::new(SecurityAuditLogger::with_config(AuditConfig {
        json_format: false,
        ..Default::default()
    }));
    let settings = FilterSettings {
        max_message_size: 1024,
        ..Default::default()
    };
    let mut filter = TdeFilter::new(settings, &context(), audit.clone(), "fuzz", PlainTransport);
    let mut startup = BytesMut::new();
    frontend::startup_message([("user", "app")], &mut startup).unwrap();
    filter.on_frontend_data(&startup);

    let mut oversized = vec![b'Q'];
    oversized.extend_from_slice(&4096u32.to_be_bytes());
    oversized.extend_from_slice(b"SELECT 1");
    let output = filter.on_frontend_data(&oversized);
    assert_eq!(filter.state(), DecoderState::OutOfSync);
    assert_eq!(output.to_upstream.as_ref(), oversized.as_slice());

    let stats = audit.get_stats();
    assert_eq!(stats.events_by_type.get("PROTOCOL_VIOLATION"), Some(&1));
}

fn connected_filter_without_startup() -> TdeFilter<PlainTransport> {
    TdeFilter::new(
        FilterSettings::default(),
        &context(),
        Arc::new(SecurityAuditLogger::disabled()),
        "fuzz",
        PlainTransport,
    )
}
