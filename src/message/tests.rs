use std::collections::HashSet;

use chrono::NaiveDate;
use serde_json::json;

use super::dates;
use super::{DEFAULT_CHANNEL, IncomingMessage, Message, OutgoingMessage};
use crate::utils::error::MessageError;

fn sample_date() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 9)
        .unwrap()
        .and_hms_micro_opt(14, 5, 7, 123_456)
        .unwrap()
}

#[test]
fn test_incoming_defaults() {
    let message = IncomingMessage::new("+33600000000", "hello");
    assert_eq!(message.author, "+33600000000");
    assert_eq!(message.text(), "hello");
    assert_eq!(message.channel_name(), DEFAULT_CHANNEL);
    assert!(!message.id().is_empty());
}

#[test]
fn test_ids_are_unique() {
    let a = IncomingMessage::new("a", "same");
    let b = IncomingMessage::new("a", "same");
    assert_ne!(a.id(), b.id());
    assert_ne!(a, b);
}

#[test]
fn test_equality_uses_id_only() {
    let a = IncomingMessage::with_id("42", "alice", "one");
    let b = IncomingMessage::with_id("42", "bob", "two");
    assert_eq!(a, b);

    let set: HashSet<_> = [a, b].into_iter().collect();
    assert_eq!(set.len(), 1);

    let x = OutgoingMessage::with_id("7", "alice", "one");
    let y = OutgoingMessage::with_id("7", "carol", "three");
    assert_eq!(x, y);
}

#[test]
fn test_explicit_id_is_kept_through_the_wire() {
    let message = IncomingMessage::with_id("msg-1", "alice", "hello").on_channel("sms");
    assert_eq!(message.id(), "msg-1");
    assert_eq!(message.author, "alice");

    let rebuilt = IncomingMessage::from_wire(&message.to_wire().unwrap()).unwrap();
    assert_eq!(rebuilt.id(), "msg-1");
    assert_eq!(rebuilt.channel_name, "sms");

    let reply = OutgoingMessage::with_id("msg-2", "bob", "bye");
    assert_eq!(reply.id(), "msg-2");
    assert_eq!(reply.recipient, "bob");
}

#[test]
fn test_incoming_wire_round_trip_keeps_every_field() {
    let message = IncomingMessage::new("alice", "ping")
        .on_channel("sms")
        .received_at(sample_date());

    let wire = message.to_wire().unwrap();
    assert_eq!(wire["reception_date"], "2024-03-09 14:05:07.123456");
    assert_eq!(wire["channel_name"], "sms");

    let decoded = IncomingMessage::from_wire(&wire).unwrap();
    assert_eq!(decoded.id(), message.id());
    assert_eq!(decoded.author, "alice");
    assert_eq!(decoded.text, "ping");
    assert_eq!(decoded.channel_name, "sms");
    assert_eq!(decoded.reception_date, sample_date());
}

#[test]
fn test_outgoing_wire_nests_response_to() {
    let original = IncomingMessage::new("alice", "ping").received_at(sample_date());
    let response = original.create_response("pong").created_at(sample_date());

    let wire = response.to_wire().unwrap();
    assert_eq!(wire["recipient"], "alice");
    assert_eq!(wire["response_to"]["id"], original.id());
    assert_eq!(wire["response_to"]["text"], "ping");

    let decoded = OutgoingMessage::from_wire(&wire).unwrap();
    assert_eq!(decoded, response);
    assert_eq!(decoded.creation_date, sample_date());
    let nested = decoded.response_to.unwrap();
    assert_eq!(nested.id(), original.id());
    assert_eq!(nested.reception_date, sample_date());
}

#[test]
fn test_outgoing_without_response_serializes_null() {
    let message = OutgoingMessage::new("bob", "news");
    let wire = message.to_wire().unwrap();
    assert!(wire["response_to"].is_null());
    assert!(OutgoingMessage::from_wire(&wire).unwrap().response_to.is_none());
}

#[test]
fn test_create_response_addresses_author_on_same_channel() {
    let incoming = IncomingMessage::new("+15550001", "hi").on_channel("gsm");
    let response = incoming.create_response("hello back");

    assert_eq!(response.recipient, "+15550001");
    assert_eq!(response.text, "hello back");
    assert_eq!(response.channel_name, "gsm");
    assert_eq!(response.response_to.as_deref(), Some(&incoming));
    assert_ne!(response.id(), incoming.id());
}

#[test]
fn test_from_wire_fills_missing_fields() {
    let body = json!({"author": "alice", "text": "bare"});
    let message = IncomingMessage::from_wire(&body).unwrap();
    assert!(!message.id().is_empty());
    assert_eq!(message.channel_name, DEFAULT_CHANNEL);

    let body = json!({"recipient": "bob", "text": "bare"});
    let message = OutgoingMessage::from_wire(&body).unwrap();
    assert_eq!(message.channel_name, DEFAULT_CHANNEL);
    assert!(message.response_to.is_none());
}

#[test]
fn test_from_wire_rejects_malformed_body() {
    let err = IncomingMessage::from_wire(&json!({"text": "no author"})).unwrap_err();
    assert!(matches!(err, MessageError::Codec(_)));

    let err = IncomingMessage::from_wire(&json!({
        "author": "a",
        "text": "t",
        "reception_date": "yesterday"
    }))
    .unwrap_err();
    assert!(matches!(err, MessageError::Codec(_)));
}

#[test]
fn test_dates_accept_both_separators() {
    assert_eq!(dates::parse("2024-03-09 14:05:07.123456").unwrap(), sample_date());
    assert_eq!(dates::parse("2024-03-09T14:05:07.123456").unwrap(), sample_date());
    assert_eq!(dates::format(&sample_date()), "2024-03-09 14:05:07.123456");
    assert!(matches!(dates::parse("09/03/2024"), Err(MessageError::Date(_))));
}

#[test]
fn test_now_survives_wire_format() {
    let now = dates::now();
    assert_eq!(dates::parse(&dates::format(&now)).unwrap(), now);
}

#[test]
fn test_display() {
    let incoming = IncomingMessage::new("alice", "hi");
    assert_eq!(incoming.to_string(), "From alice: hi");
    assert_eq!(incoming.create_response("yo").to_string(), "To alice: yo");
}
