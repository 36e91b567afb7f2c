use std::sync::Arc;
use std::thread;
use std::time::Duration;

use feedwire::core::wire::{encode_count, Command, EndSelector, Message};
use feedwire::core::{End, Entry, Error, ManualClock, RequesterConfig, ResponderConfig};
use feedwire::ipc::{Endpoint, RequestSocket, Requester, Responder, UNKNOWN_TOPIC};

fn ipc_endpoint(dir: &tempfile::TempDir, name: &str) -> String {
    format!("ipc://{}", dir.path().join(name).display())
}

fn serve(endpoint: &str, clock: ManualClock) -> feedwire::Result<Responder<ManualClock>> {
    Responder::bind_with_clock("producer", endpoint, Duration::from_millis(20), clock)
}

fn payloads(entries: &[Entry]) -> Vec<&[u8]> {
    entries.iter().map(|entry| &*entry.payload).collect()
}

#[test]
fn old_entries_are_evicted_before_remote_reads() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "feeds/camera.sock");
    let clock = ManualClock::new(0, 0);
    let responder = serve(&endpoint, clock.clone())?;
    responder.add_topic("frame", 1.0)?;

    responder.put("frame", &b"A"[..])?;
    clock.advance_secs(0.5);
    responder.put("frame", &b"B"[..])?;
    clock.advance_secs(0.8);
    responder.put("frame", &b"C"[..])?;

    let mut requester = Requester::connect("consumer", &endpoint)?;
    let entries = requester.peek("frame", End::Earliest, -1)?;
    assert_eq!(payloads(&entries), vec![&b"B"[..], &b"C"[..]]);
    assert!((entries[0].timestamp - 0.5).abs() < 1e-9);
    assert!((entries[1].timestamp - 1.3).abs() < 1e-9);
    Ok(())
}

#[test]
fn pop_from_both_ends_drains_the_buffer() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "pop.sock");
    let clock = ManualClock::new(0, 0);
    let responder = serve(&endpoint, clock.clone())?;
    responder.add_topic("frame", 100.0)?;
    for payload in ["A", "B", "C", "D"] {
        responder.put("frame", payload.as_bytes())?;
        clock.advance_secs(0.1);
    }

    let mut requester = Requester::connect("consumer", &endpoint)?;
    let latest = requester.pop("frame", End::Latest, 2)?;
    assert_eq!(payloads(&latest), vec![&b"C"[..], &b"D"[..]]);
    assert_eq!(payloads(requester.last_retrieved()), vec![&b"C"[..], &b"D"[..]]);
    assert_eq!(responder.topic_status()?["frame"], 2);

    let rest = requester.pop("frame", End::Earliest, 10)?;
    assert_eq!(payloads(&rest), vec![&b"A"[..], &b"B"[..]]);
    assert_eq!(responder.topic_status()?["frame"], 0);
    assert!(requester.peek("frame", End::Latest, -1)?.is_empty());
    Ok(())
}

#[test]
fn unknown_topic_reads_as_empty_batch() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "ghost.sock");
    let _responder = serve(&endpoint, ManualClock::new(0, 0))?;

    let mut requester = Requester::connect("consumer", &endpoint)?;
    assert!(requester.peek("ghost", End::Latest, 1)?.is_empty());
    assert!(requester.pop("ghost", End::Earliest, -1)?.is_empty());
    Ok(())
}

#[test]
fn short_count_is_answered_with_error_text() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "short.sock");
    let responder = serve(&endpoint, ManualClock::new(0, 0))?;
    responder.add_topic("frame", 1.0)?;

    let mut socket = RequestSocket::connect(&Endpoint::parse(&endpoint)?);
    let request = Message::flat("frame", Command::PopData, EndSelector::Latest, 0.0, vec![1u8, 0, 0]);
    let reply = Message::decode(&socket.request(&request.encode()?)?)?;
    assert_eq!(reply.command, Command::Error);
    assert_eq!(reply.topic, "frame");
    assert!(reply.text().contains("4 bytes"), "{}", reply.text());

    let garbage = Message::decode(&socket.request(&[3, b'a'])?)?;
    assert_eq!(garbage.command, Command::Error);
    assert_eq!(garbage.topic, UNKNOWN_TOPIC);

    // The connection stays usable after errors.
    let request = Message::flat("frame", Command::PeekData, EndSelector::Latest, 0.0, encode_count(1).to_vec());
    let reply = Message::decode(&socket.request(&request.encode()?)?)?;
    assert_eq!(reply.command, Command::PeekData);
    assert!(reply.entries()?.is_empty());
    Ok(())
}

#[test]
fn request_with_data_uses_installed_handler() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "handler.sock");
    let responder = serve(&endpoint, ManualClock::new(0, 0))?;
    let mut requester = Requester::connect("consumer", &endpoint)?;

    match requester.request_with_data("rpc", b"ping") {
        Err(Error::RemoteError(text)) => assert!(text.contains("handler not configured"), "{text}"),
        other => panic!("expected remote error, got {other:?}"),
    }

    responder.set_handler(|payload: &[u8]| {
        let mut reply = b"pong:".to_vec();
        reply.extend_from_slice(payload);
        reply
    })?;
    let reply = requester.request_with_data("rpc", b"ping")?;
    assert_eq!(&*reply, b"pong:ping");
    Ok(())
}

#[test]
fn concurrent_requesters_are_all_served() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "many.sock");
    let responder = Arc::new(serve(&endpoint, ManualClock::new(0, 0))?);
    responder.add_topic("frame", 100.0)?;
    for i in 0..50u8 {
        responder.put("frame", vec![i])?;
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let endpoint = endpoint.clone();
            thread::spawn(move || -> feedwire::Result<usize> {
                let mut requester = Requester::connect("consumer", &endpoint)?;
                let mut total = 0;
                for _ in 0..10 {
                    total += requester.peek("frame", End::Latest, 5)?.len();
                }
                Ok(total)
            })
        })
        .collect();

    // Producer keeps writing while the requesters read.
    for i in 50..100u8 {
        responder.put("frame", vec![i])?;
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap()?, 50);
    }
    assert_eq!(responder.topic_status()?["frame"], 100);
    Ok(())
}

#[test]
fn requester_reconnects_after_responder_restart() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "restart.sock");
    let mut requester = Requester::connect("consumer", &endpoint)?;
    requester.set_timeout(Some(Duration::from_secs(2)))?;

    let first = serve(&endpoint, ManualClock::new(0, 0))?;
    first.add_topic("frame", 1.0)?;
    first.put("frame", &b"A"[..])?;
    assert_eq!(requester.peek("frame", End::Latest, 1)?.len(), 1);
    drop(first);

    assert!(requester.peek("frame", End::Latest, 1).is_err());

    let second = serve(&endpoint, ManualClock::new(0, 0))?;
    second.add_topic("frame", 1.0)?;
    assert!(requester.peek("frame", End::Latest, 1)?.is_empty());
    Ok(())
}

#[test]
fn configs_build_working_endpoints() -> feedwire::Result<()> {
    let dir = tempfile::tempdir()?;
    let endpoint = ipc_endpoint(&dir, "configured.sock");
    let mut responder_config = ResponderConfig::new(endpoint.as_str()).with_topic("frame", 2.0);
    responder_config.poll_timeout_ms = 20;
    let responder = Responder::from_config(&responder_config)?;
    assert_eq!(responder.topic_names()?, vec!["frame".to_string()]);
    responder.put("frame", &b"A"[..])?;

    let requester_config =
        RequesterConfig::from_json_str(&format!(r#"{{"endpoint": "{endpoint}", "timeout_ms": 1000}}"#))?;
    let mut requester = Requester::from_config(&requester_config)?;
    assert_eq!(payloads(&requester.peek("frame", End::Latest, 1)?), vec![&b"A"[..]]);
    Ok(())
}
