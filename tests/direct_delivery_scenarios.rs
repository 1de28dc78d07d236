//! End-to-end scenarios for `DirectDelivery` against a minimal in-process
//! SMTP stub: commit, abort, and savepoint rollback.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mailrelay::delivery::DirectDelivery;
use mailrelay::transaction;
use mailrelay::transport::smtp::{SmtpMailer, SmtpMailerConfig};

/// One accepted SMTP conversation's recorded envelope and DATA payload.
struct Delivered {
    from: String,
    to: Vec<String>,
    body: String,
}

/// Speaks EHLO/MAIL/RCPT*/DATA/QUIT on `stream` and returns what it saw, or
/// `None` if the connection was dropped before a `MAIL FROM` ever arrived
/// (the fate of a connection that `vote` opened but the mailer's own
/// connection-reuse bookkeeping never actually sent over).
fn serve_one(stream: TcpStream) -> Option<Delivered> {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writer.write_all(b"220 stub.test ESMTP\r\n").unwrap();

    let mut line = String::new();
    if reader.read_line(&mut line).unwrap() == 0 {
        return None;
    }
    writer.write_all(b"250 stub.test\r\n").unwrap(); // EHLO

    line.clear();
    if reader.read_line(&mut line).unwrap() == 0 {
        return None;
    }
    let from = line
        .trim_start_matches("MAIL FROM:<")
        .trim_end()
        .trim_end_matches('>')
        .to_string();
    writer.write_all(b"250 sender ok\r\n").unwrap();

    let mut to = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).unwrap() == 0 {
            return None;
        }
        if line.to_ascii_uppercase().starts_with("RCPT TO:") {
            to.push(
                line.trim_start_matches("RCPT TO:<")
                    .trim_end()
                    .trim_end_matches('>')
                    .to_string(),
            );
            writer.write_all(b"250 recipient ok\r\n").unwrap();
        } else {
            break; // DATA
        }
    }
    writer.write_all(b"354 go ahead\r\n").unwrap();

    let mut body = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).unwrap();
        if n == 0 || line == ".\r\n" {
            break;
        }
        body.push_str(&line);
    }
    writer.write_all(b"250 accepted\r\n").unwrap();

    line.clear();
    let _ = reader.read_line(&mut line); // QUIT
    let _ = writer.write_all(b"221 bye\r\n");

    Some(Delivered { from, to, body })
}

/// Accepts connections until `expected` of them complete a full delivery,
/// then returns. A shared `DirectDelivery` can legitimately open more TCP
/// connections than messages sent within one transaction (each `vote`
/// pre-flights a connection against the one shared mailer), so connections
/// that never reach `MAIL FROM` are silently discarded rather than counted.
fn spawn_fake_smtp_collecting(expected: usize) -> (u16, JoinHandle<Vec<Delivered>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let mut collected = Vec::new();
        while collected.len() < expected {
            let (stream, _) = listener.accept().expect("accept stub connection");
            if let Some(delivered) = serve_one(stream) {
                collected.push(delivered);
            }
        }
        collected
    });

    (port, handle)
}

fn mailer_for(port: u16) -> SmtpMailer {
    SmtpMailer::new(SmtpMailerConfig {
        hostname: "127.0.0.1".into(),
        port,
        timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    })
}

#[test]
fn direct_send_is_invisible_until_commit() {
    let (port, server) = spawn_fake_smtp_collecting(1);
    let delivery = DirectDelivery::new(mailer_for(port));

    let id = delivery
        .send(
            Some("jim@example.com"),
            &["a@example.com".to_string(), "b@example.com".to_string()],
            "Subject: hi\n\nbody\n".to_string(),
        )
        .unwrap();
    assert!(!id.is_empty());

    transaction::commit().unwrap();
    let delivered = server.join().unwrap();

    assert_eq!(delivered.len(), 1);
    let msg = &delivered[0];
    assert_eq!(msg.from, "jim@example.com");
    assert_eq!(msg.to, vec!["a@example.com", "b@example.com"]);
    assert!(msg.body.starts_with(&format!("Message-Id: <{id}>")));
    assert!(msg.body.contains("body\n"));
}

#[test]
fn direct_send_aborted_never_reaches_the_wire() {
    // Nothing is listening on this port: if the aborted transaction tried
    // to send anyway, connecting would fail loudly rather than quietly
    // doing nothing.
    let delivery = DirectDelivery::new(mailer_for(1));

    delivery
        .send(
            Some("jim@example.com"),
            &["a@example.com".to_string()],
            "Subject: hi\n\nbody\n".to_string(),
        )
        .unwrap();

    transaction::abort();
}

#[test]
fn savepoint_rollback_drops_only_the_message_sent_after_it() {
    let (port, server) = spawn_fake_smtp_collecting(2);
    let delivery = DirectDelivery::new(mailer_for(port));

    delivery
        .send(
            Some("a@example.com"),
            &["dest@example.com".to_string()],
            "Subject: first\n\nmessage A\n".to_string(),
        )
        .unwrap();

    let sp = transaction::savepoint();

    delivery
        .send(
            Some("a@example.com"),
            &["dest@example.com".to_string()],
            "Subject: second\n\nmessage B\n".to_string(),
        )
        .unwrap();

    sp.rollback();

    delivery
        .send(
            Some("a@example.com"),
            &["dest@example.com".to_string()],
            "Subject: third\n\nmessage C\n".to_string(),
        )
        .unwrap();

    transaction::commit().unwrap();
    let delivered = server.join().unwrap();

    assert_eq!(delivered.len(), 2);
    let bodies: Vec<&str> = delivered.iter().map(|d| d.body.as_str()).collect();
    assert!(bodies.iter().any(|b| b.contains("message A\n")));
    assert!(bodies.iter().any(|b| b.contains("message C\n")));
    assert!(!bodies.iter().any(|b| b.contains("message B\n")));
}
