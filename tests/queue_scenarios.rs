//! End-to-end scenarios for the queue processor against a minimal
//! in-process SMTP stub: permanent rejection, transient retry, and
//! cross-worker lock exclusion.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mailrelay::queue::{QueueProcessor, QueueProcessorConfig};
use mailrelay::spool::Maildir;
use mailrelay::transport::smtp::{SmtpMailer, SmtpMailerConfig};
use tempfile::tempdir;

/// Spawns a single-connection SMTP stub on an ephemeral port. It speaks
/// just enough of the protocol to get through `EHLO`/`MAIL`/`RCPT`/`DATA`,
/// answers the end-of-DATA with `final_response`, then quits.
fn spawn_fake_smtp(final_response: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept stub connection");
        serve_one(stream, final_response);
    });

    (port, handle)
}

fn serve_one(stream: TcpStream, final_response: &str) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writer.write_all(b"220 stub.test ESMTP\r\n").unwrap();

    let mut line = String::new();
    reader.read_line(&mut line).unwrap(); // EHLO
    writer.write_all(b"250 stub.test\r\n").unwrap();

    line.clear();
    reader.read_line(&mut line).unwrap(); // MAIL FROM
    writer.write_all(b"250 sender ok\r\n").unwrap();

    line.clear();
    reader.read_line(&mut line).unwrap(); // RCPT TO
    writer.write_all(b"250 recipient ok\r\n").unwrap();

    line.clear();
    reader.read_line(&mut line).unwrap(); // DATA
    writer.write_all(b"354 go ahead\r\n").unwrap();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).unwrap();
        if n == 0 || line == ".\r\n" {
            break;
        }
    }
    writer.write_all(final_response.as_bytes()).unwrap();

    line.clear();
    let _ = reader.read_line(&mut line); // QUIT
    let _ = writer.write_all(b"221 bye\r\n");
}

fn mailer_for(port: u16) -> SmtpMailer {
    SmtpMailer::new(SmtpMailerConfig {
        hostname: "127.0.0.1".into(),
        port,
        timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    })
}

fn seed(maildir: &Maildir, sender: &str, recipient: &str, body: &str) -> std::path::PathBuf {
    let mut writer = maildir.new_message().unwrap();
    writer
        .write(format!("X-Zope-From: {sender}\nX-Zope-To: {recipient}\n{body}").as_bytes())
        .unwrap();
    writer.commit().unwrap();
    maildir.iterate().unwrap().into_iter().next().unwrap()
}

#[test]
fn permanent_failure_quarantines_the_message() {
    let (port, server) = spawn_fake_smtp("550 mailbox unavailable\r\n");
    let dir = tempdir().unwrap();
    let maildir = Maildir::open(dir.path(), true).unwrap();
    let file = seed(&maildir, "a@example.com", "b@example.com", "Subject: hi\n\nbody\n");

    let mut processor = QueueProcessor::new(
        maildir,
        mailer_for(port),
        QueueProcessorConfig::default(),
    );
    processor.tick();
    server.join().unwrap();

    assert!(!file.exists());
    let rejected = dir
        .path()
        .join("new")
        .join(format!(".rejected-{}", file.file_name().unwrap().to_string_lossy()));
    assert!(rejected.exists());
    let lock = dir
        .path()
        .join("new")
        .join(format!(".sending-{}", file.file_name().unwrap().to_string_lossy()));
    assert!(!lock.exists());
}

#[test]
fn transient_failure_leaves_message_for_retry() {
    let (port, server) = spawn_fake_smtp("451 try again later\r\n");
    let dir = tempdir().unwrap();
    let maildir = Maildir::open(dir.path(), true).unwrap();
    let file = seed(&maildir, "a@example.com", "b@example.com", "Subject: hi\n\nbody\n");

    let mut processor = QueueProcessor::new(
        maildir,
        mailer_for(port),
        QueueProcessorConfig {
            retry_interval: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            ..Default::default()
        },
    );
    processor.tick();
    server.join().unwrap();

    assert!(file.exists(), "message must survive a transient failure");
    let rejected = dir
        .path()
        .join("new")
        .join(format!(".rejected-{}", file.file_name().unwrap().to_string_lossy()));
    assert!(!rejected.exists());
    let lock = dir
        .path()
        .join("new")
        .join(format!(".sending-{}", file.file_name().unwrap().to_string_lossy()));
    assert!(!lock.exists(), "the lock must be released for the next tick to retry");
}

#[test]
fn successful_delivery_removes_message_and_lock() {
    let (port, server) = spawn_fake_smtp("250 accepted\r\n");
    let dir = tempdir().unwrap();
    let maildir = Maildir::open(dir.path(), true).unwrap();
    let file = seed(&maildir, "a@example.com", "b@example.com", "Subject: hi\n\nbody\n");

    let mut processor = QueueProcessor::new(
        maildir,
        mailer_for(port),
        QueueProcessorConfig::default(),
    );
    processor.tick();
    server.join().unwrap();

    assert!(!file.exists());
    let lock = dir
        .path()
        .join("new")
        .join(format!(".sending-{}", file.file_name().unwrap().to_string_lossy()));
    assert!(!lock.exists());
}

#[test]
fn fresh_lock_blocks_a_second_worker_until_it_ages_out() {
    let dir = tempdir().unwrap();
    let maildir = Maildir::open(dir.path(), true).unwrap();
    let file = seed(&maildir, "a@example.com", "b@example.com", "Subject: hi\n\nbody\n");
    let lock = dir
        .path()
        .join("new")
        .join(format!(".sending-{}", file.file_name().unwrap().to_string_lossy()));
    std::fs::hard_link(&file, &lock).unwrap();

    // A mailer pointed at a port nobody listens on: if the processor
    // attempted to send here it would block/err loudly rather than skip
    // quietly, so a passing assertion proves the lock was respected.
    let mut processor = QueueProcessor::new(
        maildir,
        mailer_for(1),
        QueueProcessorConfig::default(),
    );
    processor.tick();

    assert!(file.exists());
    assert!(lock.exists());

    // Age the lock past max_send_time and point at a real stub: now the
    // file must be reclaimed and delivered.
    let old = filetime::FileTime::from_unix_time(0, 0);
    filetime::set_file_mtime(&lock, old).unwrap();

    let (port, server) = spawn_fake_smtp("250 accepted\r\n");
    let mut processor = QueueProcessor::new(
        Maildir::open(dir.path(), false).unwrap(),
        mailer_for(port),
        QueueProcessorConfig {
            max_send_time: Duration::from_secs(0),
            ..Default::default()
        },
    );
    processor.tick();
    server.join().unwrap();

    assert!(!file.exists());
    assert!(!lock.exists());
}
