use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mailrelay::transport::smtp::Response;

// Parsing the EHLO greeting is the hottest SMTP-side loop: it runs once per
// connection and its multiline grammar is the most intricate part of
// `response.rs`. Benchmarked directly (no live socket) so this runs
// anywhere.
const EHLO_RESPONSE: &str = "250-mail.example.com\r\n\
250-PIPELINING\r\n\
250-SIZE 35882577\r\n\
250-ETRN\r\n\
250-AUTH PLAIN LOGIN CRAM-MD5\r\n\
250-ENHANCEDSTATUSCODES\r\n\
250-8BITMIME\r\n\
250 STARTTLS\r\n";

const SIMPLE_RESPONSE: &str = "250 OK\r\n";

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("parse single-line response", |b| {
        b.iter(|| black_box(SIMPLE_RESPONSE).parse::<Response>().unwrap())
    });
    c.bench_function("parse multiline EHLO response", |b| {
        b.iter(|| black_box(EHLO_RESPONSE).parse::<Response>().unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
