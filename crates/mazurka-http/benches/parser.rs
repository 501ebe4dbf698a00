use criterion::{Criterion, black_box, criterion_group, criterion_main};

use mazurka_http::limits::Limits;
use mazurka_http::rx::Rx;

const SIMPLE: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";

const HEAVY: &[u8] = b"POST /api/items?page=2&sort=desc HTTP/1.1\r\n\
Host: api.example.com\r\n\
User-Agent: bench/1.0\r\n\
Accept: application/json\r\n\
Accept-Encoding: gzip, br\r\n\
Accept-Language: en-US,en;q=0.9\r\n\
Authorization: Bearer 0123456789abcdef\r\n\
Content-Type: application/json\r\n\
Content-Length: 0\r\n\
Cookie: a=1; b=2; c=3\r\n\
X-Request-Id: 7f3b9c\r\n\
Connection: keep-alive\r\n\r\n";

fn bench_parse(c: &mut Criterion) {
    let limits = Limits::default();
    c.bench_function("parse_simple_request", |b| {
        b.iter(|| {
            let mut rx = Rx::new();
            rx.parse_headers(black_box(SIMPLE), true, &limits).unwrap();
            black_box(rx.path_info.len())
        })
    });
    c.bench_function("parse_heavy_request", |b| {
        b.iter(|| {
            let mut rx = Rx::new();
            rx.parse_headers(black_box(HEAVY), true, &limits).unwrap();
            black_box(rx.headers.len())
        })
    });
}

fn bench_chunked(c: &mut Criterion) {
    let limits = Limits::default();
    let mut body = Vec::new();
    for _ in 0..64 {
        body.extend_from_slice(b"100\r\n");
        body.extend_from_slice(&[b'x'; 256]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"0\r\n\r\n");

    c.bench_function("decode_chunked_16k", |b| {
        b.iter(|| {
            let mut rx = Rx::new();
            rx.parse_headers(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                true,
                &limits,
            )
            .unwrap();
            let mut out = Vec::with_capacity(16 * 1024);
            rx.decode_content(black_box(&body), &mut out).unwrap();
            black_box(out.len())
        })
    });
}

criterion_group!(benches, bench_parse, bench_chunked);
criterion_main!(benches);
