use criterion::{Criterion, black_box, criterion_group, criterion_main};

use mazurka_http::router::{Route, compile_pattern};

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_token_pattern", |b| {
        b.iter(|| compile_pattern(black_box("^/api/v2/users/{id=[0-9]+}/posts/{slug}$")).unwrap())
    });
}

fn bench_match(c: &mut Criterion) {
    let mut route = Route::new("users", "^/api/v2/users/{id=[0-9]+}/posts/{slug}$");
    route.finalize().unwrap();
    let regex = route.regex.clone().unwrap();

    c.bench_function("match_token_pattern", |b| {
        b.iter(|| {
            let caps = regex.captures(black_box("/api/v2/users/12345/posts/launch-notes"));
            black_box(caps.is_some())
        })
    });
    c.bench_function("reject_token_pattern", |b| {
        b.iter(|| {
            let caps = regex.captures(black_box("/api/v2/users/abc/posts/launch-notes"));
            black_box(caps.is_none())
        })
    });
}

criterion_group!(benches, bench_compile, bench_match);
criterion_main!(benches);
