use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use oblivion::dns::{DnsFilter, DnsResolver, DomainList, SystemResolver};

fn filter(domains: usize) -> DnsFilter {
    let mut list = DomainList::new("bench");
    for i in 0..domains {
        list.insert_domain(&format!("ads{}.tracker{}.com", i, i % 97));
    }
    list.add_pattern(r"^telemetry\d*\.").unwrap();
    list.add_pattern(r"(?:^|\.)doubleclick\.net$").unwrap();

    let filter = DnsFilter::new(vec![Arc::new(SystemResolver) as Arc<dyn DnsResolver>]);
    filter.add_blocklist(list);
    filter.add_whitelist_domain("good.example.com");
    filter
}

fn bench_check(c: &mut Criterion) {
    let filter = filter(100_000);

    c.bench_function("dns_check_exact_hit", |b| {
        b.iter(|| black_box(filter.check("ads500.tracker15.com")))
    });
    c.bench_function("dns_check_pattern_hit", |b| {
        b.iter(|| black_box(filter.check("stats.g.doubleclick.net")))
    });
    c.bench_function("dns_check_whitelist", |b| {
        b.iter(|| black_box(filter.check("cdn.good.example.com")))
    });
    c.bench_function("dns_check_miss", |b| {
        b.iter(|| black_box(filter.check("www.rust-lang.org")))
    });
}

fn bench_load_text(c: &mut Criterion) {
    let text: String = (0..10_000)
        .map(|i| format!("0.0.0.0 host{}.ads.example\n", i))
        .collect();
    c.bench_function("blocklist_load_10k_hosts", |b| {
        b.iter(|| {
            let mut list = DomainList::new("hosts");
            list.load_text(black_box(&text));
            black_box(list.domain_count())
        })
    });
}

criterion_group!(benches, bench_check, bench_load_text);
criterion_main!(benches);
