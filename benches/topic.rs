//! Benchmarks for topic validation and filter matching.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use r0n_mqtt::topic::{TopicFilter, TopicName};
use std::hint::black_box;

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic/matching");

    let cases = [
        ("exact", "home/livingroom/temperature", "home/livingroom/temperature"),
        ("single_wildcard", "home/+/temperature", "home/livingroom/temperature"),
        ("multi_wildcard", "home/#", "home/livingroom/temperature/celsius"),
        ("parent_level", "home/#", "home"),
        ("no_match", "home/kitchen/temperature", "home/livingroom/temperature"),
        ("deep", "a/+/c/+/e/+/g", "a/b/c/d/e/f/g"),
        ("system_topic", "#", "$SYS/broker/uptime"),
    ];
    for (name, filter, topic) in cases {
        let filter = TopicFilter::new(filter).unwrap();
        let topic = TopicName::new(topic).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(filter.matches(&topic)));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

fn bench_topic_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic/construction");

    group.bench_function("topic_name_new", |b| {
        b.iter(|| black_box(TopicName::new("home/livingroom/temperature").unwrap()));
    });

    group.bench_function("topic_filter_new", |b| {
        b.iter(|| black_box(TopicFilter::new("sensor/+/data/+/raw/#").unwrap()));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Routing: every filter against every topic
// ---------------------------------------------------------------------------

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic/routing");

    let topics: Vec<TopicName> = [
        "home/livingroom/temperature",
        "sensor/gps/location/lat",
        "device/thermostat/status",
        "data/raw/csv/stream",
    ]
    .into_iter()
    .map(|t| TopicName::new(t).unwrap())
    .collect();

    for subscriptions in [10, 100, 1000] {
        let filters: Vec<TopicFilter> = (0..subscriptions)
            .map(|i| match i % 4 {
                0 => TopicFilter::new(format!("home/{i}/+")).unwrap(),
                1 => TopicFilter::new("sensor/#").unwrap(),
                2 => TopicFilter::new(format!("device/+/{i}")).unwrap(),
                _ => TopicFilter::new("data/raw/#").unwrap(),
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::new("filters", subscriptions),
            &filters,
            |b, filters| {
                b.iter(|| {
                    let mut matched = 0_usize;
                    for topic in &topics {
                        matched += filters.iter().filter(|f| f.matches(topic)).count();
                    }
                    black_box(matched)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_topic_matching,
    bench_topic_construction,
    bench_routing
);
criterion_main!(benches);
