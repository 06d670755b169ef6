//! Criterion benchmarks for protocol matching and stage resolution.
//!
//! Matching runs on every study load and every display set change, so it must
//! stay cheap for large protocol libraries and studies with many series.
//!
//! Run with:
//! ```bash
//! cargo bench --package hp-core --bench matcher_bench
//! ```

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hp_core::{
    match_selectors, resolve_stage, Constraint, DisplaySet, DisplaySetRef, DisplaySetSelector,
    GridLayout, GridState, Protocol, ProtocolCallbacks, ProtocolLibrary, ProtocolMatcher, Rule,
    SlotSpec, Stage, StageStatus, ViewportOptions, MODALITY,
};

// ── Fixture builders ──────────────────────────────────────────────────────────

/// A study of `n` series alternating CT and MR with growing frame counts.
fn build_study(n: usize) -> Vec<DisplaySet> {
    (0..n)
        .map(|i| {
            DisplaySet::new(format!("ds-{i}"), "1.2.3")
                .with(MODALITY, if i % 2 == 0 { "CT" } else { "MR" })
                .with("numImageFrames", (i as i64 + 1) * 10)
                .with("SeriesDescription", format!("SERIES {i}"))
        })
        .collect()
}

/// A 2×2 protocol whose four slots each take a different ranked CT match.
fn build_protocol(id: &str, modality: &str) -> Protocol {
    let mut selectors = BTreeMap::new();
    selectors.insert(
        "primary".to_string(),
        DisplaySetSelector {
            series_matching_rules: vec![
                Rule::new(MODALITY, Constraint::Equals(modality.into())).required(),
                Rule::new("numImageFrames", Constraint::GreaterThan(50.0)).weighted(5),
                Rule::new("SeriesDescription", Constraint::Contains("1".into())),
            ],
        },
    );

    let slots = (0..4)
        .map(|i| SlotSpec {
            viewport_id: Some(format!("vp-{i}")),
            primary: i == 0,
            viewport_options: ViewportOptions::default(),
            display_set_refs: vec![DisplaySetRef {
                match_index: i,
                ..DisplaySetRef::new("primary")
            }],
        })
        .collect();

    Protocol {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        matching_rules: vec![
            Rule::new("ModalitiesInStudy", Constraint::Contains(modality.into())).required(),
            Rule::new("NumberOfDisplaySets", Constraint::GreaterThan(4.0)),
        ],
        display_set_selectors: selectors,
        default_viewport: None,
        stages: vec![Stage {
            id: "2x2".to_string(),
            name: "2x2".to_string(),
            layout: GridLayout::new(2, 2),
            slots,
            status: StageStatus::Enabled,
        }],
        tool_group_ids: vec![],
        callbacks: ProtocolCallbacks::default(),
    }
}

fn build_library(n: usize) -> ProtocolLibrary {
    let mut protocols = vec![build_protocol("default", "CT")];
    protocols.extend((0..n).map(|i| build_protocol(&format!("p-{i}"), if i % 3 == 0 { "PT" } else { "CT" })));
    ProtocolLibrary::new(protocols)
}

// ── Benchmarks: ProtocolMatcher::run ──────────────────────────────────────────

/// Scales the protocol library size with a fixed 32-series study.
fn bench_match_library_scaling(c: &mut Criterion) {
    let study = build_study(32);
    let matcher = ProtocolMatcher::new("default");
    let mut group = c.benchmark_group("match_library_scaling");

    for &count in &[1usize, 10, 50, 200] {
        let library = build_library(count);
        group.bench_with_input(BenchmarkId::new("protocols", count), &library, |b, library| {
            b.iter(|| matcher.run(library.iter(), library, black_box("1.2.3"), black_box(&study)))
        });
    }

    group.finish();
}

/// Scales the number of series a selector must rank.
fn bench_match_selectors_scaling(c: &mut Criterion) {
    let protocol = build_protocol("p", "CT");
    let mut group = c.benchmark_group("match_selectors_scaling");

    for &count in &[8usize, 64, 512] {
        let study = build_study(count);
        group.bench_with_input(BenchmarkId::new("series", count), &study, |b, study| {
            b.iter(|| match_selectors(black_box(&protocol), black_box(study)))
        });
    }

    group.finish();
}

// ── Benchmarks: resolve_stage ─────────────────────────────────────────────────

fn bench_resolve_stage(c: &mut Criterion) {
    let protocol = build_protocol("p", "CT");
    let study = build_study(32);
    let selectors = match_selectors(&protocol, &study);
    let stage = &protocol.stages[0];
    let mut group = c.benchmark_group("resolve_stage");

    group.bench_function("cold_2x2", |b| {
        b.iter(|| resolve_stage(black_box(stage), &selectors, &GridState::empty(), true))
    });

    // Every viewport is reused from the previous grid.
    let warm = resolve_stage(stage, &selectors, &GridState::empty(), true)
        .expect("fixture stage must resolve");
    group.bench_function("warm_2x2", |b| {
        b.iter(|| resolve_stage(black_box(stage), &selectors, black_box(&warm), true))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_match_library_scaling,
    bench_match_selectors_scaling,
    bench_resolve_stage,
);
criterion_main!(benches);
