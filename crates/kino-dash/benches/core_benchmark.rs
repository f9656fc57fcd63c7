//! Benchmark tests for kino-dash operations
//!
//! Run with: cargo bench -p kino-dash

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use chrono::Utc;
use std::time::Duration;
use url::Url;

use kino_dash::abr::RepresentationSelector;
use kino_dash::buffer::max_segments_in_cache;
use kino_dash::manifest::{
    detect_manifest_type, AdaptationSet, Manifest, ManifestType, Period, PresentationType,
    Representation, SegmentAddressing, SegmentTemplate, TimelineEntry,
};
use kino_dash::scheduler::{RepresentationSchedule, TemplateArgs, UrlTemplate};
use kino_dash::{DashConfig, FirstSelectMode, QualityInfo, Resolution};

// ============================================================================
// Helpers
// ============================================================================

fn create_test_manifest(addressing: SegmentAddressing) -> Manifest {
    let mut manifest = Manifest::new(
        ManifestType::Dash,
        PresentationType::Static,
        Url::parse("https://cdn.example.com/vod/manifest.mpd").unwrap(),
    );
    manifest.media_presentation_duration = Some(Duration::from_secs(3600));
    manifest.periods = vec![Period::new(vec![AdaptationSet::new(vec![
        Representation::new("v1", 2_500_000, addressing),
    ])])];
    manifest
}

fn create_test_qualities() -> Vec<QualityInfo> {
    [
        ("240p", 400_000, 426, 240),
        ("360p", 800_000, 640, 360),
        ("480p", 1_400_000, 854, 480),
        ("720p", 2_800_000, 1280, 720),
        ("1080p", 5_000_000, 1920, 1080),
    ]
    .into_iter()
    .map(|(id, bandwidth, width, height)| QualityInfo {
        id: id.to_string(),
        bandwidth,
        mime: Some("video/mp4".to_string()),
        codecs: Some("avc1.64001f".to_string()),
        resolution: Some(Resolution::new(width, height)),
        frame_rate: None,
        sample_rate: None,
        channels: None,
        quality_ranking: None,
        average_duration: Duration::from_secs(4),
        is_selected: false,
        disabled: false,
    })
    .collect()
}

// ============================================================================
// Template Benchmarks
// ============================================================================

fn bench_template(c: &mut Criterion) {
    let mut group = c.benchmark_group("template");

    group.bench_function("parse", |b| {
        b.iter(|| UrlTemplate::parse(black_box("$RepresentationID$/chunk-$Number%05d$-$Bandwidth$.m4s")))
    });

    let template = UrlTemplate::parse("$RepresentationID$/chunk-$Number%05d$-$Bandwidth$.m4s").unwrap();
    group.bench_function("resolve", |b| {
        b.iter(|| {
            template.resolve(black_box(&TemplateArgs {
                representation_id: "video-1080p",
                number: Some(12_345),
                time: None,
                bandwidth: Some(5_000_000),
            }))
        })
    });

    group.finish();
}

// ============================================================================
// Schedule Benchmarks
// ============================================================================

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");

    let numbered = create_test_manifest(SegmentAddressing::Template(SegmentTemplate::numbered(
        "$RepresentationID$/$Number$.m4s",
        1000,
        4000,
    )));
    let schedule = RepresentationSchedule::new(&numbered, 0, 0, 0, Utc::now()).unwrap();
    group.bench_function("numbered_index_for_time", |b| {
        b.iter(|| schedule.index_for_time(black_box(Duration::from_secs(1800))))
    });

    for runs in [10usize, 100, 1000] {
        // Alternating 2s and 4s runs of 3 segments each
        let entries = (0..runs)
            .map(|i| TimelineEntry::new(None, if i % 2 == 0 { 180_000 } else { 360_000 }, 2))
            .collect();
        let manifest = create_test_manifest(SegmentAddressing::Template(SegmentTemplate::timeline(
            "$RepresentationID$/$Time$.m4s",
            90_000,
            entries,
        )));
        let schedule = RepresentationSchedule::new(&manifest, 0, 0, 0, Utc::now()).unwrap();
        let last = (runs as u64 * 3).saturating_sub(1);

        group.bench_with_input(BenchmarkId::new("timeline_segment", runs), &last, |b, &last| {
            b.iter(|| schedule.segment(black_box(last)))
        });
        group.bench_with_input(BenchmarkId::new("timeline_index_for_time", runs), &runs, |b, &runs| {
            b.iter(|| schedule.index_for_time(black_box(Duration::from_secs(runs as u64 * 4))))
        });
    }

    group.finish();
}

// ============================================================================
// Selector Benchmarks
// ============================================================================

fn bench_selector(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    let qualities = create_test_qualities();

    group.bench_function("record_and_decide", |b| {
        let config = DashConfig::default();
        let mut selector = RepresentationSelector::new(&config);
        selector.start(FirstSelectMode::LowestBandwidth, &qualities);
        let mut rate = 100_000u64;
        b.iter(|| {
            rate = if rate > 900_000 { 100_000 } else { rate + 50_000 };
            selector.record_rate(black_box(rate));
            selector.on_segment_complete(black_box(&qualities))
        })
    });

    group.bench_function("max_segments_in_cache", |b| {
        b.iter(|| {
            max_segments_in_cache(
                black_box(Duration::from_secs(30)),
                black_box(Duration::from_secs(6)),
                black_box(Duration::from_millis(3840)),
            )
        })
    });

    group.finish();
}

// ============================================================================
// Manifest Benchmarks
// ============================================================================

fn bench_manifest_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");

    let url = Url::parse("https://cdn.example.com/live/stream").unwrap();
    let mpd = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" type=\"dynamic\">";

    group.bench_function("detect_by_content", |b| {
        b.iter(|| detect_manifest_type(black_box(&url), None, Some(black_box(&mpd[..]))))
    });
    group.bench_function("detect_by_mime", |b| {
        b.iter(|| detect_manifest_type(black_box(&url), Some("application/dash+xml"), None))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_template,
    bench_schedule,
    bench_selector,
    bench_manifest_detection,
);

criterion_main!(benches);
