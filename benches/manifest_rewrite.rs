//! Benchmarks for manifest rewriting
//!
//! Measures HLS and DASH rewriting through the real token codec, plus token
//! encode/decode on its own.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamgate::proxy_url::ProxyUrlBuilder;
use streamgate::token::TokenCodec;
use streamgate::{StreamRequest, TargetKind};
use streamgate_manifest::{rewrite, RewriteOptions};
use url::Url;

fn media_playlist(segments: usize, encrypted: bool) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:1000\n");
    if encrypted {
        out.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/k/1\"\n");
    }
    for i in 0..segments {
        out.push_str(&format!("#EXTINF:6.006,\nsegment_{:05}.ts\n", 1000 + i));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

fn master_playlist(variants: usize) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-INDEPENDENT-SEGMENTS\n");
    for i in 0..variants {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\"\nv{i}/index.m3u8\n",
            800_000 * (i + 1)
        ));
    }
    out
}

const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT2S">
  <Period id="p0">
    <BaseURL>p0/</BaseURL>
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number%05d$.m4s" startNumber="1" timescale="1000" duration="4000"/>
      <Representation id="v1" bandwidth="800000"/>
      <Representation id="v2" bandwidth="2400000"/>
      <Representation id="v3" bandwidth="6000000"/>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4">
      <SegmentTemplate initialization="audio/init.mp4" media="audio/$Number$.m4s" startNumber="1" timescale="1000" duration="4000"/>
      <Representation id="a1" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>
"#;

fn codec() -> TokenCodec {
    TokenCodec::new("benchmark-secret-0123456789abcdef").unwrap()
}

fn bench_hls(c: &mut Criterion) {
    let codec = codec();
    let base = Url::parse("https://origin.example/vod/title/index.m3u8").unwrap();
    let parent = StreamRequest::new(TargetKind::Manifest, base.as_str())
        .with_header("Referer", "https://player.example/");
    let builder = ProxyUrlBuilder::new(&codec, "https://proxy.example", &parent);

    let mut group = c.benchmark_group("hls_media_playlist");
    for segments in [10usize, 100, 1000] {
        let body = media_playlist(segments, false);
        group.throughput(Throughput::Elements(segments as u64));
        group.bench_with_input(BenchmarkId::from_parameter(segments), &body, |b, body| {
            b.iter(|| {
                rewrite(
                    black_box(body.as_bytes()),
                    &base,
                    &RewriteOptions::default(),
                    &builder,
                )
                .unwrap()
            })
        });
    }
    group.finish();

    let encrypted = media_playlist(100, true);
    c.bench_function("hls_decrypting_100", |b| {
        b.iter(|| {
            rewrite(
                black_box(encrypted.as_bytes()),
                &base,
                &RewriteOptions::decrypting(true),
                &builder,
            )
            .unwrap()
        })
    });

    let master = master_playlist(8);
    c.bench_function("hls_master_8_variants", |b| {
        b.iter(|| {
            rewrite(
                black_box(master.as_bytes()),
                &base,
                &RewriteOptions::default(),
                &builder,
            )
            .unwrap()
        })
    });
}

fn bench_dash(c: &mut Criterion) {
    let codec = codec();
    let base = Url::parse("https://origin.example/live/manifest.mpd").unwrap();
    let parent = StreamRequest::new(TargetKind::Manifest, base.as_str());
    let builder = ProxyUrlBuilder::new(&codec, "https://proxy.example", &parent);

    c.bench_function("dash_templated_mpd", |b| {
        b.iter(|| {
            rewrite(
                black_box(MPD.as_bytes()),
                &base,
                &RewriteOptions::default(),
                &builder,
            )
            .unwrap()
        })
    });
}

fn bench_tokens(c: &mut Criterion) {
    let codec = codec();
    let request = StreamRequest::new(
        TargetKind::Segment,
        "https://origin.example/vod/title/segment_01000.ts?sig=abcdef",
    )
    .with_header("Referer", "https://player.example/")
    .with_header("User-Agent", "Mozilla/5.0");
    let token = codec.encode(&request).unwrap();

    c.bench_function("token_encode", |b| {
        b.iter(|| codec.encode(black_box(&request)).unwrap())
    });
    c.bench_function("token_decode", |b| {
        b.iter(|| codec.decode(black_box(&token)).unwrap())
    });
}

criterion_group!(benches, bench_hls, bench_dash, bench_tokens);
criterion_main!(benches);
