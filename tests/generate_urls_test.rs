//! Proxy URL generation, channel list merging and the diagnostic endpoints.

mod common;

use common::TestHarness;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn endpoints_follow_kind_and_extension() {
    let h = TestHarness::start().await;
    let resp = h
        .client
        .post(h.url("/generate_urls"))
        .json(&json!({
            "urls": [
                { "url": "https://origin.example/live/master.m3u8" },
                { "url": "https://origin.example/dash/stream.mpd" },
                { "url": "https://origin.example/live/master.m3u8", "profile": "default" },
                { "url": "https://origin.example/keys/1", "kind": "key" },
                { "url": "https://drm.example/wv", "kind": "license" },
                { "url": "https://origin.example/vod/1.m4s", "kind": "segment",
                  "key": "00112233445566778899aabbccddeeff", "iv": "0x0000000000000000000000000000000a" }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let urls: Vec<&str> = body["urls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u.as_str().unwrap())
        .collect();

    let expected = [
        "/proxy/hls/manifest.m3u8?token=",
        "/proxy/mpd/manifest.m3u8?token=",
        "/proxy/stream?token=",
        "/key?token=",
        "/license?token=",
        "/proxy/hls/segment.m4s?token=",
    ];
    assert_eq!(urls.len(), expected.len());
    for (url, endpoint) in urls.iter().zip(expected) {
        assert!(url.starts_with(&h.url(endpoint)), "{url} should use {endpoint}");
        assert!(!url.contains("origin.example"));
    }
}

#[tokio::test]
async fn generated_manifest_url_works() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vod/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("#EXTM3U\n#EXTINF:4,\na.ts\n#EXT-X-ENDLIST\n"),
        )
        .mount(&origin)
        .await;

    let h = TestHarness::start().await;
    let body: serde_json::Value = h
        .client
        .post(h.url("/generate_urls"))
        .json(&json!({
            "urls": [{
                "url": format!("{}/vod/index.m3u8", origin.uri()),
                "headers": { "Referer": "https://player.example/" }
            }]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let url = body["urls"][0].as_str().unwrap();
    let resp = h.get(url).await;
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("/proxy/hls/segment.ts?token="));
}

#[tokio::test]
async fn invalid_source_is_bad_request() {
    let h = TestHarness::start().await;
    for source in [
        json!({ "url": "ftp://origin.example/a.m3u8" }),
        json!({ "url": "https://origin.example/a.ts", "kind": "segment", "key": "abc" }),
        json!({ "url": "https://origin.example/a.ts", "kind": "bogus" }),
        json!({ "url": "https://origin.example/a.m3u8", "kind": "manifest", "profile": "default" }),
    ] {
        let resp = h
            .client
            .post(h.url("/generate_urls"))
            .json(&json!({ "urls": [source.clone()] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{source}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "validation_error", "{source}");
    }
}

#[tokio::test]
async fn outbound_ip_from_json_or_text() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ip": "203.0.113.7" })))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/text"))
        .respond_with(ResponseTemplate::new(200).set_body_string("198.51.100.4\n"))
        .mount(&origin)
        .await;

    let json_url = format!("{}/json", origin.uri());
    let h = TestHarness::start_with(move |c| c.upstream.ip_lookup_url = json_url).await;
    let body: serde_json::Value = h.get(&h.url("/proxy/ip")).await.json().await.unwrap();
    assert_eq!(body, json!({ "ip": "203.0.113.7" }));

    let text_url = format!("{}/text", origin.uri());
    let h = TestHarness::start_with(move |c| c.upstream.ip_lookup_url = text_url).await;
    let body: serde_json::Value = h.get(&h.url("/proxy/ip")).await.json().await.unwrap();
    assert_eq!(body, json!({ "ip": "198.51.100.4" }));
}

#[tokio::test]
async fn merged_playlist_routes_channels_with_their_headers() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lists/news.m3u"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n\
             #EXTINF:-1 group-title=\"News\",News\n\
             #EXTVLCOPT:http-referrer=https://site.example/\n\
             ../live/news.m3u8\n",
        ))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/lists/sport.m3u"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("#EXTM3U\n#EXTINF:-1,Sport\nhttps://cdn.example/sport.ts\n"),
        )
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/news.m3u8"))
        .and(header("referer", "https://site.example/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\n0.ts\n"),
        )
        .mount(&origin)
        .await;

    let h = TestHarness::start().await;
    let lists = format!(
        "{0}/lists/news.m3u;{0}/lists/sport.m3u;{0}/lists/missing.m3u",
        origin.uri()
    );
    let resp = h
        .client
        .get(h.url("/playlist"))
        .query(&[("url", lists.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/x-mpegurl");
    let body = resp.text().await.unwrap();

    assert_eq!(body.matches("#EXTM3U").count(), 1);
    assert!(body.contains("#EXTINF:-1 group-title=\"News\",News"));
    assert!(!body.contains("EXTVLCOPT"));
    let channels: Vec<&str> = body.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(channels.len(), 2);
    assert!(channels[0].starts_with(&h.url("/proxy/hls/manifest.m3u8?token=")));
    assert!(channels[1].starts_with(&h.url("/proxy/stream?token=")));
    assert!(!body.contains("cdn.example"));

    // The referer from the option line travels inside the channel token.
    let news = h.get(channels[0]).await;
    assert_eq!(news.status(), 200);
    assert!(news.text().await.unwrap().contains("/proxy/hls/segment.ts?token="));
}

#[tokio::test]
async fn playlist_requires_a_reachable_source() {
    let h = TestHarness::start().await;
    let resp = h.get(&h.url("/playlist")).await;
    assert_eq!(resp.status(), 400);

    let origin = MockServer::start().await;
    Mock::given(path("/gone.m3u"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;
    let resp = h
        .client
        .get(h.url("/playlist"))
        .query(&[("url", format!("{}/gone.m3u", origin.uri()))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn server_info_summarizes_configuration() {
    let h = TestHarness::start_with(|c| c.auth.password = Some("hunter2".into())).await;
    let body: serde_json::Value = h.get(&h.url("/api/info")).await.json().await.unwrap();

    assert_eq!(body["name"], "streamgate");
    assert_eq!(body["public_url"], h.url(""));
    assert_eq!(body["auth_enabled"], false);
    assert_eq!(body["passthrough_status"], true);
    assert_eq!(body["default_profile"], "default");
    assert_eq!(body["transcode_profiles"], json!(["default", "hls"]));
    assert_eq!(body["active_sessions"], 0);
    assert!(!body.to_string().contains("hunter2"));
    assert!(!body.to_string().contains(common::TEST_SECRET));
}
