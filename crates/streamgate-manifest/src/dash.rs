//! DASH MPD rewriting.
//!
//! The MPD is streamed through a quick-xml reader/writer pair. Elements that
//! carry URIs get their attributes rebuilt; every other event is written back
//! unchanged. `BaseURL` resolution follows the MPD hierarchy (MPD, Period,
//! AdaptationSet, Representation): each element scope inherits the effective
//! base of its parent until a `BaseURL` child overrides it.
//!
//! A `SegmentTemplate` is rewritten against the base of the scope declaring
//! it. An `AdaptationSet` or `Representation` that inherits a template but
//! overrides the base gets its own `SegmentTemplate` carrying only the URI
//! attributes, re-resolved against its base; every other template attribute
//! keeps being inherited.

use crate::tokenizer::{resolve, ProxyTarget, UriTokenizer};
use crate::{Error, Result};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use streamgate_common::TargetKind;
use url::Url;

/// A DASH media presentation description.
#[derive(Debug, Clone)]
pub struct DashManifest {
    source: String,
    dynamic: bool,
    minimum_update_period: Option<String>,
    periods: usize,
    segment_templates: usize,
}

/// Elements whose text content is a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextUri {
    BaseUrl,
    Location,
    LicenseUrl,
}

impl TextUri {
    fn for_element(local_name: &[u8]) -> Option<Self> {
        match local_name {
            b"BaseURL" => Some(TextUri::BaseUrl),
            b"Location" => Some(TextUri::Location),
            b"Laurl" | b"laurl" => Some(TextUri::LicenseUrl),
            _ => None,
        }
    }

    fn kind(self) -> TargetKind {
        match self {
            TextUri::BaseUrl => TargetKind::Segment,
            TextUri::Location => TargetKind::Manifest,
            TextUri::LicenseUrl => TargetKind::License,
        }
    }
}

/// URI-bearing attributes per element.
fn uri_attributes(local_name: &[u8]) -> &'static [&'static str] {
    match local_name {
        b"SegmentTemplate" => &["media", "initialization", "index", "bitstreamSwitching"],
        b"SegmentURL" => &["media", "index"],
        b"Initialization" | b"RepresentationIndex" | b"BitstreamSwitching" => &["sourceURL"],
        _ => &[],
    }
}

struct Scope {
    base: Url,
    text_uri: Option<TextUri>,
    base_overridden: bool,
    /// Raw URI attributes of a `SegmentTemplate` declared in this scope.
    template: Option<Vec<(String, String)>>,
}

impl Scope {
    fn new(base: Url, element: &BytesStart<'_>) -> Self {
        Self {
            base,
            text_uri: TextUri::for_element(element.local_name().as_ref()),
            base_overridden: false,
            template: None,
        }
    }
}

/// Scopes that may override the base below an inherited template.
fn inherits_template(local_name: &[u8]) -> bool {
    matches!(local_name, b"AdaptationSet" | b"Representation")
}

/// Raw values of the URI attributes of a `SegmentTemplate`.
fn template_attributes(element: &BytesStart<'_>, position: usize) -> Result<Vec<(String, String)>> {
    let names = uri_attributes(b"SegmentTemplate");
    let mut found = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| Error::xml(position, e))?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(|_| Error::InvalidUtf8)?;
        if names.contains(&key) {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::xml(position, e))?;
            found.push((key.to_string(), value.into_owned()));
        }
    }
    Ok(found)
}

/// `SegmentTemplate` for a scope whose base differs from the one its
/// inherited template was resolved against. `None` when nothing needs it.
fn rebased_template(
    scope: &Scope,
    ancestors: &[Scope],
    prefix: &[u8],
    tokenizer: &dyn UriTokenizer,
) -> Result<Option<BytesStart<'static>>> {
    if !scope.base_overridden || scope.template.is_some() {
        return Ok(None);
    }
    let Some(inherited) = ancestors.iter().rev().find_map(|s| s.template.as_ref()) else {
        return Ok(None);
    };

    let name = [prefix, b"SegmentTemplate".as_slice()].concat();
    let name = String::from_utf8(name).map_err(|_| Error::InvalidUtf8)?;
    let mut element = BytesStart::new(name);
    let mut any = false;
    for (key, value) in inherited {
        if let Some(proxied) = proxy_reference(value, &scope.base, tokenizer)? {
            element.push_attribute((key.as_str(), proxied.as_str()));
            any = true;
        }
    }
    Ok(any.then_some(element))
}

impl DashManifest {
    /// Parse MPD text, collecting presentation-level attributes.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        let mut manifest = Self {
            source: text.to_string(),
            dynamic: false,
            minimum_update_period: None,
            periods: 0,
            segment_templates: 0,
        };
        let mut seen_root = false;

        loop {
            let position = reader.buffer_position();
            match reader.read_event().map_err(|e| Error::xml(position, e))? {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"MPD" if !seen_root => {
                        seen_root = true;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|err| Error::xml(position, err))?;
                            let value = attr
                                .unescape_value()
                                .map_err(|err| Error::xml(position, err))?;
                            match attr.key.local_name().as_ref() {
                                b"type" => manifest.dynamic = value == "dynamic",
                                b"minimumUpdatePeriod" => {
                                    manifest.minimum_update_period = Some(value.into_owned())
                                }
                                _ => {}
                            }
                        }
                    }
                    _ if !seen_root => return Err(Error::NotAManifest),
                    b"Period" => manifest.periods += 1,
                    b"SegmentTemplate" => manifest.segment_templates += 1,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(Error::NotAManifest);
        }
        Ok(manifest)
    }

    /// `MPD@type="dynamic"`.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// `MPD@minimumUpdatePeriod`, as written.
    pub fn minimum_update_period(&self) -> Option<&str> {
        self.minimum_update_period.as_deref()
    }

    /// Number of `Period` elements.
    pub fn periods(&self) -> usize {
        self.periods
    }

    /// Number of `SegmentTemplate` elements.
    pub fn segment_templates(&self) -> usize {
        self.segment_templates
    }

    /// Rewrite every URI reference through `tokenizer`.
    pub fn rewrite(&self, base: &Url, tokenizer: &dyn UriTokenizer) -> Result<String> {
        let mut reader = Reader::from_str(&self.source);
        let mut writer = Writer::new(Vec::with_capacity(self.source.len() * 2));
        let mut scopes: Vec<Scope> = Vec::new();

        loop {
            let position = reader.buffer_position();
            let event = reader.read_event().map_err(|e| Error::xml(position, e))?;
            let out = match event {
                Event::Start(e) => {
                    record_template(&e, &mut scopes, position)?;
                    let parent = scopes.last().map_or(base, |s| &s.base).clone();
                    let rewritten = rewrite_attributes(&e, &parent, tokenizer, position)?;
                    scopes.push(Scope::new(parent, &e));
                    Event::Start(rewritten)
                }
                Event::Empty(e) => {
                    record_template(&e, &mut scopes, position)?;
                    let parent = scopes.last().map_or(base, |s| &s.base);
                    Event::Empty(rewrite_attributes(&e, parent, tokenizer, position)?)
                }
                Event::End(e) => {
                    if let Some(scope) = scopes.pop() {
                        let name = e.name();
                        let local = e.local_name();
                        if inherits_template(local.as_ref()) {
                            let prefix = &name.as_ref()[..name.as_ref().len() - local.as_ref().len()];
                            if let Some(template) =
                                rebased_template(&scope, &scopes, prefix, tokenizer)?
                            {
                                writer
                                    .write_event(Event::Empty(template))
                                    .map_err(|err| Error::xml(position, err))?;
                            }
                        }
                    }
                    Event::End(e)
                }
                Event::Text(t) => {
                    match rewrite_text(&t, &mut scopes, tokenizer, position)? {
                        Some(replaced) => Event::Text(BytesText::new(&replaced).into_owned()),
                        None => Event::Text(t),
                    }
                }
                Event::Eof => break,
                other => other,
            };
            writer
                .write_event(out)
                .map_err(|e| Error::xml(position, e))?;
        }

        String::from_utf8(writer.into_inner()).map_err(|_| Error::InvalidUtf8)
    }
}

/// Remember a `SegmentTemplate` on the scope declaring it.
fn record_template(element: &BytesStart<'_>, scopes: &mut [Scope], position: usize) -> Result<()> {
    if element.local_name().as_ref() != b"SegmentTemplate" {
        return Ok(());
    }
    if let Some(scope) = scopes.last_mut() {
        scope.template = Some(template_attributes(element, position)?);
    }
    Ok(())
}

/// Rebuild `element` with its URI attributes replaced by proxy URLs.
fn rewrite_attributes(
    element: &BytesStart<'_>,
    base: &Url,
    tokenizer: &dyn UriTokenizer,
    position: usize,
) -> Result<BytesStart<'static>> {
    let mut out = element.clone().into_owned();
    let names = uri_attributes(element.local_name().as_ref());
    if names.is_empty() {
        return Ok(out);
    }

    out.clear_attributes();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| Error::xml(position, e))?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(|_| Error::InvalidUtf8)?;
        if names.contains(&key) {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::xml(position, e))?;
            if let Some(proxied) = proxy_reference(&value, base, tokenizer)? {
                out.push_attribute((key, proxied.as_str()));
                continue;
            }
        }
        out.push_attribute(attr);
    }
    Ok(out)
}

/// Proxy URL for an attribute value; `None` leaves the value untouched.
fn proxy_reference(
    value: &str,
    base: &Url,
    tokenizer: &dyn UriTokenizer,
) -> Result<Option<String>> {
    if value.contains('$') {
        // Placeholders are resolved per request by the segment endpoint.
        let target = ProxyTarget {
            kind: TargetKind::Segment,
            url: base,
            decrypt: None,
            template: Some(value),
        };
        return tokenizer.proxy_url(&target).map(Some);
    }
    match resolve(base, value)? {
        Some(url) => tokenizer
            .proxy_url(&ProxyTarget::new(TargetKind::Segment, &url))
            .map(Some),
        None => Ok(None),
    }
}

/// Replacement text for a `BaseURL`, `Location` or `Laurl` body.
///
/// Also records a `BaseURL` as the effective base of its parent scope.
fn rewrite_text(
    text: &BytesText<'_>,
    scopes: &mut [Scope],
    tokenizer: &dyn UriTokenizer,
    position: usize,
) -> Result<Option<String>> {
    let Some((current, ancestors)) = scopes.split_last_mut() else {
        return Ok(None);
    };
    let Some(text_uri) = current.text_uri else {
        return Ok(None);
    };
    let raw = text.unescape().map_err(|e| Error::xml(position, e))?;
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let Some(resolved) = resolve(&current.base, value)? else {
        return Ok(None);
    };

    if text_uri == TextUri::BaseUrl {
        // Redundant BaseURL siblings are alternates; the first one wins.
        if let Some(parent) = ancestors.last_mut().filter(|p| !p.base_overridden) {
            parent.base = resolved.clone();
            parent.base_overridden = true;
        }
    }

    let proxied = tokenizer.proxy_url(&ProxyTarget::new(text_uri.kind(), &resolved))?;
    let leading = &raw[..raw.len() - raw.trim_start().len()];
    let trailing = &raw[raw.trim_end().len()..];
    Ok(Some(format!("{leading}{proxied}{trailing}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl UriTokenizer for Echo {
        fn proxy_url(&self, target: &ProxyTarget<'_>) -> Result<String> {
            Ok(match target.template {
                Some(tpl) => format!("/{}?u={}&tpl={}", target.kind, target.url, tpl),
                None => format!("/{}?u={}", target.kind, target.url),
            })
        }
    }

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT2S">
  <Location>https://origin.example/live/manifest.mpd</Location>
  <Period id="p0">
    <BaseURL>p0/</BaseURL>
    <AdaptationSet mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:uuid:e2719d58-a985-b3c9-781a-b030af78d30e">
        <dashif:Laurl xmlns:dashif="https://dashif.org/CPS">https://license.example/clearkey</dashif:Laurl>
      </ContentProtection>
      <SegmentTemplate timescale="1000" initialization="init-$RepresentationID$.mp4" media="chunk-$RepresentationID$-$Number%05d$.m4s" startNumber="1"/>
      <Representation id="v1" bandwidth="800000">
        <BaseURL>video/</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4">
      <SegmentList>
        <Initialization sourceURL="audio/init.mp4"/>
        <SegmentURL media="audio/1.m4s"/>
        <SegmentURL media="audio/2.m4s"/>
      </SegmentList>
    </AdaptationSet>
  </Period>
</MPD>
"#;

    fn base() -> Url {
        Url::parse("https://origin.example/live/manifest.mpd").unwrap()
    }

    #[test]
    fn parses_presentation_attributes() {
        let mpd = DashManifest::parse(MPD).unwrap();
        assert!(mpd.is_dynamic());
        assert_eq!(mpd.minimum_update_period(), Some("PT2S"));
        assert_eq!(mpd.periods(), 1);
        assert_eq!(mpd.segment_templates(), 1);
    }

    #[test]
    fn rejects_non_mpd_root() {
        assert!(matches!(
            DashManifest::parse("<html><MPD/></html>"),
            Err(Error::NotAManifest)
        ));
    }

    #[test]
    fn template_placeholders_survive() {
        let out = DashManifest::parse(MPD).unwrap().rewrite(&base(), &Echo).unwrap();
        assert!(out.contains(
            "media=\"/segment?u=https://origin.example/live/p0/&amp;tpl=chunk-$RepresentationID$-$Number%05d$.m4s\""
        ));
        assert!(out.contains(
            "initialization=\"/segment?u=https://origin.example/live/p0/&amp;tpl=init-$RepresentationID$.mp4\""
        ));
        assert!(out.contains("timescale=\"1000\""));
        assert!(out.contains("startNumber=\"1\""));
    }

    #[test]
    fn inherited_template_is_rebased_under_representation_base() {
        let out = DashManifest::parse(MPD).unwrap().rewrite(&base(), &Echo).unwrap();
        let representation = &out[out.find("<Representation id=\"v1\"").unwrap()..];
        let representation = &representation[..representation.find("</Representation>").unwrap()];
        assert!(representation.contains(
            "<SegmentTemplate initialization=\"/segment?u=https://origin.example/live/p0/video/&amp;tpl=init-$RepresentationID$.mp4\" \
             media=\"/segment?u=https://origin.example/live/p0/video/&amp;tpl=chunk-$RepresentationID$-$Number%05d$.m4s\"/>"
        ));
        // Timing attributes stay with the inherited template.
        assert!(!representation.contains("timescale"));
    }

    #[test]
    fn representations_on_different_hosts_keep_their_hosts() {
        let mpd = r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate media="$RepresentationID$/$Number$.m4s" duration="4" startNumber="1"/>
      <Representation id="hi" bandwidth="3000000"><BaseURL>https://cdn-a.example/vod/</BaseURL></Representation>
      <Representation id="lo" bandwidth="800000"><BaseURL>https://cdn-b.example/vod/</BaseURL></Representation>
      <Representation id="mid" bandwidth="1500000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let out = DashManifest::parse(mpd).unwrap().rewrite(&base(), &Echo).unwrap();
        assert!(out.contains(
            "<SegmentTemplate media=\"/segment?u=https://cdn-a.example/vod/&amp;tpl=$RepresentationID$/$Number$.m4s\"/></Representation>"
        ));
        assert!(out.contains(
            "<SegmentTemplate media=\"/segment?u=https://cdn-b.example/vod/&amp;tpl=$RepresentationID$/$Number$.m4s\"/></Representation>"
        ));
        // Representations without a BaseURL use the AdaptationSet template.
        assert!(out.contains(
            "media=\"/segment?u=https://origin.example/live/manifest.mpd&amp;tpl=$RepresentationID$/$Number$.m4s\" duration=\"4\""
        ));
        assert!(out.contains("<Representation id=\"mid\" bandwidth=\"1500000\"/>"));
        assert_eq!(out.matches("SegmentTemplate").count(), 3);
    }

    #[test]
    fn own_template_is_not_duplicated() {
        let mpd = r#"<MPD type="static"><Period><AdaptationSet>
<SegmentTemplate media="a/$Number$.m4s"/>
<Representation id="r"><BaseURL>https://cdn.example/r/</BaseURL><SegmentTemplate media="$Number$.m4s"/></Representation>
</AdaptationSet></Period></MPD>"#;
        let out = DashManifest::parse(mpd).unwrap().rewrite(&base(), &Echo).unwrap();
        assert_eq!(out.matches("<SegmentTemplate").count(), 2);
        assert!(out.contains("u=https://cdn.example/r/&amp;tpl=$Number$.m4s"));
    }

    #[test]
    fn base_urls_resolve_hierarchically() {
        let out = DashManifest::parse(MPD).unwrap().rewrite(&base(), &Echo).unwrap();
        assert!(out.contains("<BaseURL>/segment?u=https://origin.example/live/p0/</BaseURL>"));
        assert!(out.contains("<BaseURL>/segment?u=https://origin.example/live/p0/video/</BaseURL>"));
        assert!(out.contains("sourceURL=\"/segment?u=https://origin.example/live/p0/audio/init.mp4\""));
        assert!(out.contains("media=\"/segment?u=https://origin.example/live/p0/audio/2.m4s\""));
    }

    #[test]
    fn location_and_license_urls() {
        let out = DashManifest::parse(MPD).unwrap().rewrite(&base(), &Echo).unwrap();
        assert!(out.contains(
            "<Location>/manifest?u=https://origin.example/live/manifest.mpd</Location>"
        ));
        assert!(out.contains("/license?u=https://license.example/clearkey</dashif:Laurl>"));
    }

    #[test]
    fn untouched_structure_is_preserved() {
        let out = DashManifest::parse(MPD).unwrap().rewrite(&base(), &Echo).unwrap();
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MPD"));
        assert!(out.contains("<Representation id=\"v1\" bandwidth=\"800000\">"));
        assert!(out.contains(
            "<ContentProtection schemeIdUri=\"urn:uuid:e2719d58-a985-b3c9-781a-b030af78d30e\">"
        ));
        assert!(out.ends_with("</MPD>\n"));
    }
}
