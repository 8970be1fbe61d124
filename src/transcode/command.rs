//! Transcoder argument templates.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Variables available to profile argument templates.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    vars: HashMap<String, String>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session variables: `{input}`, `{stream_id}`, `{user_agent}` and,
    /// when present, `{output_dir}`.
    pub fn for_session(
        input: &str,
        stream_id: &str,
        user_agent: &str,
        output_dir: Option<&Path>,
    ) -> Self {
        let mut ctx = Self::new()
            .with_var("input", input)
            .with_var("stream_id", stream_id)
            .with_var("user_agent", user_agent);
        if let Some(dir) = output_dir {
            ctx.set("output_dir", &dir.display().to_string());
        }
        ctx
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Substitute `{name}` placeholders in one pass. Substituted values are
    /// not rescanned, so an origin URL containing braces is passed through
    /// untouched. Unknown placeholders are left as-is.
    pub fn substitute(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Build the transcoder argument list for a profile.
///
/// An argument that is exactly `{headers}` expands to `-headers <lines>` when
/// there are headers to forward, and is removed otherwise. `User-Agent` is
/// carried by `{user_agent}` instead.
pub fn build_args(
    template: &[String],
    ctx: &CommandContext,
    headers: &BTreeMap<String, String>,
) -> Vec<String> {
    let header_lines: String = headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("user-agent"))
        .map(|(name, value)| format!("{name}: {value}\r\n"))
        .collect();

    let mut args = Vec::with_capacity(template.len() + 1);
    for arg in template {
        if arg == "{headers}" {
            if !header_lines.is_empty() {
                args.push("-headers".to_string());
                args.push(header_lines.clone());
            }
        } else {
            args.push(ctx.substitute(arg));
        }
    }
    args
}

/// User agent for the transcoder: the forwarded `User-Agent` header if any,
/// else the configured default.
pub fn user_agent_for<'a>(headers: &'a BTreeMap<String, String>, default: &'a str) -> &'a str {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
        .map(|(_, value)| value.as_str())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn substitutes_known_variables() {
        let ctx = CommandContext::for_session(
            "https://o.example/live.m3u8",
            "abc",
            "ua/1",
            Some(Path::new("/tmp/out")),
        );
        assert_eq!(ctx.substitute("{output_dir}/index.m3u8"), "/tmp/out/index.m3u8");
        assert_eq!(ctx.substitute("-i {input}"), "-i https://o.example/live.m3u8");
        assert_eq!(ctx.substitute("{unknown}-{stream_id}"), "{unknown}-abc");
        assert_eq!(ctx.substitute("trailing {"), "trailing {");
    }

    #[test]
    fn values_are_not_rescanned() {
        let ctx = CommandContext::new()
            .with_var("input", "https://o.example/{stream_id}")
            .with_var("stream_id", "abc");
        assert_eq!(ctx.substitute("{input}"), "https://o.example/{stream_id}");
    }

    #[test]
    fn headers_placeholder_expands_or_disappears() {
        let template = strings(&["-y", "{headers}", "-i", "{input}"]);
        let ctx = CommandContext::new().with_var("input", "in");

        let none = build_args(&template, &ctx, &BTreeMap::new());
        assert_eq!(none, strings(&["-y", "-i", "in"]));

        let mut headers = BTreeMap::new();
        headers.insert("Referer".to_string(), "https://site/".to_string());
        headers.insert("User-Agent".to_string(), "custom".to_string());
        let some = build_args(&template, &ctx, &headers);
        assert_eq!(
            some,
            strings(&["-y", "-headers", "Referer: https://site/\r\n", "-i", "in"])
        );
        assert_eq!(user_agent_for(&headers, "default"), "custom");
        assert_eq!(user_agent_for(&BTreeMap::new(), "default"), "default");
    }
}
