//! HLS manifest rewriting
//!
//! Rewrites playlist text so every referenced URI flows back through the
//! gateway. Strictly line-oriented:
//! - empty lines and `#` directive lines pass through byte-identical
//! - any other line is a URI reference, resolved against the manifest's
//!   own URL and replaced with `{gateway_base}?url=<encoded absolute>`
//!
//! A line that fails to resolve passes through unchanged; one bad
//! reference degrades one segment instead of breaking playback. Two
//! invocations with identical inputs produce byte-identical output.

use url::Url;

/// Rewrite one playlist fetched from `source_url` so its references point
/// at `gateway_base` (e.g. "https://gw.example.com/proxy").
pub fn rewrite_manifest(manifest: &str, source_url: &Url, gateway_base: &str) -> String {
    let mut out = String::with_capacity(manifest.len() * 2);

    for (i, line) in manifest.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&rewrite_line(line, source_url, gateway_base));
    }

    out
}

fn rewrite_line(line: &str, source_url: &Url, gateway_base: &str) -> String {
    // Carriage returns from CRLF manifests would corrupt the encoded URL
    let reference = line.trim_end_matches('\r');

    if reference.is_empty() || reference.starts_with('#') {
        return line.to_string();
    }

    match source_url.join(reference) {
        Ok(absolute) => format!(
            "{}?url={}",
            gateway_base,
            urlencoding::encode(absolute.as_str())
        ),
        // Malformed reference: leave the line alone, keep going
        Err(_) => line.to_string(),
    }
}
