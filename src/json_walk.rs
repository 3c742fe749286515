//! Recursive JSON value walking for URI rewriting (§4.5, §9 "Dynamic message
//! walking"). Kept generic over `serde_json::Value` rather than modeling
//! every LSP message shape, per the design note: the sidecar does not parse
//! LSP semantics, only finds `uri`/`targetUri` keys wherever they occur.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;

/// Percent-encode set for file-URI paths: keep the unreserved set plus `/`,
/// escape everything else (mirrors RFC 3986 `pchar` minus `:`/`@` which we
/// don't need to preserve in a local filesystem path).
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

/// Keys that carry a `file://` URI somewhere in an LSP message body.
const URI_KEYS: [&str; 2] = ["uri", "targetUri"];

/// Walk `value` in place, rewriting every string at a `uri`/`targetUri` key
/// with `rewrite`. `rewrite` receives the raw string value and returns the
/// replacement, or `None` to leave it untouched.
pub fn rewrite_uris(value: &mut Value, rewrite: &impl Fn(&str) -> Option<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if URI_KEYS.contains(&key.as_str()) {
                    if let Value::String(s) = child {
                        if let Some(new) = rewrite(s) {
                            *s = new;
                        }
                    }
                } else {
                    rewrite_uris(child, rewrite);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_uris(item, rewrite);
            }
        }
        _ => {}
    }
}

/// Turn an absolute filesystem path into a `file://` URI, percent-encoding
/// reserved characters in the path component.
#[must_use]
pub fn path_to_file_uri(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let with_slash = if let Some(stripped) = normalized.strip_prefix('/') {
        stripped.to_string()
    } else {
        normalized
    };
    let encoded = utf8_percent_encode(&with_slash, PATH_ENCODE_SET).to_string();
    format!("file:///{encoded}")
}

/// Ingress rewrite (§4.5): a host-relative `file:///<rel>` URI becomes an
/// absolute URI under `root_path`.
#[must_use]
pub fn rewrite_ingress(uri: &str, root_path: &str) -> Option<String> {
    let rel = uri.strip_prefix("file:///")?;
    let decoded = percent_decode_str(rel).decode_utf8().ok()?.into_owned();
    let joined = join_root(root_path, &decoded);
    Some(path_to_file_uri(&joined))
}

/// Egress rewrite (§4.5): an absolute URI under `root_path` becomes a
/// host-relative `file:///<rel>` URI. URIs outside the root are returned
/// unchanged (cross-file navigation to system headers is legitimate).
#[must_use]
pub fn rewrite_egress(uri: &str, root_uri_prefix: &str) -> Option<String> {
    let trimmed_prefix = root_uri_prefix.trim_end_matches('/');
    let after = uri.strip_prefix(trimmed_prefix)?;
    // A sibling directory like `file:///repository` string-prefix-matches
    // root `file:///repo` without actually being under it; only accept a
    // clean path boundary (nothing left, or the next char is `/`).
    let rest = if after.is_empty() {
        after
    } else {
        after.strip_prefix('/')?
    };
    Some(format!("file:///{rest}"))
}

fn join_root(root_path: &str, rel: &str) -> String {
    let root = root_path.trim_end_matches('/');
    if rel.is_empty() {
        root.to_string()
    } else {
        format!("{root}/{rel}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_uri_and_target_uri_keys_only() {
        let mut value = json!({
            "uri": "file:///a.rs",
            "targetUri": "file:///b.rs",
            "other": "file:///c.rs",
            "nested": {"uri": "file:///d.rs"},
            "list": [{"uri": "file:///e.rs"}],
        });
        rewrite_uris(&mut value, &|s| Some(format!("{s}!")));
        assert_eq!(value["uri"], "file:///a.rs!");
        assert_eq!(value["targetUri"], "file:///b.rs!");
        assert_eq!(value["other"], "file:///c.rs");
        assert_eq!(value["nested"]["uri"], "file:///d.rs!");
        assert_eq!(value["list"][0]["uri"], "file:///e.rs!");
    }

    #[test]
    fn ingress_then_egress_is_identity_within_root() {
        let root_path = "/repo";
        let root_uri = path_to_file_uri(root_path);
        let client_uri = "file:///src/a.ts";

        let absolute = rewrite_ingress(client_uri, root_path).unwrap();
        assert_eq!(absolute, "file:///repo/src/a.ts");

        let back = rewrite_egress(&absolute, &root_uri).unwrap();
        assert_eq!(back, client_uri);
    }

    #[test]
    fn egress_leaves_uris_outside_root_untouched() {
        let root_uri = path_to_file_uri("/repo");
        let outside = "file:///usr/include/stdio.h";
        assert!(rewrite_egress(outside, &root_uri).is_none());
    }

    #[test]
    fn egress_leaves_sibling_directory_with_matching_prefix_untouched() {
        let root_uri = path_to_file_uri("/repo");
        let sibling = "file:///repository/foo.rs";
        assert!(rewrite_egress(sibling, &root_uri).is_none());
    }

    #[test]
    fn ingress_strips_leading_slash_in_relative_part() {
        let absolute = rewrite_ingress("file:////src/a.ts", "/repo").unwrap();
        assert_eq!(absolute, "file:///repo/src/a.ts");
    }

    #[test]
    fn path_to_file_uri_percent_encodes_spaces() {
        assert_eq!(path_to_file_uri("/tmp/a b.rs"), "file:///tmp/a%20b.rs");
    }

    #[test]
    fn egress_handles_prefix_with_trailing_slash() {
        let absolute = "file:///repo/src/a.ts";
        let back = rewrite_egress(absolute, "file:///repo/").unwrap();
        assert_eq!(back, "file:///src/a.ts");
    }
}
