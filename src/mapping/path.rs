use serde_json::Value;

/// Looks up a dotted path in `root`.
///
/// `""`, `$` and `$.` select the root itself. A leading `$.` or `$` is
/// stripped. Numeric segments index arrays; bracket syntax is not supported
/// and simply fails to match.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);

    if path.is_empty() {
        return Some(root);
    }

    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
