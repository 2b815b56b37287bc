use url::form_urlencoded;

/// Build the cache key for a request path and its query parameters.
///
/// Parameters are sorted by name then value so the same logical request
/// always maps to one key.
pub fn cache_key(path: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }

    let mut sorted = params.to_vec();
    sorted.sort_unstable();
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(sorted)
        .finish();
    format!("{path}?{query}")
}

/// The first segment after `/api/`, if any.
pub(crate) fn collection_of(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/")?;
    let collection = rest.split(['/', '?']).next()?;
    (!collection.is_empty()).then_some(collection)
}
