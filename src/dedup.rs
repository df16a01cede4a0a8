/// Keeps the first record for every distinct key, preserving input order.
///
/// Lists handled here are small (a page of teams or reviewers), so a linear
/// scan over the kept records is enough.
pub fn deduplicate_by<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> Vec<T>
where
    K: PartialEq + ?Sized,
    F: Fn(&T) -> &K,
{
    let mut kept: Vec<T> = Vec::new();
    for item in items {
        if !kept.iter().any(|existing| key(existing) == key(&item)) {
            kept.push(item);
        }
    }
    kept
}
