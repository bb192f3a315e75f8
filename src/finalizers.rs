/// Returns a copy of `finalizers` with every occurrence of `target` removed,
/// preserving the order of the remaining entries.
pub fn remove(finalizers: &[String], target: &str) -> Vec<String> {
    finalizers
        .iter()
        .filter(|finalizer| finalizer.as_str() != target)
        .cloned()
        .collect()
}
