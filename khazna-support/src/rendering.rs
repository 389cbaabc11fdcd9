//! Text rendering utilities for human-friendly diagnostics.
//!
//! Provides helpers to shorten type names, suggest registered types
//! close to a missing one, and render container lineages.

/// Renders a container lineage, outermost first.
///
/// ```text
/// [root ] container#1
///         ↓
/// [child] container#7  (tenant: acme)
/// ```
pub fn render_lineage(entries: &[LineageEntry]) -> String {
    let mut result = String::new();
    let width = entries.iter().map(|e| e.tag.len()).max().unwrap_or(0);

    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            result.push_str(&" ".repeat(width + 3));
            result.push_str("↓\n");
        }

        result.push_str(&format!("[{:<width$}] {}", entry.tag, entry.label));

        if let Some(ref note) = entry.note {
            result.push_str(&format!("  ({note})"));
        }

        result.push('\n');
    }

    result
}

/// One line of a rendered lineage.
#[derive(Debug, Clone)]
pub struct LineageEntry {
    /// What is being shown, e.g. `container#7`
    pub label: String,
    /// Short classifier rendered in brackets, e.g. `root`
    pub tag: String,
    /// Optional trailing remark
    pub note: Option<String>,
}

fn is_type_delimiter(c: char) -> bool {
    matches!(c, '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&' | '*')
}

/// Drops module paths from every type mentioned in `full_name`.
///
/// ```
/// use khazna_support::rendering::shorten_type_name;
///
/// assert_eq!(shorten_type_name("my_app::shapes::Circle"), "Circle");
/// assert_eq!(
///     shorten_type_name("alloc::sync::Arc<dyn my_app::shapes::Shape>"),
///     "Arc<dyn Shape>"
/// );
/// ```
pub fn shorten_type_name(full_name: &str) -> String {
    let mut shortened = String::with_capacity(full_name.len());
    let mut rest = full_name;

    while !rest.is_empty() {
        let end = rest.find(is_type_delimiter).unwrap_or(rest.len());
        let (path, tail) = rest.split_at(end);
        shortened.push_str(path.rsplit("::").next().unwrap_or(path));

        let mut tail = tail.chars();
        if let Some(delimiter) = tail.next() {
            shortened.push(delimiter);
        }
        rest = tail.as_str();
    }

    shortened
}

/// Suggests registered type names close to the requested one.
///
/// Names are compared without their module paths. A name containing the
/// request (or contained in it) ranks first; otherwise the edit distance
/// must stay within a third of the longer name.
pub fn suggest_similar(requested: &str, available: &[&str], max_suggestions: usize) -> Vec<String> {
    let wanted = shorten_type_name(requested).to_lowercase();

    let mut ranked: Vec<(usize, &str)> = available
        .iter()
        .copied()
        .filter(|name| *name != requested)
        .filter_map(|name| {
            let candidate = shorten_type_name(name).to_lowercase();
            let distance = if candidate.contains(&wanted) || wanted.contains(&candidate) {
                0
            } else {
                edit_distance(&candidate, &wanted)
            };
            let budget = wanted.chars().count().max(candidate.chars().count()) / 3;
            (distance <= budget).then_some((distance, name))
        })
        .collect();

    ranked.sort_unstable();
    ranked
        .into_iter()
        .take(max_suggestions)
        .map(|(_, name)| name.to_string())
        .collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
