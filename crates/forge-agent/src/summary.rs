//! Structural summaries and truncation for large text
//!
//! Source files are reduced to their imports, exports and declaration
//! signatures. Anything else is cut with an explicit marker so the model
//! knows content is missing.

use std::path::Path;

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "rb", "c", "h", "cc",
    "cpp", "hpp", "cs", "swift", "php", "scala",
];

const SIGNATURE_PREFIXES: &[&str] = &[
    "use ",
    "import ",
    "from ",
    "export ",
    "pub ",
    "pub(crate) ",
    "fn ",
    "async fn ",
    "async function ",
    "function ",
    "def ",
    "async def ",
    "class ",
    "interface ",
    "type ",
    "struct ",
    "enum ",
    "trait ",
    "impl ",
    "impl<",
    "mod ",
    "func ",
    "package ",
    "module.exports",
    "#include",
    "abstract class ",
    "public ",
    "protected ",
    "private ",
];

/// Whether content should be summarized structurally rather than truncated
pub fn looks_like_code(content: &str, path: Option<&str>) -> bool {
    if let Some(ext) = path
        .map(Path::new)
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
    {
        return CODE_EXTENSIONS.contains(&ext.to_lowercase().as_str());
    }

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 5 {
        return false;
    }

    let signature_lines = lines.iter().filter(|l| is_signature(l)).count();
    let brace_lines = lines
        .iter()
        .filter(|l| {
            let t = l.trim_end();
            t.ends_with('{') || t.ends_with('}') || t.ends_with(';') || t.ends_with(':')
        })
        .count();

    signature_lines * 10 >= lines.len() && brace_lines * 4 >= lines.len()
}

fn is_signature(line: &str) -> bool {
    let trimmed = line.trim_start();
    SIGNATURE_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// Imports, exports and declaration signatures, capped at `max_lines`
pub fn structural_summary(content: &str, max_lines: usize) -> String {
    let total_lines = content.lines().count();
    let signatures: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| is_signature(line))
        .collect();

    let mut out = String::new();
    out.push_str(&format!(
        "[structural summary: {} of {} lines shown]\n",
        signatures.len().min(max_lines),
        total_lines
    ));

    for (number, line) in signatures.iter().take(max_lines) {
        let line = line.trim_end().trim_end_matches('{').trim_end();
        out.push_str(&format!("{:>5}: {}\n", number + 1, line));
    }

    if signatures.len() > max_lines {
        out.push_str(&format!(
            "... and {} more declarations\n",
            signatures.len() - max_lines
        ));
    }

    out
}

/// Keep the first `max_chars` characters and note how many were dropped
pub fn truncate_with_marker(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }

    let kept: String = content.chars().take(max_chars).collect();
    format!("{}\n[truncated {} characters]", kept, total - max_chars)
}

/// Shorten content to fit `max_chars`
///
/// Code is summarized structurally; everything else is truncated. Returns
/// `None` when no shorter form exists.
pub fn compress(
    content: &str,
    path: Option<&str>,
    max_chars: usize,
    max_lines: usize,
) -> Option<String> {
    let original_chars = content.chars().count();
    if original_chars <= max_chars {
        return None;
    }

    let compressed = if looks_like_code(content, path) {
        let summary = structural_summary(content, max_lines);
        truncate_with_marker(&summary, max_chars)
    } else {
        truncate_with_marker(content, max_chars)
    };

    (compressed.chars().count() < original_chars).then_some(compressed)
}

/// Shorten a string for log lines
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
