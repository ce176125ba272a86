// ABOUTME: normalizes raw model output into a single candidate command line.
// ABOUTME: this is cleanup only; its output must still go through PolicyEngine::evaluate.

/// Strips code-fence markup and backticks, keeps the first line, trims whitespace.
pub fn sanitize(raw: &str) -> String {
    let text = raw.trim();

    let mut lines: Vec<&str> = text.lines().collect();
    if text.starts_with("```") {
        if lines.first().is_some_and(|line| line.starts_with("```")) {
            lines.remove(0);
        }
        if lines.last().is_some_and(|line| line.trim() == "```") {
            lines.pop();
        }
    }

    let unfenced = lines.join("\n").replace('`', "");
    unfenced.lines().next().unwrap_or("").trim().to_string()
}
