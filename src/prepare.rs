//! CSS reset injection for post documents
//!
//! Rendered canvases must start at the top-left pixel with no scrollbars, so
//! every document gets a small reset stylesheet before it reaches the engine.
//! Placement prefers `</head>`, then just inside `<body ...>`, and finally the
//! very start of the document. Malformed markup still gets the reset; it may
//! land somewhere a validator would reject, which browsers tolerate.

/// The reset block inserted into every rendered document
pub const CSS_RESET: &str = "<style>html,body{margin:0;padding:0;overflow:hidden;}</style>";

/// Return `html` with [`CSS_RESET`] inserted exactly once.
pub fn inject_reset(html: &str) -> String {
    let mut out = String::with_capacity(html.len() + CSS_RESET.len() + 2);

    if let Some(idx) = find_ascii_ci(html, "</head>") {
        out.push_str(&html[..idx]);
        out.push_str(CSS_RESET);
        out.push('\n');
        out.push_str(&html[idx..]);
        return out;
    }

    if let Some(idx) = find_ascii_ci(html, "<body") {
        if let Some(end) = html[idx..].find('>') {
            let pos = idx + end + 1;
            out.push_str(&html[..pos]);
            out.push('\n');
            out.push_str(CSS_RESET);
            out.push('\n');
            out.push_str(&html[pos..]);
            return out;
        }
    }

    out.push_str(CSS_RESET);
    out.push('\n');
    out.push_str(html);
    out
}

// ASCII-only case folding keeps byte offsets valid for any UTF-8 input.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let pat = needle.as_bytes();
    if pat.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - pat.len()).find(|&i| hay[i..i + pat.len()].eq_ignore_ascii_case(pat))
}
