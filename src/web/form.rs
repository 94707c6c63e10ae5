/// Renders the captcha HTML fragment: a title-cased tag header,
/// a 3x3 grid of labeled checkboxes each wrapping an inline thumbnail, and
/// a hidden field carrying the base64-encoded captcha id. No templating
/// crate is pulled in for this; static assets are served as plain
/// `include_str!` strings elsewhere, so the captcha markup follows the same
/// "just format a string" idiom rather than reaching for a template engine.
pub fn render_form(
    tag: &str,
    images: &[String],
    id_b64: &str,
    color: Option<&str>,
    background: Option<&str>,
) -> String {
    let header = human_tag(tag);
    let style = inline_style(color, background);

    let mut cells = String::new();
    for (i, image) in images.iter().enumerate() {
        cells.push_str(&format!(
            "<label class=\"captchouli-cell\">\
               <input type=\"checkbox\" name=\"captchouli-{i}\">\
               <img src=\"{image}\" alt=\"\">\
             </label>\n"
        ));
    }

    format!(
        "<form class=\"captchouli-form\" method=\"post\"{style}>\n\
           <h3 class=\"captchouli-header\">{header}</h3>\n\
           <div class=\"captchouli-grid\">\n{cells}</div>\n\
           <input type=\"hidden\" name=\"captchouli-id\" value=\"{id_b64}\">\n\
           <button type=\"submit\">Verify</button>\n\
         </form>\n"
    )
}

/// Turns a tag like `patchouli_knowledge` into `Patchouli Knowledge` for
/// display. Tags starting with `;`, `:`, or `=` are markers rather than
/// ordinary words and are shown verbatim, underscores replaced but not
/// title-cased.
pub fn human_tag(tag: &str) -> String {
    let spaced = tag.replace('_', " ");
    if tag.starts_with(';') || tag.starts_with(':') || tag.starts_with('=') {
        return spaced;
    }
    spaced
        .split(' ')
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// `captchouli-color`/`captchouli-background` are untrusted query
/// parameters embedded directly into a `style` attribute; restrict them to
/// a CSS-color-safe charset (hex digits, letters, `(),.% -`) rather than
/// attempting to escape arbitrary input, closing off attribute-breakout
/// and CSS injection.
fn sanitize_style_value(value: &str) -> Option<String> {
    let safe = value.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '#' | '(' | ')' | ',' | '.' | '%' | ' ' | '-')
    });
    if safe && !value.is_empty() && value.len() <= 64 {
        Some(value.to_string())
    } else {
        None
    }
}

fn inline_style(color: Option<&str>, background: Option<&str>) -> String {
    let mut decls = Vec::new();
    if let Some(c) = color.and_then(sanitize_style_value) {
        decls.push(format!("--captchouli-color:{c}"));
    }
    if let Some(b) = background.and_then(sanitize_style_value) {
        decls.push(format!("--captchouli-background:{b}"));
    }
    if decls.is_empty() {
        String::new()
    } else {
        format!(" style=\"{};\"", decls.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_tag_title_cases_underscored_words() {
        assert_eq!(human_tag("patchouli_knowledge"), "Patchouli Knowledge");
    }

    #[test]
    fn human_tag_leaves_marker_prefixed_tags_alone() {
        assert_eq!(human_tag(";marker_tag"), ";marker tag");
        assert_eq!(human_tag(":marker_tag"), ":marker tag");
        assert_eq!(human_tag("=marker_tag"), "=marker tag");
    }

    #[test]
    fn render_form_embeds_hidden_id_and_one_cell_per_image() {
        let images = vec!["data:image/jpeg;base64,AAA".to_string(); 9];
        let html = render_form("cirno", &images, "ZmFrZS1pZA==", None, None);
        assert_eq!(html.matches("captchouli-cell").count(), 9);
        assert!(html.contains("value=\"ZmFrZS1pZA==\""));
        assert!(html.contains("Cirno"));
    }

    #[test]
    fn inline_style_rejects_unsafe_characters() {
        let images = vec!["data:image/jpeg;base64,AAA".to_string(); 9];
        let html = render_form(
            "cirno",
            &images,
            "id",
            Some("red\"></form><script>"),
            None,
        );
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn inline_style_accepts_css_colors() {
        let images = vec!["data:image/jpeg;base64,AAA".to_string(); 9];
        let html = render_form("cirno", &images, "id", Some("#ff0000"), Some("rgb(0,0,0)"));
        assert!(html.contains("--captchouli-color:#ff0000"));
        assert!(html.contains("--captchouli-background:rgb(0,0,0)"));
    }
}
