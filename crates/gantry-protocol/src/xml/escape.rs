use std::borrow::Cow;

/// 转义文本与属性值中的 XML 特殊字符。
pub fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// `<name>text</name>`，文本已转义。
pub fn text_element(name: &str, text: &str) -> String {
    format!("<{name}>{}</{name}>", escape(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::unescape;

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(escape("scan"), Cow::Borrowed("scan")));
    }

    #[test]
    fn escaped_text_unescapes_back() {
        let original = r#"a<b & "c" 'd'>"#;
        assert_eq!(unescape(&escape(original)).unwrap(), original);
        assert_eq!(text_element("name", "x&y"), "<name>x&amp;y</name>");
    }
}
