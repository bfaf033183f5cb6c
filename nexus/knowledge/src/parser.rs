use regex::Regex;

/// Maximum titles extracted per payload.
const MAX_TITLES: usize = 10;

/// Extracts up to ten unique, cleaned titles from an HTML body.
///
/// Patterns are tried in order of specificity: story links, headings, then
/// the page title as a fallback.
#[must_use]
pub fn parse_html_titles(body: &str) -> Vec<String> {
    let patterns = [
        r#"(?is)<a[^>]+class="[^"]*titlelink[^"]*"[^>]*>(.*?)</a>"#,
        r"(?is)<h[1-3][^>]*>(.*?)</h[1-3]>",
        r"(?is)<title[^>]*>(.*?)</title>",
    ];

    let mut raw = Vec::new();
    for pattern in patterns {
        let Ok(re) = Regex::new(pattern) else { continue };
        for captures in re.captures_iter(body) {
            if let Some(m) = captures.get(1) {
                raw.push(m.as_str().to_string());
            }
        }
        if raw.len() >= MAX_TITLES {
            break;
        }
    }

    clean_titles(raw)
}

/// Extracts up to ten `<item><title>` entries from an RSS body.
#[must_use]
pub fn parse_rss_titles(body: &str) -> Vec<String> {
    let Ok(item_re) = Regex::new(r"(?is)<item[ >](.*?)</item>") else {
        return Vec::new();
    };
    let Ok(title_re) = Regex::new(r"(?is)<title[^>]*>(.*?)</title>") else {
        return Vec::new();
    };

    let mut raw = Vec::new();
    for item in item_re.captures_iter(body).take(MAX_TITLES) {
        let Some(item_body) = item.get(1) else { continue };
        if let Some(title) = title_re
            .captures(item_body.as_str())
            .and_then(|c| c.get(1))
        {
            raw.push(strip_cdata(title.as_str()));
        }
    }

    clean_titles(raw)
}

fn strip_cdata(text: &str) -> String {
    text.trim()
        .trim_start_matches("<![CDATA[")
        .trim_end_matches("]]>")
        .to_string()
}

fn clean_titles(raw: Vec<String>) -> Vec<String> {
    let tag_re = Regex::new(r"<[^>]+>").ok();
    let space_re = Regex::new(r"\s+").ok();
    let mut cleaned: Vec<String> = Vec::new();
    for title in raw {
        let mut text = title;
        if let Some(re) = &tag_re {
            text = re.replace_all(&text, "").into_owned();
        }
        if let Some(re) = &space_re {
            text = re.replace_all(&text, " ").into_owned();
        }
        let text = text.trim().to_string();
        if !text.is_empty() && !cleaned.contains(&text) {
            cleaned.push(text);
        }
        if cleaned.len() >= MAX_TITLES {
            break;
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_headings_are_extracted_and_cleaned() {
        let body = "<h1> First <b>Story</b> </h1><h2>Second</h2><h2>Second</h2>";
        let titles = parse_html_titles(body);
        assert_eq!(titles, vec!["First Story".to_string(), "Second".to_string()]);
    }

    #[test]
    fn html_falls_back_to_page_title() {
        let titles = parse_html_titles("<html><title>Only Title</title><body/></html>");
        assert_eq!(titles, vec!["Only Title".to_string()]);
    }

    #[test]
    fn rss_items_extract_titles_with_cdata() {
        let body = "<rss><channel>\
            <item><title><![CDATA[pkg 1.2.3]]></title></item>\
            <item><title>other 0.1</title></item>\
            </channel></rss>";
        let titles = parse_rss_titles(body);
        assert_eq!(titles, vec!["pkg 1.2.3".to_string(), "other 0.1".to_string()]);
    }

    #[test]
    fn caps_at_ten_titles() {
        let body: String = (0..25).map(|i| format!("<h2>Title {i}</h2>")).collect();
        assert_eq!(parse_html_titles(&body).len(), 10);
    }
}
