//! `{{variable}}` rendering for sequence templates and ice-breaker insertion.

use crate::models::ContactWithEstablishment;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").ok()).as_ref()
}

fn greeting_paragraph_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<p(?:\s[^>]*)?>.*?Bonjour.*?</p>").ok())
        .as_ref()
}

/// Replaces every `{{key}}` whose key is in `vars`. Unknown placeholders are left as is.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let Some(re) = placeholder_regex() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Template variables for a contact. Missing values render as empty strings.
pub fn contact_variables(contact: &ContactWithEstablishment) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    vars.insert("prenom".to_string(), opt(&contact.first_name));
    vars.insert("nom".to_string(), opt(&contact.last_name));
    vars.insert("poste".to_string(), contact.role.clone());
    vars.insert(
        "nom_etablissement".to_string(),
        contact.establishment_name.clone(),
    );
    vars.insert(
        "etablissement".to_string(),
        contact.establishment_name.clone(),
    );
    vars.insert("type".to_string(), contact.establishment_category.clone());
    vars.insert(
        "type_etablissement".to_string(),
        contact.establishment_category.clone(),
    );
    vars.insert("ville".to_string(), opt(&contact.city));
    vars.insert("icebreaker".to_string(), opt(&contact.icebreaker));
    vars
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Places the ice breaker right after the greeting paragraph, or at the top
/// when the body has no `<p>` containing "Bonjour".
pub fn insert_icebreaker(html: &str, icebreaker: &str) -> String {
    let paragraph = format!(
        r#"<p style="color: #374151; margin-bottom: 16px;">{}</p>"#,
        escape_html(icebreaker.trim())
    );

    match greeting_paragraph_regex().and_then(|re| re.find(html)) {
        Some(m) => {
            let mut out = String::with_capacity(html.len() + paragraph.len());
            out.push_str(&html[..m.end()]);
            out.push_str(&paragraph);
            out.push_str(&html[m.end()..]);
            out
        }
        None => format!("{}{}", paragraph, html),
    }
}

/// Plain-text alternative for an HTML body.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag.trim_start_matches('/').to_ascii_lowercase();
                if name.starts_with("br") || name == "p" || name.starts_with("p ") {
                    out.push('\n');
                }
            }
            _ if in_tag => tag.push(c),
            _ => out.push(c),
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_all_occurrences() {
        let out = render_template(
            "{{prenom}}, {{prenom}} de {{nom_etablissement}}",
            &vars(&[("prenom", "Anne"), ("nom_etablissement", "EHPAD Ham")]),
        );
        assert_eq!(out, "Anne, Anne de EHPAD Ham");
    }

    #[test]
    fn unknown_placeholders_survive_and_empty_values_blank() {
        let out = render_template("{{prenom}}|{{inconnu}}", &vars(&[("prenom", "")]));
        assert_eq!(out, "|{{inconnu}}");
    }

    #[test]
    fn icebreaker_goes_after_greeting() {
        let html = "<p>Bonjour Anne,</p><p>Suite.</p>";
        let out = insert_icebreaker(html, "Bravo pour le projet.");
        assert_eq!(
            out,
            "<p>Bonjour Anne,</p><p style=\"color: #374151; margin-bottom: 16px;\">Bravo pour le projet.</p><p>Suite.</p>"
        );
    }

    #[test]
    fn icebreaker_greeting_match_is_case_insensitive_and_multiline() {
        let html = "<p class=\"x\">\nbonjour,\n</p><p>Suite.</p>";
        let out = insert_icebreaker(html, "Hi");
        assert!(out.starts_with("<p class=\"x\">\nbonjour,\n</p><p style="));
    }

    #[test]
    fn greeting_must_be_a_paragraph() {
        let html = "<pre>Bonjour</pre><p>Merci de votre retour.</p>";
        let out = insert_icebreaker(html, "Hi");
        assert!(out.starts_with("<p style=\"color: #374151; margin-bottom: 16px;\">Hi</p><pre>"));
        assert!(out.ends_with("<p>Merci de votre retour.</p>"));
    }

    #[test]
    fn icebreaker_prepended_without_greeting() {
        let out = insert_icebreaker("<div>Madame,</div>", "A & B");
        assert!(out.starts_with("<p style=\"color: #374151; margin-bottom: 16px;\">A &amp; B</p>"));
        assert!(out.ends_with("<div>Madame,</div>"));
    }

    #[test]
    fn text_alternative() {
        let text = html_to_text("<p>Bonjour,</p><p>Ligne 1<br>Ligne 2 &amp; fin</p>");
        assert_eq!(text, "Bonjour,\nLigne 1\nLigne 2 & fin");
    }
}
