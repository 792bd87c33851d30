//! Selector parsing, encoding, and candidate synthesis.
//!
//! The optimizer derives an [`ElementDescriptor`] from the locator call that
//! failed (`getByTestId('save')`, `getByRole('button', { name: 'Save' })`),
//! the locator agent scores descriptors into CSS-flavored candidate
//! selectors, and the optimizer converts the winning candidate back into a
//! locator call when rewriting the test file.

use serde::{Deserialize, Serialize};

/// Attributes describing a page element, used to synthesize selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    #[serde(default, rename = "data-testid", skip_serializing_if = "Option::is_none")]
    pub data_testid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// Extract the first single-quoted argument after `needle(` in `source`.
fn quoted_arg(source: &str, needle: &str) -> Option<String> {
    let start = source.find(needle)? + needle.len();
    let rest = &source[start..];
    let open = rest.find('\'')? + 1;
    let close = rest[open..].find('\'')? + open;
    Some(rest[open..close].to_string())
}

/// Derive an element descriptor from a failing locator call.
///
/// Recognized forms:
/// - `getByTestId('X')` -> `{data-testid: X}`
/// - `getByRole('r')` / `getByRole('r', { name: 'N' })` -> `{role, name?}`
/// - `getByText('T')` -> `{text: T}`
///
/// Anything else falls back to a bare `header` tag so that the structural
/// landmark candidates still apply.
pub fn descriptor_from_selector(selector: &str) -> ElementDescriptor {
    if let Some(testid) = quoted_arg(selector, "getByTestId(") {
        return ElementDescriptor {
            data_testid: Some(testid),
            ..Default::default()
        };
    }
    if let Some(role) = quoted_arg(selector, "getByRole(") {
        // A second quoted argument after `name:` is the accessible name.
        let name = selector
            .find("name:")
            .and_then(|pos| quoted_arg(&selector[pos..], "name:"));
        return ElementDescriptor {
            role: Some(role),
            name,
            ..Default::default()
        };
    }
    if let Some(text) = quoted_arg(selector, "getByText(") {
        return ElementDescriptor {
            text: Some(text),
            ..Default::default()
        };
    }
    ElementDescriptor {
        tag: Some("header".to_string()),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Selector encoding
// ---------------------------------------------------------------------------

/// Escape double quotes for use inside a bracketed attribute value.
pub fn escape_attr_value(value: &str) -> String {
    value.replace('"', "\\\"")
}

/// CSS-escape non-alphanumeric characters (other than `-` and `_`) in an
/// identifier for use in `#id` / `.class` selectors.
pub fn css_escape_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len());
    for c in ident.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// `[data-testid="value"]`
pub fn testid_selector(value: &str) -> String {
    format!("[data-testid=\"{}\"]", escape_attr_value(value))
}

/// `role=button[name="Save"]` or `role=banner`
pub fn role_selector(role: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("role={role}[name=\"{}\"]", escape_attr_value(name)),
        None => format!("role={role}"),
    }
}

/// `#save`
pub fn id_selector(id: &str) -> String {
    format!("#{}", css_escape_ident(id))
}

/// `text="Save changes"`
pub fn text_selector(text: &str) -> String {
    format!("text=\"{}\"", escape_attr_value(text))
}

/// `button.primary` (tag with the first class only)
pub fn tag_class_selector(tag: &str, class: &str) -> Option<String> {
    let first = class.split_whitespace().next()?;
    Some(format!("{tag}.{}", css_escape_ident(first)))
}

// ---------------------------------------------------------------------------
// Candidate synthesis
// ---------------------------------------------------------------------------

/// Structural landmark roles tried when nothing better is known.
const LANDMARK_ROLES: [&str; 2] = ["banner", "navigation"];

/// Compute the deterministic fallback candidate list for an element.
///
/// Preference order: `data-testid`, `role`, `tag`, then structural
/// landmarks (banner, navigation, header). The original selector is
/// excluded and the list is deduped, preserving order.
pub fn fallback_candidates(element: &ElementDescriptor, original_selector: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    if let Some(testid) = &element.data_testid {
        out.push(testid_selector(testid));
    }
    if let Some(role) = &element.role {
        out.push(role_selector(role, element.name.as_deref()));
    }
    if let Some(tag) = &element.tag {
        out.push(tag.clone());
    }
    for role in LANDMARK_ROLES {
        out.push(role_selector(role, None));
    }
    out.push("header".to_string());

    let mut seen = std::collections::HashSet::new();
    out.retain(|candidate| {
        candidate != original_selector
            && selector_to_locator_call(candidate) != original_selector
            && seen.insert(candidate.clone())
    });
    out
}

/// Convert a candidate selector into the locator call written into the test
/// file.
///
/// - `[data-testid="X"]` -> `getByTestId('X')`
/// - `role=r[name="N"]` -> `getByRole('r', { name: 'N' })`
/// - `role=r` -> `getByRole('r')`
/// - `text="T"` -> `getByText('T')`
/// - anything else -> `locator('...')`
pub fn selector_to_locator_call(selector: &str) -> String {
    if let Some(rest) = selector.strip_prefix("[data-testid=\"") {
        if let Some(value) = rest.strip_suffix("\"]") {
            return format!("getByTestId('{}')", value.replace("\\\"", "\""));
        }
    }
    if let Some(rest) = selector.strip_prefix("role=") {
        if let Some((role, name_part)) = rest.split_once("[name=\"") {
            if let Some(name) = name_part.strip_suffix("\"]") {
                return format!(
                    "getByRole('{role}', {{ name: '{}' }})",
                    name.replace("\\\"", "\"")
                );
            }
        }
        return format!("getByRole('{rest}')");
    }
    if let Some(rest) = selector.strip_prefix("text=\"") {
        if let Some(text) = rest.strip_suffix('"') {
            return format!("getByText('{}')", text.replace("\\\"", "\""));
        }
    }
    format!("locator('{selector}')")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
