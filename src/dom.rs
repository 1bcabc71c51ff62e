use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::context::AgentContext;
use crate::error::SnapshotError;

pub const SNAPSHOT_MAX_CHARS: usize = 6000;
pub const REF_ATTRIBUTE: &str = "data-agent-ref";

/// Injected into the page to build a structural snapshot.
///
/// The script:
///   1. Clears every `data-agent-ref` left by the previous snapshot.
///   2. Walks visible elements (max depth 25, max 300 nodes), skipping
///      script/style/svg subtrees.
///   3. Tags interactive elements and labelled landmarks with
///      `data-agent-ref="s<gen>-e<n>"`.
///   4. Returns a JSON string `{url, title, nodes: [{ref, role, name, tag}]}`.
const SNAPSHOT_JS: &str = r#"
(() => {
  const GEN = __GENERATION__;
  const ATTR = 'data-agent-ref';
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META','TEMPLATE']);
  const WIDGET_ROLES = new Set(['button','link','checkbox','radio','switch','tab','menuitem','option','combobox','textbox','searchbox','slider']);
  const IMPLICIT = {A:'link',BUTTON:'button',SELECT:'combobox',TEXTAREA:'textbox',H1:'heading',H2:'heading',H3:'heading',H4:'heading',H5:'heading',H6:'heading',DIALOG:'dialog',IMG:'img'};
  const nodes = [];
  let id = 0;

  document.querySelectorAll('[' + ATTR + ']').forEach(el => el.removeAttribute(ATTR));

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && getComputedStyle(el).position !== 'fixed') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function roleOf(el) {
    const explicit = el.getAttribute('role');
    if (explicit) return explicit;
    if (el.tagName === 'INPUT') {
      const t = (el.type || 'text').toLowerCase();
      if (t === 'checkbox' || t === 'radio') return t;
      if (t === 'submit' || t === 'button') return 'button';
      return 'textbox';
    }
    if (el.isContentEditable) return 'textbox';
    return IMPLICIT[el.tagName] || '';
  }

  function nameOf(el) {
    const label = el.getAttribute('aria-label')
      || (el.labels && el.labels[0] && el.labels[0].textContent)
      || el.getAttribute('placeholder')
      || el.getAttribute('alt')
      || el.getAttribute('title')
      || (el.tagName === 'INPUT' ? el.value : '')
      || el.textContent
      || '';
    return label.replace(/\s+/g, ' ').trim().slice(0, 80);
  }

  function walk(node, depth) {
    if (depth > 25 || nodes.length >= 300) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const role = roleOf(child);
      const interactive = WIDGET_ROLES.has(role) || ['A','BUTTON','INPUT','SELECT','TEXTAREA'].includes(child.tagName);
      const labelled = role === 'heading' || role === 'dialog' || child.hasAttribute('aria-label');
      if (interactive || labelled) {
        const ref = 's' + GEN + '-e' + (id++);
        child.setAttribute(ATTR, ref);
        nodes.push({ ref, role: role || child.tagName.toLowerCase(), name: nameOf(child), tag: child.tagName.toLowerCase() });
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return JSON.stringify({ url: location.href, title: document.title, nodes });
})()
"#;

/// How to get from a snapshot node back to a live element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorStrategy {
    pub selector: String,
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub role: String,
    pub name: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub locator: LocatorStrategy,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub url: String,
    pub title: String,
    pub nodes: Vec<SnapshotNode>,
}

impl Snapshot {
    /// One line per node, in the shape the model sees.
    pub fn render(&self) -> String {
        let mut out = format!("URL: {}\nTitle: {}\n", self.url, self.title);
        if self.nodes.is_empty() {
            out.push_str("(no interactive elements found)\n");
        }
        for node in &self.nodes {
            out.push_str(&format!("[{}] {} \"{}\"\n", node.reference, node.role, node.name));
        }
        truncate_chars(&out, SNAPSHOT_MAX_CHARS)
    }
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    nodes: Vec<RawNode>,
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(rename = "ref")]
    reference: String,
    role: String,
    #[serde(default)]
    name: String,
}

pub fn snapshot_script(generation: u64) -> String {
    SNAPSHOT_JS.replace("__GENERATION__", &generation.to_string())
}

/// Capture a fresh snapshot and make its refs the only valid ones in `ctx`.
///
/// The previous ref map is dropped before the page is touched, so even a
/// failed capture leaves no stale refs behind.
pub async fn capture_snapshot(ctx: &mut AgentContext) -> Result<Snapshot> {
    ctx.snapshot_generation += 1;
    ctx.snapshot_refs.clear();
    let generation = ctx.snapshot_generation;

    let raw = ctx
        .page
        .evaluate(&snapshot_script(generation), false)
        .await
        .context("snapshot script failed")?;
    let snapshot = parse_snapshot(generation, &raw)?;

    ctx.snapshot_refs = snapshot
        .nodes
        .iter()
        .map(|node| (node.reference.clone(), node.clone()))
        .collect::<HashMap<_, _>>();

    debug!(generation, nodes = snapshot.nodes.len(), "Captured page snapshot");
    Ok(snapshot)
}

pub fn parse_snapshot(generation: u64, raw: &serde_json::Value) -> Result<Snapshot, SnapshotError> {
    let text = raw
        .as_str()
        .ok_or_else(|| SnapshotError::Malformed(format!("expected a JSON string, got {raw}")))?;
    let parsed: RawSnapshot =
        serde_json::from_str(text).map_err(|e| SnapshotError::Malformed(e.to_string()))?;

    let prefix = format!("s{generation}-");
    let mut nodes = Vec::with_capacity(parsed.nodes.len());
    for raw_node in parsed.nodes {
        if !raw_node.reference.starts_with(&prefix) {
            return Err(SnapshotError::Malformed(format!(
                "ref {} does not belong to snapshot {generation}",
                raw_node.reference
            )));
        }
        nodes.push(SnapshotNode {
            locator: LocatorStrategy {
                selector: format!("[{REF_ATTRIBUTE}=\"{}\"]", raw_node.reference),
                role: raw_node.role.clone(),
                name: raw_node.name.clone(),
            },
            role: raw_node.role,
            name: raw_node.name,
            reference: raw_node.reference,
        });
    }

    Ok(Snapshot {
        generation,
        url: parsed.url,
        title: parsed.title,
        nodes,
    })
}

/// `s12-e4` -> `Some(12)`.
pub fn parse_ref_generation(reference: &str) -> Option<u64> {
    let (generation, element) = reference.strip_prefix('s')?.split_once("-e")?;
    element.parse::<u64>().ok()?;
    generation.parse().ok()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!(
            "{}\n... [truncated, {} total chars]",
            &text[..cut],
            text.chars().count()
        ),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(generation: u64) -> serde_json::Value {
        json!(
            json!({
                "url": "https://app.example/",
                "title": "Example dApp",
                "nodes": [
                    {"ref": format!("s{generation}-e0"), "role": "button", "name": "Connect Wallet", "tag": "button"},
                    {"ref": format!("s{generation}-e1"), "role": "textbox", "name": "Amount", "tag": "input"},
                ]
            })
            .to_string()
        )
    }

    #[test]
    fn parses_nodes_into_locators() {
        let snapshot = parse_snapshot(3, &payload(3)).unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes[0].reference, "s3-e0");
        assert_eq!(snapshot.nodes[0].locator.selector, "[data-agent-ref=\"s3-e0\"]");
        assert!(snapshot.render().contains("[s3-e1] textbox \"Amount\""));
    }

    #[test]
    fn rejects_refs_from_another_generation() {
        let err = parse_snapshot(4, &payload(3)).unwrap_err();
        assert!(matches!(err, SnapshotError::Malformed(_)));
    }

    #[test]
    fn rejects_non_string_payloads() {
        assert!(parse_snapshot(1, &serde_json::Value::Null).is_err());
    }

    #[test]
    fn ref_generation_parsing() {
        assert_eq!(parse_ref_generation("s12-e4"), Some(12));
        assert_eq!(parse_ref_generation("e4"), None);
        assert_eq!(parse_ref_generation("s1-ex"), None);
    }

    #[test]
    fn script_embeds_generation() {
        let script = snapshot_script(9);
        assert!(script.contains("const GEN = 9;"));
        assert!(script.contains(REF_ATTRIBUTE));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let cut = truncate_chars(&text, 4);
        assert!(cut.starts_with("éééé\n"));
        assert!(cut.contains("10 total chars"));
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
