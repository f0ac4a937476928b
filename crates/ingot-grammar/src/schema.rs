//! Tool-catalog normalization and parsing.
//!
//! The catalog arrives as an OpenAI function-calling array:
//!
//! ```json
//! [{"type":"function","function":{"name":"get_weather","description":"…",
//!   "parameters":{"type":"object","properties":{…},"required":[…]}}}]
//! ```
//!
//! Parsing is a streaming byte scan built on three primitives: whitespace
//! skipping, quoted-string extraction with backslash escapes, and balanced
//! `{}`/`[]` matching that ignores braces inside string literals. A malformed
//! tool entry is dropped and the scan continues with the rest of the array.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single parameter of a tool, as declared in the catalog.
///
/// `ty` is kept as the raw schema string; unknown types fall through to the
/// generic JSON value rule during grammar synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParam {
    /// Parameter name, exactly as declared.
    pub name: String,
    /// Declared JSON-schema type (`string`, `number`, `integer`, `boolean`,
    /// `object`, `array`), or whatever the catalog said for unknown types.
    pub ty: String,
    /// Enum alternatives, in declaration order. Empty when the parameter is
    /// not an enum.
    pub enum_values: Vec<String>,
}

/// A parsed tool descriptor.
///
/// Parameter declaration order is preserved: grammar synthesis depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (`[A-Za-z0-9_]+`).
    pub name: String,
    /// Human-readable description from the catalog.
    pub description: String,
    /// Parameters in declaration order.
    pub params: Vec<ToolParam>,
    /// Names of required parameters.
    pub required: Vec<String>,
}

impl ToolSpec {
    /// Whether `param` is listed as required.
    pub fn is_required(&self, param: &str) -> bool {
        self.required.iter().any(|r| r == param)
    }
}

// ============================================================================
// SCANNER PRIMITIVES
// ============================================================================

fn skip_ws(b: &[u8], mut i: usize) -> usize {
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Scan a double-quoted string starting at `i` (which must point at `"`).
///
/// Returns the index one past the closing quote. Escaped quotes and
/// backslashes are honored; the string content is left byte-for-byte as it
/// appeared in the input.
fn scan_string(b: &[u8], i: usize) -> Option<usize> {
    if b.get(i) != Some(&b'"') {
        return None;
    }
    let mut j = i + 1;
    while j < b.len() {
        match b[j] {
            b'\\' => j += 2,
            b'"' => return Some(j + 1),
            _ => j += 1,
        }
    }
    None
}

/// Raw content of the string starting at `i`, without the surrounding quotes.
fn string_content(b: &[u8], i: usize) -> Option<(&str, usize)> {
    let end = scan_string(b, i)?;
    std::str::from_utf8(&b[i + 1..end - 1]).ok().map(|s| (s, end))
}

/// Find the close matching the `{` or `[` at `open`, skipping string
/// literals. Returns the index of the closing byte.
fn find_matching(b: &[u8], open: usize) -> Option<usize> {
    let (op, cl) = match b.get(open)? {
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut i = open;
    while i < b.len() {
        match b[i] {
            b'"' => {
                i = scan_string(b, i)?;
                continue;
            }
            c if c == op => depth += 1,
            c if c == cl => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Span of the value starting at `i`: `(start, one_past_end)`.
fn scan_value(b: &[u8], i: usize) -> Option<(usize, usize)> {
    match b.get(i)? {
        b'{' | b'[' => {
            let end = find_matching(b, i)?;
            Some((i, end + 1))
        }
        b'"' => Some((i, scan_string(b, i)?)),
        _ => {
            // Bare literal: number, true, false, null. Runs to the next
            // delimiter at this nesting level.
            let mut j = i;
            while j < b.len() && !matches!(b[j], b',' | b'}' | b']') && !b[j].is_ascii_whitespace() {
                j += 1;
            }
            if j == i {
                None
            } else {
                Some((i, j))
            }
        }
    }
}

/// Iterate the top-level members of the object spanning `start..=end`,
/// yielding `(key, value_start, value_end)` in declaration order.
fn object_members(b: &[u8], start: usize, end: usize) -> Option<Vec<(String, usize, usize)>> {
    if b.get(start) != Some(&b'{') {
        return None;
    }
    let mut out = Vec::new();
    let mut i = skip_ws(b, start + 1);
    if b.get(i) == Some(&b'}') {
        return Some(out);
    }
    loop {
        let (key, after_key) = string_content(b, i)?;
        let colon = skip_ws(b, after_key);
        if b.get(colon) != Some(&b':') {
            return None;
        }
        let vstart = skip_ws(b, colon + 1);
        let (vs, ve) = scan_value(b, vstart)?;
        out.push((key.to_string(), vs, ve));
        i = skip_ws(b, ve);
        match b.get(i) {
            Some(&b',') => i = skip_ws(b, i + 1),
            Some(&b'}') if i <= end => return Some(out),
            _ => return None,
        }
    }
}

/// String elements of the array spanning `start..=end`, in order.
fn string_array_elements(b: &[u8], start: usize) -> Option<Vec<String>> {
    if b.get(start) != Some(&b'[') {
        return None;
    }
    let end = find_matching(b, start)?;
    let mut out = Vec::new();
    let mut i = skip_ws(b, start + 1);
    while i < end {
        if b[i] == b'"' {
            let (s, after) = string_content(b, i)?;
            out.push(s.to_string());
            i = skip_ws(b, after);
        } else {
            // Non-string element: skip it whole.
            let (_, after) = scan_value(b, i)?;
            i = skip_ws(b, after);
        }
        if b.get(i) == Some(&b',') {
            i = skip_ws(b, i + 1);
        }
    }
    Some(out)
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Unwrap doubly-nested `function` values.
///
/// Some callers produce
/// `{"type":"function","function":{"type":"function","function":{…}}}`;
/// the inner payload is hoisted so the rest of the pipeline only ever sees
/// the plain OpenAI shape. Unwrapping runs to a fixpoint per site, so the
/// function is idempotent, and input that is not doubly wrapped is returned
/// byte-for-byte unchanged.
pub fn normalize_tools_json(tools_json: &str) -> String {
    let b = tools_json.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(b.len());
    let mut i = 0usize;

    while i < b.len() {
        if b[i] != b'"' {
            out.push(b[i]);
            i += 1;
            continue;
        }
        let Some((content, after)) = string_content(b, i) else {
            // Unterminated string: copy the remainder verbatim and stop.
            out.extend_from_slice(&b[i..]);
            break;
        };
        if content != "function" {
            out.extend_from_slice(&b[i..after]);
            i = after;
            continue;
        }
        let colon = skip_ws(b, after);
        if b.get(colon) != Some(&b':') {
            out.extend_from_slice(&b[i..after]);
            i = after;
            continue;
        }
        let vstart = skip_ws(b, colon + 1);
        if b.get(vstart) != Some(&b'{') {
            out.extend_from_slice(&b[i..after]);
            i = after;
            continue;
        }
        let Some(vend) = find_matching(b, vstart) else {
            out.extend_from_slice(&b[i..]);
            break;
        };

        // Chase nested `"function": { … }` members down to the innermost
        // object so one pass converges.
        let (mut vs, mut ve) = (vstart, vend);
        while let Some((ivs, ive)) = inner_function_object(b, vs, ve) {
            vs = ivs;
            ve = ive;
        }

        out.extend_from_slice(&b[i..vstart]);
        out.extend_from_slice(&b[vs..=ve]);
        i = vend + 1;
    }

    // Only verbatim slices of the input were rearranged, so this cannot
    // actually fail on valid UTF-8 input.
    String::from_utf8(out).unwrap_or_else(|_| tools_json.to_string())
}

/// If the object spanning `start..=end` has a top-level `function` member
/// whose value is an object, return that value's span.
fn inner_function_object(b: &[u8], start: usize, end: usize) -> Option<(usize, usize)> {
    let members = object_members(b, start, end)?;
    members.iter().find_map(|(key, vs, ve)| {
        (key == "function" && b.get(*vs) == Some(&b'{')).then_some((*vs, *ve - 1))
    })
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse an OpenAI-format tool array into [`ToolSpec`]s.
///
/// The input is normalized first. Entries that cannot be parsed (unterminated
/// strings, unbalanced braces, missing `name`) are dropped with a warning;
/// the returned list may therefore be empty, which downstream grammar
/// synthesis treats as "no typed grammar".
pub fn parse_tools(tools_json: &str) -> Vec<ToolSpec> {
    let normalized = normalize_tools_json(tools_json);
    let b = normalized.as_bytes();

    let start = skip_ws(b, 0);
    if b.get(start) != Some(&b'[') {
        return Vec::new();
    }
    let Some(end) = find_matching(b, start) else {
        return Vec::new();
    };

    let mut tools = Vec::new();
    let mut i = skip_ws(b, start + 1);
    while i < end {
        if b[i] != b'{' {
            break;
        }
        let Some(obj_end) = find_matching(b, i) else {
            break;
        };
        match parse_tool(b, i, obj_end) {
            Some(tool) => tools.push(tool),
            None => warn!("dropping malformed tool entry from catalog"),
        }
        i = skip_ws(b, obj_end + 1);
        if b.get(i) == Some(&b',') {
            i = skip_ws(b, i + 1);
        }
    }
    tools
}

fn parse_tool(b: &[u8], start: usize, end: usize) -> Option<ToolSpec> {
    let members = object_members(b, start, end)?;
    let (_, fs, fe) = members.iter().find(|(k, vs, _)| k == "function" && b[*vs] == b'{')?;
    let function = object_members(b, *fs, *fe - 1)?;

    let mut name = None;
    let mut description = String::new();
    let mut params = Vec::new();
    let mut required = Vec::new();

    for (key, vs, ve) in &function {
        match key.as_str() {
            "name" => name = string_content(b, *vs).map(|(s, _)| s.to_string()),
            "description" => {
                if let Some((s, _)) = string_content(b, *vs) {
                    description = s.to_string();
                }
            }
            "parameters" => {
                let parameters = object_members(b, *vs, *ve - 1)?;
                for (pkey, pvs, pve) in &parameters {
                    match pkey.as_str() {
                        "properties" => params = parse_properties(b, *pvs, *pve - 1)?,
                        "required" => required = string_array_elements(b, *pvs)?,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let name = name?;
    if name.is_empty() {
        return None;
    }
    Some(ToolSpec {
        name,
        description,
        params,
        required,
    })
}

fn parse_properties(b: &[u8], start: usize, end: usize) -> Option<Vec<ToolParam>> {
    let members = object_members(b, start, end)?;
    let mut params = Vec::with_capacity(members.len());
    for (pname, vs, ve) in members {
        if b.get(vs) != Some(&b'{') {
            return None;
        }
        let mut ty = String::new();
        let mut enum_values = Vec::new();
        for (key, avs, _ave) in object_members(b, vs, ve - 1)? {
            match key.as_str() {
                "type" => {
                    if let Some((s, _)) = string_content(b, avs) {
                        ty = s.to_string();
                    }
                }
                "enum" => enum_values = string_array_elements(b, avs)?,
                _ => {}
            }
        }
        params.push(ToolParam {
            name: pname,
            ty,
            enum_values,
        });
    }
    Some(params)
}

/// Extract tool names with a cheap key scan, without full parsing.
///
/// Used by the generic fallback grammar and by enable-time catalog
/// validation; picks up every `"name"` key in the payload.
pub fn extract_tool_names(tools_json: &str) -> Vec<String> {
    let b = tools_json.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < b.len() {
        if b[i] != b'"' {
            i += 1;
            continue;
        }
        let Some((content, after)) = string_content(b, i) else {
            break;
        };
        i = after;
        if content != "name" {
            continue;
        }
        let colon = skip_ws(b, i);
        if b.get(colon) != Some(&b':') {
            continue;
        }
        let vstart = skip_ws(b, colon + 1);
        if let Some((value, after_value)) = string_content(b, vstart) {
            out.push(value.to_string());
            i = after_value;
        }
    }
    out
}
