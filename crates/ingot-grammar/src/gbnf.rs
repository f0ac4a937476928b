//! GBNF grammar synthesis for the tool-call envelope.
//!
//! Two builders share the same envelope rules:
//!
//! - [`typed_tool_grammar`] pins per-tool parameter names, ordering, types,
//!   and enum literals. Required parameters appear in declaration order;
//!   optional parameters form a nested group that admits exactly the
//!   declaration-order prefixes.
//! - [`generic_tool_grammar`] pins only the envelope and the set of known
//!   tool names, leaving `arguments` as an opaque JSON object. It is the
//!   fallback when no typed grammar can be produced.
//!
//! Rule identifiers are index-based (`call-0`, `args-0`, `kv-0-1`) so tool
//! names never need to be sanitized into GBNF identifiers.

use crate::schema::{ToolParam, ToolSpec};

/// Shared JSON productions appended to every generated grammar.
const JSON_TERMINALS: &str = r#"object ::= "{" ws "}" | "{" ws member (ws "," ws member)* ws "}"
member ::= string ws ":" ws value
array ::= "[" ws "]" | "[" ws value (ws "," ws value)* ws "]"
value ::= string | number | object | array | "true" | "false" | "null"
string ::= "\"" ([^"\\\n] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]))* "\""
number ::= "-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?
ws ::= [ \t\n\r]*
"#;

const ENVELOPE: &str = "root ::= ws toolcall ws\ntoolcall ::= \"{\" ws \"\\\"tool_calls\\\"\" ws \":\" ws \"[\" ws call ws \"]\" ws \"}\"\n";

/// Escape a string for inclusion inside a JSON string literal.
fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + s.len() / 4);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// A JSON string literal for `s`, expressed as a GBNF terminal.
///
/// `get_weather` becomes the terminal `"\"get_weather\""`: the inner quotes
/// are part of the matched text, the outer ones delimit the GBNF literal.
fn quoted(s: &str) -> String {
    let json = format!("\"{}\"", json_escape(s));
    let mut out = String::with_capacity(json.len() + 4);
    out.push('"');
    for c in json.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// The value production for one parameter.
fn value_rule(param: &ToolParam) -> String {
    if !param.enum_values.is_empty() {
        let alts: Vec<String> = param.enum_values.iter().map(|v| quoted(v)).collect();
        return format!("({})", alts.join(" | "));
    }
    match param.ty.as_str() {
        "string" => "string".to_string(),
        "number" | "integer" => "number".to_string(),
        "boolean" => "(\"true\" | \"false\")".to_string(),
        "object" => "object".to_string(),
        "array" => "array".to_string(),
        _ => "value".to_string(),
    }
}

/// Nested-optional group admitting exactly the declaration-order prefixes of
/// `kvs`. With `lead_comma`, every member (including the first) is preceded
/// by `ws "," ws`, for use after a required block.
fn optional_group(kvs: &[String], lead_comma: bool) -> String {
    if kvs.is_empty() {
        return String::new();
    }
    let rest = optional_group(&kvs[1..], true);
    let head = if lead_comma {
        format!("ws \",\" ws {}", kvs[0])
    } else {
        kvs[0].clone()
    };
    if rest.is_empty() {
        format!("({})?", head)
    } else {
        format!("({} {})?", head, rest)
    }
}

fn args_body(tool: &ToolSpec, kv_names: &[String]) -> String {
    let required: Vec<String> = tool
        .params
        .iter()
        .zip(kv_names)
        .filter(|(p, _)| tool.is_required(&p.name))
        .map(|(_, kv)| kv.clone())
        .collect();
    let optional: Vec<String> = tool
        .params
        .iter()
        .zip(kv_names)
        .filter(|(p, _)| !tool.is_required(&p.name))
        .map(|(_, kv)| kv.clone())
        .collect();

    if required.is_empty() && optional.is_empty() {
        return "\"{\" ws \"}\"".to_string();
    }

    let mut inner = String::new();
    if !required.is_empty() {
        inner.push_str(&required.join(" ws \",\" ws "));
    }
    let group = optional_group(&optional, !required.is_empty());
    if !group.is_empty() {
        if !inner.is_empty() {
            inner.push(' ');
        }
        inner.push_str(&group);
    }

    format!("\"{{\" ws {} ws \"}}\"", inner)
}

/// Build the parameter-aware GBNF grammar for a parsed tool list.
///
/// Returns an empty string when the list is empty, signalling that the
/// generic fallback should be used instead.
pub fn typed_tool_grammar(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut g = String::with_capacity(2048);
    g.push_str(ENVELOPE);

    let alts: Vec<String> = (0..tools.len()).map(|i| format!("call-{i}")).collect();
    g.push_str(&format!("call ::= {}\n", alts.join(" | ")));

    for (i, tool) in tools.iter().enumerate() {
        g.push_str(&format!(
            "call-{i} ::= \"{{\" ws {} ws \":\" ws {} ws \",\" ws {} ws \":\" ws args-{i} ws \"}}\"\n",
            quoted("name"),
            quoted(&tool.name),
            quoted("arguments"),
        ));

        let kv_names: Vec<String> = (0..tool.params.len())
            .map(|j| format!("kv-{i}-{j}"))
            .collect();
        g.push_str(&format!("args-{i} ::= {}\n", args_body(tool, &kv_names)));

        for (j, param) in tool.params.iter().enumerate() {
            g.push_str(&format!(
                "kv-{i}-{j} ::= {} ws \":\" ws {}\n",
                quoted(&param.name),
                value_rule(param),
            ));
        }
    }

    g.push_str(JSON_TERMINALS);
    g
}

/// Build the generic fallback grammar: envelope plus a `name` constrained to
/// the known tool names, with `arguments` left as an opaque JSON object.
pub fn generic_tool_grammar(names: &[String]) -> String {
    let mut g = String::with_capacity(1024);
    g.push_str(ENVELOPE);
    g.push_str(&format!(
        "call ::= \"{{\" ws {} ws \":\" ws toolname ws \",\" ws {} ws \":\" ws object ws \"}}\"\n",
        quoted("name"),
        quoted("arguments"),
    ));

    let alts: Vec<String> = if names.is_empty() {
        vec![quoted("unknown")]
    } else {
        names.iter().map(|n| quoted(n)).collect()
    };
    g.push_str(&format!("toolname ::= {}\n", alts.join(" | ")));

    g.push_str(JSON_TERMINALS);
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, params: Vec<ToolParam>, required: &[&str]) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            params,
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn param(name: &str, ty: &str) -> ToolParam {
        ToolParam {
            name: name.to_string(),
            ty: ty.to_string(),
            enum_values: Vec::new(),
        }
    }

    #[test]
    fn empty_list_signals_no_typed_grammar() {
        assert!(typed_tool_grammar(&[]).is_empty());
    }

    #[test]
    fn envelope_and_per_tool_rules() {
        let tools = vec![
            tool("alpha", vec![param("x", "string")], &["x"]),
            tool("beta", vec![], &[]),
        ];
        let g = typed_tool_grammar(&tools);
        assert!(g.starts_with("root ::= ws toolcall ws\n"));
        assert!(g.contains(r#""\"tool_calls\"""#));
        assert!(g.contains("call ::= call-0 | call-1"));
        assert!(g.contains(r#""\"alpha\"""#));
        assert!(g.contains(r#""\"beta\"""#));
        assert!(g.contains("ws ::= [ \\t\\n\\r]*"));
    }

    #[test]
    fn zero_params_admits_only_empty_object() {
        let g = typed_tool_grammar(&[tool("ping", vec![], &[])]);
        assert!(g.contains("args-0 ::= \"{\" ws \"}\"\n"));
    }

    #[test]
    fn required_params_are_fixed_in_declaration_order() {
        let tools = vec![tool(
            "t",
            vec![param("first", "string"), param("second", "number")],
            &["first", "second"],
        )];
        let g = typed_tool_grammar(&tools);
        assert!(g.contains("args-0 ::= \"{\" ws kv-0-0 ws \",\" ws kv-0-1 ws \"}\"\n"));
        assert!(g.contains("kv-0-0 ::= \"\\\"first\\\"\" ws \":\" ws string\n"));
        assert!(g.contains("kv-0-1 ::= \"\\\"second\\\"\" ws \":\" ws number\n"));
    }

    #[test]
    fn optional_only_params_form_prefix_group() {
        let tools = vec![tool(
            "t",
            vec![param("a", "string"), param("b", "string"), param("c", "string")],
            &[],
        )];
        let g = typed_tool_grammar(&tools);
        assert!(g.contains(
            "args-0 ::= \"{\" ws (kv-0-0 (ws \",\" ws kv-0-1 (ws \",\" ws kv-0-2)?)?)? ws \"}\"\n"
        ));
    }

    #[test]
    fn required_then_optional_group() {
        let tools = vec![tool(
            "t",
            vec![param("req", "string"), param("opt", "integer")],
            &["req"],
        )];
        let g = typed_tool_grammar(&tools);
        assert!(g.contains("args-0 ::= \"{\" ws kv-0-0 (ws \",\" ws kv-0-1)? ws \"}\"\n"));
    }

    #[test]
    fn enum_values_become_literal_alternatives() {
        let tools = vec![tool(
            "get_weather",
            vec![ToolParam {
                name: "units".to_string(),
                ty: "string".to_string(),
                enum_values: vec!["celsius".to_string(), "fahrenheit".to_string()],
            }],
            &[],
        )];
        let g = typed_tool_grammar(&tools);
        assert!(g.contains(r#"("\"celsius\"" | "\"fahrenheit\"")"#));
        // Enum parameters do not fall back to the plain string rule.
        assert!(!g.contains("kv-0-0 ::= \"\\\"units\\\"\" ws \":\" ws string"));
    }

    #[test]
    fn type_mapping_covers_fallback() {
        let tools = vec![tool(
            "t",
            vec![
                param("b", "boolean"),
                param("o", "object"),
                param("arr", "array"),
                param("mystery", "tuple"),
            ],
            &["b", "o", "arr", "mystery"],
        )];
        let g = typed_tool_grammar(&tools);
        assert!(g.contains("ws (\"true\" | \"false\")\n"));
        assert!(g.contains("kv-0-1 ::= \"\\\"o\\\"\" ws \":\" ws object\n"));
        assert!(g.contains("kv-0-2 ::= \"\\\"arr\\\"\" ws \":\" ws array\n"));
        assert!(g.contains("kv-0-3 ::= \"\\\"mystery\\\"\" ws \":\" ws value\n"));
    }

    #[test]
    fn generic_grammar_lists_known_names() {
        let g = generic_tool_grammar(&["alpha".to_string(), "beta".to_string()]);
        assert!(g.contains(r#"toolname ::= "\"alpha\"" | "\"beta\"""#));
        assert!(g.contains("\"\\\"arguments\\\"\" ws \":\" ws object"));
    }

    #[test]
    fn generic_grammar_without_names_uses_unknown() {
        let g = generic_tool_grammar(&[]);
        assert!(g.contains(r#"toolname ::= "\"unknown\"""#));
    }
}
