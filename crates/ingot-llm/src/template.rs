//! Chat-template selection, fallback templates, and the tool preamble.
//!
//! Template resolution order: caller override, then the template embedded in
//! the model, then an architecture-keyed fallback. The fallbacks are plain
//! Jinja strings accepted by the decoder library's template engine; the
//! plain-text renderer exists for engines (and tests) with no template
//! machinery at all.

use crate::chat::{ChatMessage, Role};

/// System prompt installed when tool calling is enabled.
pub const TOOL_SYSTEM_PROMPT: &str = concat!(
    "You are a function-calling assistant. When tools are available, ",
    "respond ONLY with a JSON object in this EXACT format:\n",
    "\n",
    "{\n",
    "  \"tool_calls\": [{\n",
    "    \"name\": \"toolName\",\n",
    "    \"arguments\": {\n",
    "      \"param1\": \"value1\",\n",
    "      \"param2\": \"value2\"\n",
    "    }\n",
    "  }]\n",
    "}\n",
    "\n",
    "CRITICAL RULES:\n",
    "1. Use \"arguments\" as an object containing all parameters\n",
    "2. NEVER put parameters directly in the tool_calls object\n",
    "3. NEVER include any text before or after the JSON\n",
    "4. The \"arguments\" field must be a JSON object, not a string\n",
    "5. Match parameter names exactly as defined in the tool schema\n",
    "\n",
    "If no tool is needed, respond with plain text.",
);

/// Tool preamble appended to the system message: envelope instructions plus
/// the raw catalog.
pub fn tool_preamble(tools_json: &str) -> String {
    let mut preamble = String::with_capacity(256 + tools_json.len());
    preamble.push_str(
        "You may call tools by emitting ONLY the JSON object:\n\
         {\"tool_calls\":[{\"name\":\"NAME\",\"arguments\":{...}}]}\n\
         Available tools (OpenAI schema):\n",
    );
    preamble.push_str(tools_json);
    preamble.push('\n');
    preamble
}

const GEMMA_TEMPLATE: &str = "{% for message in messages %}\
{% if message['role'] == 'system' %}\
{{ message['content'] }}\n\
{% elif message['role'] == 'user' %}\
<start_of_turn>user\n\
{{ message['content'] }}<end_of_turn>\n\
<start_of_turn>model\n\
{% elif message['role'] == 'assistant' or message['role'] == 'model' %}\
{{ message['content'] }}<end_of_turn>\n\
{% endif %}\
{% endfor %}\
{% if add_generation_prompt %}<start_of_turn>model\n{% endif %}";

const CHATML_TEMPLATE: &str = "{% for message in messages %}\
<|im_start|>{{ message['role'] }}\n\
{{ message['content'] }}<|im_end|>\n\
{% endfor %}\
{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

const PHI_TEMPLATE: &str = "{% for message in messages %}\
<|{{ message['role'] }}|>\n\
{{ message['content'] }}<|end|>\n\
{% endfor %}\
{% if add_generation_prompt %}<|assistant|>\n{% endif %}";

/// Fallback chat template for a model architecture, used only when neither
/// an override nor a built-in template exists.
pub fn fallback_template_for_arch(arch: &str) -> &'static str {
    let arch = arch.to_ascii_lowercase();
    if arch.contains("gemma") {
        GEMMA_TEMPLATE
    } else if arch.contains("phi") {
        PHI_TEMPLATE
    } else {
        // llama, mistral, mixtral, qwen, and everything unknown render well
        // with ChatML.
        CHATML_TEMPLATE
    }
}

/// Render a conversation without any template engine:
/// `System:`/`User:`/`Assistant:`/`Tool:` transcript lines.
pub fn plain_render(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push('\n');
    }
    if add_generation_prompt {
        out.push_str("Assistant: ");
    }
    out
}
