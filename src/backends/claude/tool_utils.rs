//! Human-readable summaries of Claude tool calls.

use serde_json::Value;

const MAX_COMMAND_CHARS: usize = 60;

const FILE_KEYS: &[&str] = &["file_path", "path"];
const NOTEBOOK_KEYS: &[&str] = &["notebook_path"];
const PATTERN_KEYS: &[&str] = &["pattern"];
const BASH_KEYS: &[&str] = &["description", "command"];
const QUERY_KEYS: &[&str] = &["query"];
const URL_KEYS: &[&str] = &["url"];
const TASK_KEYS: &[&str] = &["description", "prompt"];
const SKILL_KEYS: &[&str] = &["skill"];

fn str_field<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
}

/// Short target of a tool call for status lines: a path, pattern, command...
pub fn tool_target(tool_name: &str, input: &Value) -> String {
    let (keys, fallback): (&[&str], &str) = match tool_name {
        "Read" | "Write" | "Edit" | "MultiEdit" => (FILE_KEYS, "unknown"),
        "NotebookEdit" => (NOTEBOOK_KEYS, "notebook"),
        "Glob" => (PATTERN_KEYS, "*"),
        "Grep" => (PATTERN_KEYS, "..."),
        "Bash" => (BASH_KEYS, "command"),
        "WebSearch" => (QUERY_KEYS, "searching..."),
        "WebFetch" => (URL_KEYS, "fetching..."),
        "Task" => (TASK_KEYS, "task"),
        "Skill" => (SKILL_KEYS, "skill"),
        "AskUserQuestion" => return "asking question...".to_string(),
        "TodoWrite" => {
            return input
                .get("todos")
                .and_then(Value::as_array)
                .map(|todos| format!("{} todo(s)", todos.len()))
                .unwrap_or_else(|| "todos".to_string())
        }
        _ => {
            let keys = ["file_path", "path", "pattern", "command", "url", "query", "prompt", "name"];
            return match str_field(input, &keys) {
                Some(value) => format!("{}: {}", tool_name, value),
                None => tool_name.to_string(),
            };
        }
    };
    str_field(input, keys).unwrap_or(fallback).to_string()
}

/// One-line prompt text for a permission request.
pub fn describe_permission(tool_name: &str, input: &Value, blocked_path: Option<&str>) -> String {
    let description = match tool_name {
        "Write" => format!(
            "Create or overwrite the file '{}'",
            str_field(input, &["file_path"]).unwrap_or("a file")
        ),
        "Edit" | "MultiEdit" => format!(
            "Edit the file '{}'",
            str_field(input, &["file_path"]).unwrap_or("a file")
        ),
        "Read" => format!(
            "Read the file '{}'",
            str_field(input, &["file_path"]).unwrap_or("a file")
        ),
        "Glob" => format!(
            "Search for files matching '{}'",
            str_field(input, &["pattern"]).unwrap_or("*")
        ),
        "Grep" => format!(
            "Search file contents for '{}'",
            str_field(input, &["pattern"]).unwrap_or("...")
        ),
        "Bash" => describe_command(str_field(input, &["command"]).unwrap_or("")),
        "WebFetch" => format!("Fetch '{}'", str_field(input, &["url"]).unwrap_or("a URL")),
        "WebSearch" => format!(
            "Search the web for '{}'",
            str_field(input, &["query"]).unwrap_or("...")
        ),
        _ => format!("Use the {} tool", tool_name),
    };

    match blocked_path {
        Some(path) => format!("{} (outside allowed directories: {})", description, path),
        None => description,
    }
}

fn describe_command(command: &str) -> String {
    let command = command.trim();
    let words: Vec<&str> = command.split_whitespace().collect();
    let has = |flag: &str| words.contains(&flag);

    match words.first().copied() {
        None => "Run a shell command".to_string(),
        Some("rm") if has("-r") || has("-rf") => {
            format!("Delete '{}' and all its contents", words[words.len() - 1])
        }
        Some("rm") => format!("Delete the file '{}'", words[words.len() - 1]),
        Some("mkdir") => format!("Create the directory '{}'", words[words.len() - 1]),
        Some("mv") if words.len() >= 3 => format!(
            "Move '{}' to '{}'",
            words[words.len() - 2],
            words[words.len() - 1]
        ),
        Some("git") if has("commit") => "Create a git commit".to_string(),
        Some("git") if has("push") => "Push changes to remote".to_string(),
        Some("cargo") if has("test") => "Run tests".to_string(),
        Some("cargo") if has("build") => "Build the Rust project".to_string(),
        _ => {
            let mut shown: String = command.chars().take(MAX_COMMAND_CHARS - 3).collect();
            if command.chars().count() > MAX_COMMAND_CHARS {
                shown.push_str("...");
            } else {
                shown = command.to_string();
            }
            format!("Run command: {}", shown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_prefers_file_path() {
        let input = json!({"file_path": "/src/main.rs", "path": "/ignored"});
        assert_eq!(tool_target("Read", &input), "/src/main.rs");
        assert_eq!(tool_target("Edit", &json!({})), "unknown");
    }

    #[test]
    fn target_for_bash_prefers_description() {
        let input = json!({"command": "ls -la", "description": "List files"});
        assert_eq!(tool_target("Bash", &input), "List files");
        assert_eq!(tool_target("Bash", &json!({"command": "ls"})), "ls");
    }

    #[test]
    fn target_for_unknown_tool_uses_common_fields() {
        let input = json!({"url": "https://example.com"});
        assert_eq!(tool_target("mcp__fetch", &input), "mcp__fetch: https://example.com");
        assert_eq!(tool_target("mcp__noop", &json!({})), "mcp__noop");
        assert_eq!(
            tool_target("TodoWrite", &json!({"todos": [{}, {}]})),
            "2 todo(s)"
        );
    }

    #[test]
    fn describes_common_commands() {
        let describe = |cmd: &str| describe_permission("Bash", &json!({"command": cmd}), None);
        assert_eq!(describe("rm -rf build"), "Delete 'build' and all its contents");
        assert_eq!(describe("git commit -m wip"), "Create a git commit");
        assert_eq!(describe("ls -la"), "Run command: ls -la");
        assert_eq!(describe(""), "Run a shell command");
    }

    #[test]
    fn long_commands_are_truncated_on_char_boundaries() {
        let command = "é".repeat(80);
        let text = describe_permission("Bash", &json!({"command": command}), None);
        assert!(text.ends_with("..."));
        assert_eq!(text.chars().count(), "Run command: ".len() + MAX_COMMAND_CHARS);
    }

    #[test]
    fn blocked_path_is_mentioned() {
        let text = describe_permission(
            "Read",
            &json!({"file_path": "/etc/passwd"}),
            Some("/etc"),
        );
        assert_eq!(
            text,
            "Read the file '/etc/passwd' (outside allowed directories: /etc)"
        );
    }
}
