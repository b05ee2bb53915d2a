//! Detection of scheduling commands embedded in agent replies.
//!
//! Supported forms:
//! - `[CRON_CREATE] ... [/CRON_CREATE]` with `name:`, `schedule:`,
//!   `schedule_description:` and `message:` fields
//! - `[CRON_LIST]`
//! - `[CRON_DELETE: <job id>]`
//!
//! Commands inside fenced code blocks are ignored so that documentation
//! examples are never executed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static CREATE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[CRON_CREATE\]\s*\n?(.*?)\[/CRON_CREATE\]").unwrap());
static CREATE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[CRON_CREATE\]").unwrap());
static CREATE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[/CRON_CREATE\]").unwrap());
static NEXT_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[CRON_(?:LIST|DELETE)").unwrap());
static LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[CRON_LIST\]").unwrap());
static DELETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[CRON_DELETE:\s*([^\]]+)\]").unwrap());
static ANY_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[CRON_(?:CREATE|LIST|DELETE)").unwrap());

static FIELD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)name:\s*(.+)").unwrap());
static FIELD_SCHEDULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^schedule:\s*(.+)").unwrap());
static FIELD_DESCRIPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)schedule_description:\s*(.+)").unwrap());
static FIELD_MESSAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)message:\s*").unwrap());
static FIELD_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\n(?:name|schedule|schedule_description):").unwrap());

static STRIP_CREATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[CRON_CREATE\].*?\[/CRON_CREATE\]").unwrap());
static STRIP_DELETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[CRON_DELETE:[^\]]+\]").unwrap());
static EXTRA_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Ids that agents copy verbatim from instructions instead of a real job id.
const PLACEHOLDER_IDS: &[&str] = &["任务id", "task-id", "taskid", "job-id", "jobid", "xxx", "id"];

/// A command found in agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CronCommand {
    Create {
        name: String,
        /// Cron expression as written by the agent.
        schedule: String,
        schedule_description: String,
        message: String,
    },
    List,
    Delete {
        job_id: String,
    },
}

/// Find every command in `content`, creates first, then list, then deletes.
pub fn detect_cron_commands(content: &str) -> Vec<CronCommand> {
    if content.is_empty() {
        return Vec::new();
    }
    let clean = CODE_BLOCK.replace_all(content, "");
    let mut commands = Vec::new();

    for caps in CREATE_BLOCK.captures_iter(&clean) {
        let body = caps.get(1).map_or("", |m| m.as_str());
        match parse_create_body(body) {
            Some(command) => commands.push(command),
            None => tracing::debug!("Ignoring CRON_CREATE block with missing fields"),
        }
    }

    // Agents sometimes forget the closing tag.
    if commands.is_empty() && CREATE_OPEN.is_match(&clean) && !CREATE_CLOSE.is_match(&clean) {
        if let Some(open) = CREATE_OPEN.find(&clean) {
            let rest = &clean[open.end()..];
            let body = match NEXT_COMMAND.find(rest) {
                Some(next) => &rest[..next.start()],
                None => rest,
            };
            match parse_create_body(body.trim_start()) {
                Some(command) => {
                    tracing::warn!("Parsed CRON_CREATE block without closing tag");
                    commands.push(command);
                }
                None => tracing::debug!("Unclosed CRON_CREATE block is incomplete"),
            }
        }
    }

    if LIST.is_match(&clean) {
        commands.push(CronCommand::List);
    }

    for caps in DELETE.captures_iter(&clean) {
        let job_id = caps.get(1).map_or("", |m| m.as_str()).trim();
        if job_id.is_empty() || PLACEHOLDER_IDS.contains(&job_id.to_lowercase().as_str()) {
            tracing::debug!(job_id, "Skipping placeholder CRON_DELETE");
            continue;
        }
        commands.push(CronCommand::Delete {
            job_id: job_id.to_string(),
        });
    }

    commands
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_create_body(body: &str) -> Option<CronCommand> {
    if body.trim().is_empty() {
        return None;
    }

    let name = capture(&FIELD_NAME, body)?;
    let schedule = capture(&FIELD_SCHEDULE, body)?;
    let schedule_description = capture(&FIELD_DESCRIPTION, body)?;

    // The message runs until the next field line or the end of the body.
    let start = FIELD_MESSAGE.find(body)?.end();
    let rest = &body[start..];
    let end = FIELD_BOUNDARY.find(rest).map_or(rest.len(), |m| m.start());
    let message = CREATE_CLOSE.replace_all(rest[..end].trim(), "").trim().to_string();
    if message.is_empty() {
        return None;
    }

    Some(CronCommand::Create {
        name,
        schedule,
        schedule_description,
        message,
    })
}

/// Quick check before full parsing.
pub fn has_cron_commands(content: &str) -> bool {
    ANY_COMMAND.is_match(content)
}

/// Remove command markup, leaving the text shown to the user.
pub fn strip_cron_commands(content: &str) -> String {
    let stripped = STRIP_CREATE.replace_all(content, "");
    let stripped = LIST.replace_all(&stripped, "");
    let stripped = STRIP_DELETE.replace_all(&stripped, "");
    EXTRA_NEWLINES
        .replace_all(&stripped, "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE: &str = "Sure, I'll set that up.\n\
        [CRON_CREATE]\n\
        name: Weekly report\n\
        schedule: 0 9 * * MON\n\
        schedule_description: Every Monday at 9:00\n\
        message: Summarize last week's commits\n\
        and open issues.\n\
        [/CRON_CREATE]\n\
        Done.";

    #[test]
    fn test_detect_create() {
        let commands = detect_cron_commands(CREATE);
        assert_eq!(
            commands,
            vec![CronCommand::Create {
                name: "Weekly report".into(),
                schedule: "0 9 * * MON".into(),
                schedule_description: "Every Monday at 9:00".into(),
                message: "Summarize last week's commits\nand open issues.".into(),
            }]
        );
    }

    #[test]
    fn test_message_stops_at_next_field() {
        let body = "[CRON_CREATE]\nmessage: ping the team\nname: Ping\nschedule: */5 * * * *\nschedule_description: Every 5 minutes\n[/CRON_CREATE]";
        match &detect_cron_commands(body)[..] {
            [CronCommand::Create { message, name, .. }] => {
                assert_eq!(message, "ping the team");
                assert_eq!(name, "Ping");
            }
            other => panic!("unexpected commands: {other:?}"),
        }
    }

    #[test]
    fn test_missing_field_is_ignored() {
        let body = "[CRON_CREATE]\nname: Ping\nschedule: */5 * * * *\nmessage: hi\n[/CRON_CREATE]";
        assert!(detect_cron_commands(body).is_empty());
    }

    #[test]
    fn test_unclosed_create_fallback() {
        let body = "[CRON_CREATE]\nname: Ping\nschedule: 0 8 * * *\nschedule_description: Daily at 8\nmessage: good morning\n[CRON_LIST]";
        let commands = detect_cron_commands(body);
        assert_eq!(commands.len(), 2);
        assert!(matches!(&commands[0], CronCommand::Create { message, .. } if message == "good morning"));
        assert_eq!(commands[1], CronCommand::List);
    }

    #[test]
    fn test_code_blocks_are_ignored() {
        let body = "Use it like this:\n```\n[CRON_LIST]\n[CRON_DELETE: cron_abc]\n```\nthat's all";
        assert!(detect_cron_commands(body).is_empty());
        assert!(has_cron_commands(body));
    }

    #[test]
    fn test_list_and_delete() {
        let body = "[cron_list] then [CRON_DELETE: cron_123 ] and [CRON_DELETE: task-id] [CRON_DELETE: 任务ID]";
        assert_eq!(
            detect_cron_commands(body),
            vec![
                CronCommand::List,
                CronCommand::Delete {
                    job_id: "cron_123".into()
                },
            ]
        );
    }

    #[test]
    fn test_has_cron_commands() {
        assert!(has_cron_commands("x [CRON_CREATE] y"));
        assert!(!has_cron_commands("plain reply"));
        assert!(!has_cron_commands(""));
    }

    #[test]
    fn test_strip_cron_commands() {
        assert_eq!(strip_cron_commands(CREATE), "Sure, I'll set that up.\n\nDone.");
        assert_eq!(
            strip_cron_commands("a\n[CRON_LIST]\n\n\n\nb [CRON_DELETE: x]"),
            "a\n\nb"
        );
    }

    #[test]
    fn test_command_wire_shape() {
        let json = serde_json::to_value(CronCommand::Delete {
            job_id: "cron_1".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"kind": "delete", "jobId": "cron_1"}));
    }
}
