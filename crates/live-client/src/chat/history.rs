use serde::Serialize;

const USER_TAG: &str = "[用户]";
const ASSISTANT_TAG: &str = "[AI]";
/// Prefix of locally generated notices; never part of the conversation.
pub const SYSTEM_TAG: &str = "[系统]";
const SYSTEM_PROMPT_MARKER: &str = "你是一个专业的编程助手";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    /// Parses one stored history line such as `[用户] hello`.
    pub fn parse(entry: &str) -> Option<Self> {
        let (role, rest) = if let Some(rest) = entry.strip_prefix(USER_TAG) {
            (ChatRole::User, rest)
        } else if let Some(rest) = entry.strip_prefix(ASSISTANT_TAG) {
            (ChatRole::Assistant, rest)
        } else {
            return None;
        };
        let content = rest.trim_start();
        if content.starts_with(SYSTEM_TAG) || content.contains(SYSTEM_PROMPT_MARKER) {
            return None;
        }
        Some(Self {
            role,
            content: content.to_string(),
        })
    }
}

pub fn parse_history<I, S>(entries: I) -> Vec<ChatTurn>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| ChatTurn::parse(entry.as_ref()))
        .collect()
}
