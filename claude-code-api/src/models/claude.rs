//! Known model aliases surfaced by `GET /v1/models`. The dispatch engine
//! itself treats `model` as an opaque string passed through to the CLI.

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaudeModel {
    pub id: String,
    pub display_name: String,
    pub context_window: i32,
}

impl ClaudeModel {
    pub fn all() -> Vec<Self> {
        vec![
            Self {
                id: "claude-opus-4-1-20250805".to_string(),
                display_name: "Claude Opus 4.1".to_string(),
                context_window: 500000,
            },
            Self {
                id: "claude-opus-4-20250514".to_string(),
                display_name: "Claude Opus 4".to_string(),
                context_window: 500000,
            },
            Self {
                id: "claude-sonnet-4-20250514".to_string(),
                display_name: "Claude Sonnet 4".to_string(),
                context_window: 500000,
            },
            Self {
                id: "claude-3-7-sonnet-20250219".to_string(),
                display_name: "Claude Sonnet 3.7".to_string(),
                context_window: 200000,
            },
            Self {
                id: "claude-3-5-haiku-20241022".to_string(),
                display_name: "Claude Haiku 3.5".to_string(),
                context_window: 200000,
            },
            Self {
                id: "claude-3-haiku-20240307".to_string(),
                display_name: "Claude Haiku 3".to_string(),
                context_window: 200000,
            },
        ]
    }
}
