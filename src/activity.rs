//! 活动状态判定 - telemetry 优先，其次会话日志标题启发式，否则 unknown

use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetryRecord;

/// 代理活动状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Running,
    WaitingInput,
    #[default]
    Unknown,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Running => "running",
            ActivityState::WaitingInput => "waiting_input",
            ActivityState::Unknown => "unknown",
        }
    }

    /// 解析外部状态标签
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "working" | "running" => ActivityState::Running,
            "waiting_input" | "waiting" => ActivityState::WaitingInput,
            _ => ActivityState::Unknown,
        }
    }

    /// 行排序权重：等待输入排在最前
    pub fn sort_rank(&self) -> u8 {
        match self {
            ActivityState::WaitingInput => 0,
            ActivityState::Running => 1,
            ActivityState::Unknown => 2,
        }
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 判定可信度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// 来自 telemetry
    High,
    /// 来自会话日志
    Medium,
    Low,
}

/// 判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub activity: ActivityState,
    pub confidence: Confidence,
}

/// 合并 telemetry 与会话日志推断
pub fn resolve(telemetry: Option<&TelemetryRecord>, transcript: Option<ActivityState>) -> Resolution {
    if let Some(record) = telemetry {
        return Resolution {
            activity: record.activity,
            confidence: Confidence::High,
        };
    }
    match transcript {
        Some(activity) => Resolution {
            activity,
            confidence: Confidence::Medium,
        },
        None => Resolution {
            activity: ActivityState::Unknown,
            confidence: Confidence::Low,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_wins_over_transcript() {
        let record = TelemetryRecord {
            pid: 1,
            activity: ActivityState::Running,
            ..Default::default()
        };
        let resolution = resolve(Some(&record), Some(ActivityState::WaitingInput));
        assert_eq!(resolution.activity, ActivityState::Running);
        assert_eq!(resolution.confidence, Confidence::High);
    }

    #[test]
    fn test_transcript_fallback_then_unknown() {
        let resolution = resolve(None, Some(ActivityState::WaitingInput));
        assert_eq!(resolution.activity, ActivityState::WaitingInput);
        assert_eq!(resolution.confidence, Confidence::Medium);

        let resolution = resolve(None, None);
        assert_eq!(resolution.activity, ActivityState::Unknown);
        assert_eq!(resolution.confidence, Confidence::Low);
    }

    #[test]
    fn test_labels() {
        assert_eq!(ActivityState::from_label("Working"), ActivityState::Running);
        assert_eq!(ActivityState::from_label("bogus"), ActivityState::Unknown);
        assert_eq!(
            serde_json::to_string(&ActivityState::WaitingInput).unwrap(),
            "\"waiting_input\""
        );
    }
}
