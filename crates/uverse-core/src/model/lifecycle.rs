//! ライフサイクル状態

use serde::{Deserialize, Serialize};

/// スーパーバイザー全体の状態
///
/// `idle → starting → {started | failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    /// 未起動（または停止済み）
    #[default]
    Idle,
    /// 起動シーケンス実行中
    Starting,
    /// 全サービス起動完了
    Started,
    /// 起動失敗
    Failed,
}

impl LifecycleStatus {
    /// 起動シーケンスが終わっているか
    pub fn is_settled(&self) -> bool {
        !matches!(self, LifecycleStatus::Starting)
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleStatus::Idle => write!(f, "idle"),
            LifecycleStatus::Starting => write!(f, "starting"),
            LifecycleStatus::Started => write!(f, "started"),
            LifecycleStatus::Failed => write!(f, "failed"),
        }
    }
}
