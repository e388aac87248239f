//! サービス定義

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 監視対象サービスの種類
///
/// 宣言順が起動順（停止は逆順）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// 組み込み PostgreSQL
    Database,
    /// RustFS（S3 互換オブジェクトストレージ）
    ObjectStore,
    /// アプリケーションバックエンド
    Backend,
}

impl ServiceKind {
    /// 起動順
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::Database,
        ServiceKind::ObjectStore,
        ServiceKind::Backend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Database => "database",
            ServiceKind::ObjectStore => "object-store",
            ServiceKind::Backend => "backend",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" | "postgres" => Ok(ServiceKind::Database),
            "object-store" | "rustfs" => Ok(ServiceKind::ObjectStore),
            "backend" => Ok(ServiceKind::Backend),
            other => Err(CoreError::UnknownService(other.to_string())),
        }
    }
}

/// サービス1件の状態（UI 表示用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: ServiceKind,
    pub port: u16,
    pub running: bool,
}
