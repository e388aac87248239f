//! モデル定義
//!
//! 監視対象サービスとライフサイクル状態を定義します。

mod lifecycle;
mod service;

// Re-exports
pub use lifecycle::*;
pub use service::*;
