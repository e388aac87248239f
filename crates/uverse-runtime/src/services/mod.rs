//! 監視対象サービスの実装

mod backend;
mod postgres;
mod rustfs;

pub use backend::*;
pub use postgres::*;
pub use rustfs::*;

use crate::controller::ServiceController;
use crate::platform::Platform;
use std::sync::Arc;

/// 起動順に並んだ標準のコントローラー一式
pub fn default_controllers(platform: Arc<dyn Platform>, packaged: bool) -> Vec<Arc<dyn ServiceController>> {
    vec![
        Arc::new(PostgresController::new(platform.clone())),
        Arc::new(RustfsController::new(platform.clone())),
        Arc::new(BackendController::new(platform, packaged)),
    ]
}
