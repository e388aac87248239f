pub mod descriptor;
pub mod error;
pub mod model;
pub mod validator;

pub use descriptor::{
    DESCRIPTOR_FILE_NAME, ModelDescriptor, canonical_pipeline, canonical_vlm, repair_descriptor,
};
pub use error::{CoreError, Result};
pub use model::*;
pub use validator::{
    PathCheckReport, PathIssue, PathValidation, ValidateOptions, check_paths, pg_ctl_path,
    rustfs_path, validate_required_paths,
};
