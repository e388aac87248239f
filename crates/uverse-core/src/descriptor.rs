//! モデルパス記述ファイル（`mineru.json`）
//!
//! バックエンドは `models-dir.pipeline` / `models-dir.vlm` を絶対パスとして
//! 参照するため、モデルディレクトリを移動するとパスが壊れる。
//! ここでは標準配置のパスに書き直して整合させる。

use crate::error::{CoreError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const DESCRIPTOR_FILE_NAME: &str = "mineru.json";

const MODELS_SECTION: &str = "models-dir";
const PIPELINE_ROLE: &str = "pipeline";
const VLM_ROLE: &str = "vlm";

/// pipeline モデルの標準配置
pub fn canonical_pipeline(models_dir: &Path) -> PathBuf {
    models_dir.join("OpenDataLab").join("PDF-Extract-Kit-1___0")
}

/// vlm モデルの標準配置
pub fn canonical_vlm(models_dir: &Path) -> PathBuf {
    models_dir.join("OpenDataLab").join("MinerU2___5-2509-1___2B")
}

/// `mineru.json` の内容
///
/// 未知のキーも含めて元の順序のまま保持する。
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    path: PathBuf,
    document: Value,
}

impl ModelDescriptor {
    pub fn path_for(models_dir: &Path) -> PathBuf {
        models_dir.join(DESCRIPTOR_FILE_NAME)
    }

    /// モデルディレクトリから読み込む
    pub fn load(models_dir: &Path) -> Result<Self> {
        let path = Self::path_for(models_dir);
        let text = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CoreError::DescriptorNotFound(path.clone())
            } else {
                CoreError::DescriptorRead {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let document = serde_json::from_str(&text).map_err(|source| CoreError::DescriptorParse {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn role(&self, role: &str) -> Option<&str> {
        self.document
            .get(MODELS_SECTION)?
            .get(role)?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// 記録されている pipeline パス（空なら None）
    pub fn pipeline(&self) -> Option<&str> {
        self.role(PIPELINE_ROLE)
    }

    pub fn vlm(&self) -> Option<&str> {
        self.role(VLM_ROLE)
    }

    /// 実際に使われる pipeline ディレクトリ
    ///
    /// 標準配置が存在すればそれ、なければ記録値（相対パスはモデルディレクトリ基準）。
    pub fn effective_pipeline(&self, models_dir: &Path) -> Option<PathBuf> {
        let recorded = self.pipeline()?;
        let canonical = canonical_pipeline(models_dir);
        if canonical.exists() {
            return Some(canonical);
        }
        Some(resolve_recorded(recorded, models_dir))
    }

    /// 各ロールを標準配置に合わせて書き換える
    ///
    /// 内容が変わった場合のみ true を返す。
    pub fn repair(&mut self, models_dir: &Path) -> bool {
        let Some(section) = self
            .document
            .get_mut(MODELS_SECTION)
            .and_then(Value::as_object_mut)
        else {
            return false;
        };

        let pipeline = repair_role(section, PIPELINE_ROLE, &canonical_pipeline(models_dir), models_dir);
        let vlm = repair_role(section, VLM_ROLE, &canonical_vlm(models_dir), models_dir);
        pipeline || vlm
    }

    /// 4 スペースインデントの JSON
    pub fn to_pretty_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.document
            .serialize(&mut ser)
            .map_err(|source| CoreError::DescriptorParse {
                path: self.path.clone(),
                source,
            })?;
        // serde_json は UTF-8 しか出力しない
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn save(&self) -> Result<()> {
        let text = self.to_pretty_string()?;
        std::fs::write(&self.path, text).map_err(|source| CoreError::DescriptorWrite {
            path: self.path.clone(),
            source,
        })
    }
}

/// ロール1件を修復する
///
/// 存在しないロールは追加しない。
fn repair_role(section: &mut Map<String, Value>, role: &str, canonical: &Path, models_dir: &Path) -> bool {
    let Some(current) = section.get(role) else {
        return false;
    };
    let current = current.as_str().unwrap_or_default().trim().to_string();

    let target = if canonical.exists() {
        canonical.to_path_buf()
    } else if !current.is_empty() && Path::new(&current).is_relative() {
        let joined = models_dir.join(&current);
        if !joined.exists() {
            tracing::warn!("Model path for {} does not exist: {}", role, joined.display());
            return false;
        }
        joined
    } else {
        return false;
    };

    let target = target.display().to_string();
    if current == target {
        return false;
    }

    tracing::info!("Rewriting {} model path: {:?} -> {}", role, current, target);
    section.insert(role.to_string(), Value::String(target));
    true
}

fn resolve_recorded(recorded: &str, models_dir: &Path) -> PathBuf {
    let path = Path::new(recorded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        models_dir.join(path)
    }
}

/// 記述ファイルを読み込んで修復し、変更があれば書き戻す
///
/// 書き込んだ場合は true。
pub fn repair_descriptor(models_dir: &Path) -> Result<bool> {
    let mut descriptor = ModelDescriptor::load(models_dir)?;
    if !descriptor.repair(models_dir) {
        tracing::debug!("{} is up to date", descriptor.path().display());
        return Ok(false);
    }
    descriptor.save()?;
    tracing::info!("Updated {}", descriptor.path().display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn models_with_pipeline() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = canonical_pipeline(dir.path());
        fs::create_dir_all(&pipeline).unwrap();
        fs::write(pipeline.join("layout.pt"), b"weights").unwrap();
        dir
    }

    #[test]
    fn test_relative_pipeline_rewritten_to_canonical() {
        let dir = models_with_pipeline();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            r#"{"bucket_info": {"bucket-name-1": ["ak", "sk", "endpoint"]}, "models-dir": {"pipeline": "OpenDataLab/PDF-Extract-Kit-1___0"}, "config_version": "1.3.0"}"#,
        )
        .unwrap();

        assert!(repair_descriptor(dir.path()).unwrap());

        let text = fs::read_to_string(dir.path().join(DESCRIPTOR_FILE_NAME)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value["models-dir"]["pipeline"],
            canonical_pipeline(dir.path()).display().to_string()
        );
        assert_eq!(value["bucket_info"]["bucket-name-1"][0], "ak");
        assert_eq!(value["config_version"], "1.3.0");

        // 元のキー順序を保持
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["bucket_info", "models-dir", "config_version"]);
        assert!(text.contains("\n    \"models-dir\""));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let dir = models_with_pipeline();
        let path = dir.path().join(DESCRIPTOR_FILE_NAME);
        fs::write(&path, r#"{"models-dir": {"pipeline": "/old/location/pipeline"}}"#).unwrap();

        assert!(repair_descriptor(dir.path()).unwrap());
        let first = fs::read(&path).unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();

        assert!(!repair_descriptor(dir.path()).unwrap());
        assert_eq!(fs::read(&path).unwrap(), first);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn test_missing_vlm_is_not_added() {
        let dir = models_with_pipeline();
        fs::create_dir_all(canonical_vlm(dir.path())).unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            r#"{"models-dir": {"pipeline": "x"}}"#,
        )
        .unwrap();

        repair_descriptor(dir.path()).unwrap();
        let descriptor = ModelDescriptor::load(dir.path()).unwrap();
        assert!(descriptor.vlm().is_none());
    }

    #[test]
    fn test_vlm_rewritten_when_present() {
        let dir = models_with_pipeline();
        fs::create_dir_all(canonical_vlm(dir.path())).unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            r#"{"models-dir": {"pipeline": "x", "vlm": "/elsewhere/vlm"}}"#,
        )
        .unwrap();

        repair_descriptor(dir.path()).unwrap();
        let descriptor = ModelDescriptor::load(dir.path()).unwrap();
        let expected = canonical_vlm(dir.path()).display().to_string();
        assert_eq!(descriptor.vlm(), Some(expected.as_str()));
    }

    #[test]
    fn test_role_left_alone_without_canonical() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            r#"{"models-dir": {"pipeline": "/custom/pipeline"}}"#,
        )
        .unwrap();

        assert!(!repair_descriptor(dir.path()).unwrap());
        let descriptor = ModelDescriptor::load(dir.path()).unwrap();
        assert_eq!(descriptor.pipeline(), Some("/custom/pipeline"));
    }

    #[test]
    fn test_relative_role_made_absolute_when_target_exists() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("custom")).unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            r#"{"models-dir": {"pipeline": "custom"}}"#,
        )
        .unwrap();

        assert!(repair_descriptor(dir.path()).unwrap());
        let descriptor = ModelDescriptor::load(dir.path()).unwrap();
        let expected = dir.path().join("custom").display().to_string();
        assert_eq!(descriptor.pipeline(), Some(expected.as_str()));
    }

    #[test]
    fn test_effective_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            r#"{"models-dir": {"pipeline": "custom"}}"#,
        )
        .unwrap();
        let descriptor = ModelDescriptor::load(dir.path()).unwrap();
        assert_eq!(
            descriptor.effective_pipeline(dir.path()),
            Some(dir.path().join("custom"))
        );

        fs::create_dir_all(canonical_pipeline(dir.path())).unwrap();
        assert_eq!(
            descriptor.effective_pipeline(dir.path()),
            Some(canonical_pipeline(dir.path()))
        );
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ModelDescriptor::load(dir.path()),
            Err(CoreError::DescriptorNotFound(_))
        ));

        fs::write(dir.path().join(DESCRIPTOR_FILE_NAME), "{not json").unwrap();
        assert!(matches!(
            ModelDescriptor::load(dir.path()),
            Err(CoreError::DescriptorParse { .. })
        ));
    }
}
