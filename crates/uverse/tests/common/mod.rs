use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// 基準ディレクトリを模したテスト用インストール
pub struct TestInstall {
    pub root: TempDir,
}

impl TestInstall {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.path().join(".env")
    }

    pub fn write_env(&self, content: &str) {
        fs::write(self.env_file(), content).unwrap();
    }

    fn touch(&self, relative: &str) {
        let path = self.root.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    /// PostgreSQL・RustFS・モデルを標準配置で用意する
    ///
    /// `mineru.json` の pipeline は相対パスで書いておく。
    pub fn populate(&self) {
        self.touch(&format!("postgres/bin/pg_ctl{}", std::env::consts::EXE_SUFFIX));
        self.touch(&format!("store/rustfs{}", std::env::consts::EXE_SUFFIX));
        self.touch("models/OpenDataLab/PDF-Extract-Kit-1___0/model.pt");
        fs::write(
            self.models_dir().join("mineru.json"),
            r#"{"bucket_info": {}, "models-dir": {"pipeline": "OpenDataLab/PDF-Extract-Kit-1___0"}}"#,
        )
        .unwrap();
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.path().join("models")
    }

    #[allow(dead_code)]
    pub fn read(&self, relative: impl AsRef<Path>) -> String {
        fs::read_to_string(self.root.path().join(relative)).unwrap()
    }
}
