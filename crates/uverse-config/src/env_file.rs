//! `.env` 形式の設定ファイルのパーサー
//!
//! `KEY=VALUE` の行指向フォーマットを読み込む。
//! `#` から始まる行はコメント、値の前後のクォートは除去される。
//! ダブルクォート内では `\"` と `\\` をエスケープとして扱い、
//! シングルクォート内はそのまま読む。

use std::path::Path;

/// パース済みの `.env` ファイル
///
/// キーの出現順を保持する。同じキーが複数回現れた場合は後勝ち。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    entries: Vec<(String, String)>,
}

impl EnvFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// ファイルを読み込む（存在しない・読めない場合は None）
    pub fn read(path: &Path) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Some(parse_env(&text)),
            Err(e) => {
                tracing::debug!("Config file {} not readable: {}", path.display(), e);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvFile {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = EnvFile::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

/// `.env` テキストをパースする
///
/// 不正な行は無視する（ベストエフォート）。
pub fn parse_env(text: &str) -> EnvFile {
    let mut env = EnvFile::new();
    for line in text.lines() {
        if let Some(parts) = split_assignment(line) {
            env.set(parts.key, clean_value(parts.rest));
        }
    }
    env
}

/// 代入行の構成要素
///
/// `  export KEY = "value" # comment` の場合:
/// - prefix: `  export `
/// - key: `KEY`
/// - rest: ` "value" # comment`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineParts<'a> {
    pub prefix: &'a str,
    pub key: &'a str,
    pub rest: &'a str,
}

pub(crate) fn split_assignment(line: &str) -> Option<LineParts<'_>> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let mut key_start = line.len() - trimmed.len();
    if let Some(after_export) = trimmed.strip_prefix("export ") {
        key_start += trimmed.len() - after_export.trim_start().len();
    }

    let body = &line[key_start..];
    let eq = body.find('=')?;
    let key = body[..eq].trim_end();
    if !is_valid_key(key) {
        return None;
    }

    Some(LineParts {
        prefix: &line[..key_start],
        key,
        rest: &body[eq + 1..],
    })
}

/// キー名の妥当性チェック（`[A-Za-z_][A-Za-z0-9_]*`）
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 値からクォートと行末コメントを取り除く
fn clean_value(raw: &str) -> String {
    let value = raw.trim();

    if let Some(quote) = value.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let inner = &value[1..];
        return match closing_quote(inner, quote) {
            Some(end) if quote == '"' => unescape(&inner[..end]),
            Some(end) => inner[..end].to_string(),
            None => inner.trim().to_string(),
        };
    }

    match value.find('#') {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// 閉じクォートの位置（ダブルクォートではバックスラッシュの次の文字を飛ばす）
fn closing_quote(inner: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        if escaped {
            escaped = false;
        } else if quote == '"' && c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some(i);
        }
    }
    None
}

/// `\"` と `\\` だけを戻す（Windows パスの `\` はそのまま）
fn unescape(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next @ ('"' | '\\')) = chars.peek().copied() {
                out.push(next);
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// 書き込み用に値をクォートする（`clean_value` で元に戻せる形）
///
/// - 空白・`#` を含む、またはクォートで始まる値だけクォートする
/// - `"` も `\` も含まなければダブルクォート
/// - `'` を含まなければシングルクォート（中身はそのまま）
/// - どちらも含む場合はダブルクォートで `\"` `\\` をエスケープ
pub(crate) fn quote_value(value: &str) -> String {
    let needs_quote = value.starts_with(['"', '\'']) || value.chars().any(|c| c.is_whitespace() || c == '#');
    if !needs_quote {
        value.to_string()
    } else if !value.contains(['"', '\\']) {
        format!("\"{}\"", value)
    } else if !value.contains('\'') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// 代入行の行末コメント（先頭の空白を含む）を探す
pub(crate) fn trailing_comment(rest: &str) -> &str {
    let lead = rest.len() - rest.trim_start().len();
    let value = &rest[lead..];

    let search_from = match value.chars().next() {
        Some(q @ ('"' | '\'')) => match closing_quote(&value[1..], q) {
            Some(end) => end + 2,
            None => return "",
        },
        _ => 0,
    };

    let tail = &value[search_from..];
    let Some(hash) = tail.find('#') else {
        return "";
    };

    // コメント直前の空白も含めて保持する
    let ws_start = tail[..hash]
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_whitespace())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(hash);

    &tail[ws_start..]
}
