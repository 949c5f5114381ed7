//! ログブック関連の型定義

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// ログイン認証情報
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// ログイン成功後に得られるセッショントークン
///
/// 中身はサーバが発行したセッションクッキー（`name=value; ...`）。
/// 空の場合はクライアントのクッキーストアに任せる。
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({} bytes)", self.0.len())
    }
}

/// 添付ファイル記述子
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// 保存時のファイル名（URL末尾のセグメント）
    pub name: String,
    /// 取得先URL
    pub url: String,
}

/// 検索結果の1エントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// エントリ番号（`/entry/<id>`）
    pub id: String,
    pub title: String,
    /// エントリページの絶対URL
    pub url: String,
    /// 一覧表のセル値。`title` は常に含まれる
    pub fields: BTreeMap<String, String>,
    /// 既知の添付ファイル。空の場合はエントリページから取得する
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl SearchResult {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        let title = title.into();
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), title.clone());
        Self {
            id: id.into(),
            title,
            url: url.into(),
            fields,
            attachments: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// 添付ファイル1件のダウンロード失敗記録
#[derive(Debug, Clone, Serialize)]
pub struct DownloadFailure {
    pub entry_id: String,
    /// 添付一覧の取得自体に失敗した場合は `None`
    pub attachment: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("user", "secret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("user"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_search_result_builder() {
        let result = SearchResult::new("42", "COIN_NPS Start_Run_4001", "https://x/entry/42")
            .with_field("run_period", "NPS")
            .with_attachment(Attachment {
                name: "a.dat".into(),
                url: "https://x/files/a.dat".into(),
            });

        assert_eq!(result.field("title"), Some("COIN_NPS Start_Run_4001"));
        assert_eq!(result.field("run_period"), Some("NPS"));
        assert_eq!(result.attachments.len(), 1);
    }
}
