use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogbookError {
    #[error("設定エラー: {0}")]
    Configuration(String),

    #[error("認証エラー: {0}")]
    Authentication(String),

    #[error("検索エラー: {0}")]
    Search(String),

    #[error("ダウンロードエラー: {0}")]
    Download(String),

    #[error("プリフェッチエラー: {0}")]
    Prefetch(String),

    #[error("PDF変換エラー: {0}")]
    Convert(String),

    #[error("設定ファイル解析エラー: {0}")]
    ConfigParse(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}

impl LogbookError {
    /// 実行全体を中断すべきエラーか
    ///
    /// ダウンロード・プリフェッチ・PDF変換の失敗はファイル/ラン単位で記録して続行する。
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Download(_) | Self::Prefetch(_) | Self::Convert(_))
    }

    /// エラーが発生した段階名（ログ・終了メッセージ用）
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::ConfigParse(_) => "configuration",
            Self::Authentication(_) => "authentication",
            Self::Search(_) => "search",
            Self::Download(_) => "download",
            Self::Prefetch(_) => "prefetch",
            Self::Convert(_) => "convert",
            Self::FileIO(_) => "filesystem",
        }
    }
}

impl From<toml::de::Error> for LogbookError {
    fn from(e: toml::de::Error) -> Self {
        Self::ConfigParse(e.to_string())
    }
}

impl From<serde_json::Error> for LogbookError {
    fn from(e: serde_json::Error) -> Self {
        Self::ConfigParse(e.to_string())
    }
}
