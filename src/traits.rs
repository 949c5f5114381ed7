use std::path::Path;

use async_trait::async_trait;

use crate::config::SearchCriteria;
use crate::error::LogbookError;
use crate::logbook::{Attachment, Credentials, SearchResult, SessionToken};

/// ログブックサービスとのやり取り
#[async_trait]
pub trait LogbookApi: Send + Sync {
    /// ログイン実行
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken, LogbookError>;

    /// 検索結果の1ページを取得（空なら最終ページ）
    async fn search_page(
        &self,
        session: &SessionToken,
        criteria: &SearchCriteria,
        page: u32,
    ) -> Result<Vec<SearchResult>, LogbookError>;

    /// エントリの添付ファイル一覧
    async fn attachments(
        &self,
        _session: &SessionToken,
        entry: &SearchResult,
    ) -> Result<Vec<Attachment>, LogbookError> {
        Ok(entry.attachments.clone())
    }

    /// 添付ファイルを `dest` に保存し、書き込んだバイト数を返す
    async fn download(
        &self,
        session: &SessionToken,
        attachment: &Attachment,
        dest: &Path,
    ) -> Result<u64, LogbookError>;
}
