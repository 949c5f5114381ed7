//! 1回の実行（ログイン → 検索 → 絞り込み → ダウンロード）を状態遷移として駆動する

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{RunConfig, SearchCriteria};
use crate::error::LogbookError;
use crate::logbook::{Attachment, Credentials, DownloadFailure, SearchResult, SessionToken};
use crate::traits::LogbookApi;

/// 検索結果一覧の保存ファイル名
pub const RESULTS_INDEX_FILE: &str = "logbook_results.txt";

/// 実行全体の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Unauthenticated,
    Authenticated,
    Searching,
    Filtering,
    Downloading,
    Done,
    Failed,
}

impl RunState {
    /// 許可された遷移か。`Failed` へはログインと検索の段階からのみ遷移できる
    pub fn can_transition(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticated)
                | (Unauthenticated, Failed)
                | (Authenticated, Searching)
                | (Authenticated, Failed)
                | (Searching, Filtering)
                | (Searching, Downloading)
                | (Searching, Failed)
                | (Filtering, Downloading)
                | (Downloading, Done)
        )
    }
}

/// 実行結果
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    /// サーバが返したエントリ数
    pub entries_found: usize,
    /// 絞り込み後に残ったエントリ
    pub entries: Vec<SearchResult>,
    pub downloaded: Vec<PathBuf>,
    pub failures: Vec<DownloadFailure>,
    /// ラン単位保存でラン番号が取れず保存しなかったエントリID
    pub skipped: Vec<String>,
    pub results_index: Option<PathBuf>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn entries_kept(&self) -> usize {
        self.entries.len()
    }
}

/// 検索結果をページ単位で遅延取得する。一度読み切ったら再利用できない
pub struct SearchPages<'a, A: LogbookApi + ?Sized> {
    api: &'a A,
    session: &'a SessionToken,
    criteria: &'a SearchCriteria,
    next_page: u32,
    max_pages: u32,
    seen: HashSet<String>,
    finished: bool,
}

impl<'a, A: LogbookApi + ?Sized> SearchPages<'a, A> {
    pub fn new(
        api: &'a A,
        session: &'a SessionToken,
        criteria: &'a SearchCriteria,
        max_pages: u32,
    ) -> Self {
        Self {
            api,
            session,
            criteria,
            next_page: 0,
            max_pages,
            seen: HashSet::new(),
            finished: false,
        }
    }

    /// 次のページ。空ページ・上限到達・既出エントリのみのページで終了する
    pub async fn next_page(&mut self) -> Result<Option<Vec<SearchResult>>, LogbookError> {
        if self.finished || self.next_page >= self.max_pages {
            self.finished = true;
            return Ok(None);
        }

        let page = self.next_page;
        let entries = self
            .api
            .search_page(self.session, self.criteria, page)
            .await
            .map_err(|e| match e {
                LogbookError::Search(_) => e,
                other => LogbookError::Search(other.to_string()),
            })?;
        self.next_page += 1;

        let fresh: Vec<SearchResult> = entries
            .into_iter()
            .filter(|entry| self.seen.insert(entry.id.clone()))
            .collect();

        if fresh.is_empty() {
            debug!("No new entries on page {}, pagination complete", page);
            self.finished = true;
            return Ok(None);
        }

        info!("Found {} results on page {}", fresh.len(), page);
        Ok(Some(fresh))
    }
}

/// 1回の実行コンテキスト。API・設定・状態をまとめて各段階に渡す
pub struct LogbookRun<'a, A: LogbookApi + ?Sized> {
    api: &'a A,
    config: &'a RunConfig,
    state: RunState,
}

impl<'a, A: LogbookApi + ?Sized> LogbookRun<'a, A> {
    pub fn new(api: &'a A, config: &'a RunConfig) -> Self {
        Self {
            api,
            config,
            state: RunState::Unauthenticated,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Run state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: LogbookError) -> LogbookError {
        error!("Run failed during {}: {}", err.stage(), err);
        self.transition(RunState::Failed);
        err
    }

    /// ログイン。失敗は致命的でリトライしない
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<SessionToken, LogbookError> {
        match self.api.login(credentials).await {
            Ok(session) => {
                self.transition(RunState::Authenticated);
                Ok(session)
            }
            Err(e) => {
                let err = match e {
                    LogbookError::Authentication(_) => e,
                    other => LogbookError::Authentication(other.to_string()),
                };
                Err(self.fail(err))
            }
        }
    }

    /// 全ページを順に取得する。どのページの失敗でも実行を中断する
    pub async fn search(&mut self, session: &SessionToken) -> Result<Vec<SearchResult>, LogbookError> {
        self.transition(RunState::Searching);
        let config = self.config;
        info!("Searching with {} criteria fields", config.criteria.len());

        let mut pages = SearchPages::new(self.api, session, &config.criteria, config.service.max_pages);

        let mut results = Vec::new();
        loop {
            match pages.next_page().await {
                Ok(Some(entries)) => results.extend(entries),
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }

        info!("Search returned {} entries", results.len());
        Ok(results)
    }

    /// 厳密一致フィルタ（無効なら何もしない）
    pub fn filter(&mut self, results: Vec<SearchResult>) -> Vec<SearchResult> {
        if !self.config.filter.enabled {
            return results;
        }

        self.transition(RunState::Filtering);
        let before = results.len();
        let kept = self.config.filter.apply(&self.config.criteria, results);
        info!("Strict filter kept {}/{} entries", kept.len(), before);
        kept
    }

    /// 添付ファイルを順にダウンロードする。失敗はファイル単位で記録して続行する
    pub async fn download_all(
        &mut self,
        session: &SessionToken,
        entries: &[SearchResult],
        report: &mut RunReport,
    ) {
        self.transition(RunState::Downloading);

        let output_dir = &self.config.output_dir;
        let api = self.api;
        if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
            warn!("Failed to create output directory {:?}: {}", output_dir, e);
        }
        report.results_index = write_results_index(output_dir, entries).await;

        for (index, entry) in entries.iter().enumerate() {
            info!("Processing entry {}/{}: {}", index + 1, entries.len(), entry.title);

            let Some(entry_dir) = self.config.layout.entry_dir(output_dir, &entry.title) else {
                info!("No run number in '{}', skipping", entry.title);
                report.skipped.push(entry.id.clone());
                continue;
            };
            if entry_dir != *output_dir {
                if let Err(e) = tokio::fs::create_dir_all(&entry_dir).await {
                    warn!("Failed to create run directory {:?}: {}", entry_dir, e);
                }
            }

            let attachments = match api.attachments(session, entry).await {
                Ok(attachments) => attachments,
                Err(e) => {
                    warn!("Failed to list attachments for entry {}: {}", entry.id, e);
                    report.failures.push(DownloadFailure {
                        entry_id: entry.id.clone(),
                        attachment: None,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if attachments.is_empty() {
                info!("No attachments found for entry {}, skipping", entry.id);
                continue;
            }

            for attachment in &attachments {
                match self.download_one(session, attachment, &entry_dir).await {
                    Ok((path, bytes)) => {
                        info!("Saved {:?} ({} bytes)", path, bytes);
                        report.downloaded.push(path);
                    }
                    Err(e) => {
                        warn!("Failed to download {}: {}", attachment.name, e);
                        report.failures.push(DownloadFailure {
                            entry_id: entry.id.clone(),
                            attachment: Some(attachment.name.clone()),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn download_one(
        &self,
        session: &SessionToken,
        attachment: &Attachment,
        dir: &Path,
    ) -> Result<(PathBuf, u64), LogbookError> {
        let dest = dir.join(safe_file_name(&attachment.name)?);
        let bytes = self.api.download(session, attachment, &dest).await?;
        Ok((dest, bytes))
    }

    /// 一括実行（authenticate → search → filter → download）
    pub async fn execute(&mut self, credentials: &Credentials) -> Result<RunReport, LogbookError> {
        let started = Instant::now();

        let session = self.authenticate(credentials).await?;
        let found = self.search(&session).await?;

        let mut report = RunReport {
            entries_found: found.len(),
            ..Default::default()
        };
        let kept = self.filter(found);

        self.download_all(&session, &kept, &mut report).await;
        report.entries = kept;
        self.transition(RunState::Done);

        report.elapsed = started.elapsed();
        info!(
            "Run complete: {} downloaded, {} failed, {:.2}s",
            report.downloaded.len(),
            report.failures.len(),
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }
}

/// 添付ファイル名をそのまま出力先直下のファイル名として使えるか検証する
fn safe_file_name(name: &str) -> Result<&str, LogbookError> {
    let is_plain = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
    if name.is_empty() || !is_plain || name.contains(['/', '\\']) {
        return Err(LogbookError::Download(format!("不正なファイル名です: {:?}", name)));
    }
    Ok(name)
}

/// `タイトル - URL` を1行ずつ書き出す。失敗しても実行は続ける
async fn write_results_index(output_dir: &Path, entries: &[SearchResult]) -> Option<PathBuf> {
    let path = output_dir.join(RESULTS_INDEX_FILE);
    let content: String = entries
        .iter()
        .map(|e| format!("{} - {}\n", e.title, e.url))
        .collect();

    match tokio::fs::write(&path, content).await {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Failed to write results index {:?}: {}", path, e);
            None
        }
    }
}
