use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::Service;
use tracing::info;

use crate::config::RunConfig;
use crate::error::LogbookError;
use crate::logbook::{Credentials, HttpLogbookClient};
use crate::runner::{LogbookRun, RunReport};

/// 検索・ダウンロード実行リクエスト
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: RunConfig,
    pub credentials: Credentials,
}

impl RunRequest {
    pub fn new(config: RunConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
        }
    }
}

/// tower::Serviceを実装したログブックサービス
///
/// リクエストごとに HTTP クライアント（クッキーストア）を新しく作るので、
/// 実行間でセッションは共有されない。
#[derive(Debug, Clone, Default)]
pub struct LogbookService {}

impl LogbookService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service<RunRequest> for LogbookService {
    type Response = RunReport;
    type Error = LogbookError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RunRequest) -> Self::Future {
        info!(
            "Run request received: user={}, output={:?}",
            req.credentials.username, req.config.output_dir
        );

        Box::pin(async move {
            let client = HttpLogbookClient::new(&req.config)?;
            let mut run = LogbookRun::new(&client, &req.config);
            let report = run.execute(&req.credentials).await?;

            info!(
                "Run finished: kept={}, downloaded={}, failures={}",
                report.entries_kept(),
                report.downloaded.len(),
                report.failures.len()
            );
            Ok(report)
        })
    }
}
