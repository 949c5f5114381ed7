//! ログブックスクレイパーライブラリ
//!
//! - 電子ログブックにログインし、検索結果のエントリから添付ファイルをダウンロード
//! - ランごとのメタデータファイルから設定値を抽出して CSV 一覧を作成
//! - 生データのキャッシュ事前取得コマンドをラン番号ごとに実行
//! - リプレイ結果のPDFをページごとのPNGに並列変換
//!
//! # 使用例
//!
//! ```rust,ignore
//! use logbook_scraper::{Credentials, LogbookService, RunConfig, RunRequest, SearchCriteria};
//! use tower::ServiceExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let criteria = SearchCriteria::new()
//!         .with("search_str", "COIN_NPS Start_Run_")
//!         .with("logbooks[0]", "84");
//!     let config = RunConfig::new(criteria).with_output_dir("./metadata_files");
//!
//!     let request = RunRequest::new(config, Credentials::new("user", "pass"));
//!     let report = LogbookService::new().oneshot(request).await.unwrap();
//!     println!("Downloaded: {}", report.downloaded.len());
//! }
//! ```

pub mod config;
pub mod convert;
pub mod error;
pub mod filter;
pub mod logbook;
pub mod metadata;
pub mod prefetch;
pub mod runner;
pub mod service;
pub mod traits;

// 主要な型をリエクスポート
pub use config::{CliOverrides, LogbookConfig, OutputLayout, RunConfig, SearchCriteria};
pub use error::LogbookError;
pub use filter::FilterPolicy;
pub use logbook::{Attachment, Credentials, HttpLogbookClient, SearchResult, SessionToken};
pub use runner::{LogbookRun, RunReport, RunState};
pub use service::{LogbookService, RunRequest};
pub use traits::LogbookApi;
