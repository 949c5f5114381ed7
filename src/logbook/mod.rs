//! ログブックスクレイパーモジュール
//!
//! ログイン → 検索 → エントリ一覧 → 添付ファイル取得 を HTTP で行う

mod client;
pub mod html;
mod types;

pub use client::HttpLogbookClient;
pub use types::{Attachment, Credentials, DownloadFailure, SearchResult, SessionToken};
