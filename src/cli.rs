use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use logbook_scraper::config::CliOverrides;
use logbook_scraper::convert::{self, ConvertConfig};
use logbook_scraper::metadata::{self, ExtractOptions};
use logbook_scraper::prefetch::{self, PrefetchConfig};

#[derive(Debug, Parser)]
#[command(name = "logbook-scraper", version, about = "電子ログブック検索・添付ファイル取得ツール")]
pub struct Cli {
    /// ログレベル（例: debug, info,logbook_scraper=debug）。RUST_LOG より優先
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// ログブックを検索し、該当エントリの添付ファイルをダウンロードする
    Search(SearchArgs),
    /// ランごとのメタデータから設定値を抽出し、設定ごとの CSV を作る
    Extract(ExtractArgs),
    /// ラン番号ごとにキャッシュ事前取得コマンドを実行する
    Prefetch(PrefetchArgs),
    /// リプレイ結果のPDFをPNGに一括変換する（--check-only で破損確認のみ）
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// 設定ファイル（TOML / JSON）。未指定なら ./logbook.toml があれば使う
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// 検索条件の上書き（複数指定可）
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// 検索文字列（search_str）
    #[arg(long)]
    pub search_str: Option<String>,

    /// 検索開始日時（YYYY-MM-DD HH:MM）
    #[arg(long)]
    pub start_date: Option<String>,

    /// 検索終了日時（YYYY-MM-DD HH:MM）
    #[arg(long)]
    pub end_date: Option<String>,

    /// 検索値と完全一致するエントリだけを残す
    #[arg(long)]
    pub strict: bool,

    /// 添付ファイルの保存先
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// HTTPリクエストのタイムアウト（秒）
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// ランごとのフォルダに保存する（例: COIN_NPS_Start_Run_{run}）
    #[arg(long, value_name = "TEMPLATE")]
    pub run_folder: Option<String>,

    /// タイトルからラン番号を取り出す正規表現
    #[arg(long, value_name = "REGEX")]
    pub run_pattern: Option<String>,

    /// ログインユーザー名
    #[arg(long, env = "LOGBOOK_USERNAME")]
    pub username: Option<String>,

    /// エントリ一覧を表示しない
    #[arg(short, long)]
    pub quiet: bool,

    /// 実行結果を JSON で出力する
    #[arg(long)]
    pub json: bool,
}

impl SearchArgs {
    /// 個別オプションは --set より優先する
    pub fn overrides(&self) -> CliOverrides {
        let mut search: BTreeMap<String, String> = self.set.iter().cloned().collect();
        for (key, value) in [
            ("search_str", &self.search_str),
            ("start_date", &self.start_date),
            ("end_date", &self.end_date),
        ] {
            if let Some(value) = value {
                search.insert(key.to_string(), value.clone());
            }
        }

        CliOverrides {
            search,
            output_dir: self.output_dir.clone(),
            strict: self.strict,
            timeout_secs: self.timeout,
            run_folder: self.run_folder.clone(),
            run_pattern: self.run_pattern.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// ランフォルダが並ぶディレクトリ
    #[arg(long, value_name = "DIR")]
    pub metadata_dir: PathBuf,

    /// CSV の出力先。未指定なら metadata-dir と同じ階層の `<field>` ディレクトリ
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// 抽出するフィールド名
    #[arg(long, default_value = metadata::DEFAULT_FIELD)]
    pub field: String,

    /// ランフォルダ内のメタデータファイル名
    #[arg(long, default_value = metadata::DEFAULT_FILE_NAME)]
    pub file_name: String,

    /// ランフォルダ名の接頭辞
    #[arg(long, default_value = metadata::DEFAULT_FOLDER_PREFIX)]
    pub folder_prefix: String,
}

impl ExtractArgs {
    pub fn options(&self) -> ExtractOptions {
        ExtractOptions {
            field: self.field.clone(),
            file_name: self.file_name.clone(),
            folder_prefix: self.folder_prefix.clone(),
        }
    }

    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| {
            let parent = self
                .metadata_dir
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            parent.join(metadata::sanitize_name(&self.field))
        })
    }
}

/// `4001` または `4001-4010`
#[derive(Debug, Clone)]
pub struct RunSpec(pub Vec<u32>);

fn parse_run_spec(s: &str) -> Result<RunSpec, String> {
    prefetch::parse_run_spec(s).map(RunSpec)
}

#[derive(Debug, Args)]
pub struct PrefetchArgs {
    /// キャッシュ取得コマンド
    #[arg(long, default_value = prefetch::DEFAULT_PROGRAM)]
    pub program: String,

    /// キャッシュ保持日数
    #[arg(long, default_value_t = prefetch::DEFAULT_RETENTION_DAYS)]
    pub retention_days: u32,

    /// 取得対象パス（`{run}` をラン番号に置換）
    #[arg(long, default_value = prefetch::DEFAULT_PATH_TEMPLATE)]
    pub path_template: String,

    /// ラン番号または範囲（例: 4001 4005-4010）
    #[arg(required = true, value_name = "RUN", value_parser = parse_run_spec)]
    pub runs: Vec<RunSpec>,
}

impl PrefetchArgs {
    pub fn config(&self) -> PrefetchConfig {
        PrefetchConfig {
            program: self.program.clone(),
            retention_days: self.retention_days,
            path_template: self.path_template.clone(),
        }
    }

    pub fn run_numbers(&self) -> Vec<u32> {
        self.runs.iter().flat_map(|spec| spec.0.iter().copied()).collect()
    }
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// リプレイフォルダが並ぶディレクトリ
    #[arg(value_name = "PARENT_DIR")]
    pub parent_dir: PathBuf,

    /// 出力PNGのファイル名一覧（1行1ファイル、ページ順）
    #[arg(value_name = "FILENAME_LIST", required_unless_present = "check_only")]
    pub filename_list: Option<PathBuf>,

    /// 変換解像度
    #[arg(long, default_value_t = convert::DEFAULT_DPI)]
    pub dpi: u32,

    /// 同時に変換するPDF数（既定: CPU数）
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// 変換せずにPDFが読めるかだけ確認する
    #[arg(long)]
    pub check_only: bool,

    /// 変換コマンド
    #[arg(long, default_value = convert::DEFAULT_PROGRAM)]
    pub program: String,

    /// 破損確認コマンド
    #[arg(long, default_value = convert::DEFAULT_CHECK_PROGRAM)]
    pub check_program: String,

    /// リプレイフォルダ名の接頭辞
    #[arg(long, default_value = convert::DEFAULT_FOLDER_PREFIX)]
    pub folder_prefix: String,

    /// 変換開始に必要な空き容量（GB）
    #[arg(long, value_name = "GB", default_value_t = convert::DEFAULT_MIN_FREE_GB)]
    pub min_free_gb: u64,
}

impl ConvertArgs {
    pub fn config(&self) -> ConvertConfig {
        ConvertConfig {
            program: self.program.clone(),
            check_program: self.check_program.clone(),
            dpi: self.dpi,
            workers: self.workers.unwrap_or_else(num_cpus::get).max(1),
            folder_prefix: self.folder_prefix.clone(),
            min_free_bytes: self.min_free_gb.saturating_mul(1024 * 1024 * 1024),
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}
