//! 設定の読み込みと3層マージ（CLI > 設定ファイル > 組み込みデフォルト）

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LogbookError;
use crate::filter::FilterPolicy;

pub const DEFAULT_BASE_URL: &str = "https://logbooks.jlab.org/";
pub const DEFAULT_CONFIG_PATH: &str = "logbook.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "metadata_files";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_PAGES: u32 = 200;
/// エントリタイトル中のラン番号
pub const DEFAULT_RUN_PATTERN: &str = r"Start_Run_(\d+)";
/// メタデータ抽出側が読むランフォルダ名
pub const DEFAULT_RUN_FOLDER: &str = "COIN_NPS_Start_Run_{run}";

/// 検索期間フィールドの書式（例: `2023-09-01 00:00`）
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M";
const DATE_FIELDS: [&str; 2] = ["start_date", "end_date"];

/// 検索条件（フィールド名 → 検索値）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchCriteria(BTreeMap<String, String>);

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for SearchCriteria {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// リモートサービスの接続設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub login_path: String,
    pub search_path: String,
    pub timeout_secs: u64,
    /// 取得するページ数の上限
    pub max_pages: u32,
    /// ダウンロード対象とする添付ファイルの拡張子
    pub attachment_extensions: Vec<String>,
    pub user_agent: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: "entries?destination=entries".to_string(),
            search_path: "entries".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_pages: DEFAULT_MAX_PAGES,
            attachment_extensions: vec![".dat".to_string(), ".results".to_string()],
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
        }
    }
}

/// 保存レイアウト（`[layout]`）。`run_folder` 未指定なら出力先直下に保存する
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// ランごとのフォルダ名。`{run}` をラン番号に置き換える
    pub run_folder: Option<String>,
    /// タイトルからラン番号を取り出す正規表現（最初のグループ）
    pub run_pattern: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            run_folder: None,
            run_pattern: DEFAULT_RUN_PATTERN.to_string(),
        }
    }
}

/// 確定した保存レイアウト
#[derive(Debug, Clone, Default)]
pub enum OutputLayout {
    /// すべて出力先直下
    #[default]
    Flat,
    /// `<出力先>/<template の {run} を置換>/`。ラン番号の無いエントリは保存しない
    RunFolders { template: String, pattern: Regex },
}

impl OutputLayout {
    pub fn run_folders(template: impl Into<String>, pattern: &str) -> Result<Self, LogbookError> {
        let template = template.into();
        if !template.contains("{run}") {
            return Err(LogbookError::Configuration(format!(
                "run_folder に {{run}} が含まれていません: {:?}",
                template
            )));
        }
        if template.contains(['/', '\\']) || template.contains("..") {
            return Err(LogbookError::Configuration(format!(
                "run_folder はフォルダ名1つで指定してください: {:?}",
                template
            )));
        }

        let pattern = Regex::new(pattern).map_err(|e| {
            LogbookError::Configuration(format!("run_pattern が不正です: {:?}: {}", pattern, e))
        })?;
        if pattern.captures_len() < 2 {
            return Err(LogbookError::Configuration(
                "run_pattern にはラン番号を取り出すグループが必要です".into(),
            ));
        }
        Ok(Self::RunFolders { template, pattern })
    }

    /// タイトルからラン番号を取り出す
    pub fn run_number(&self, title: &str) -> Option<u32> {
        match self {
            Self::Flat => None,
            Self::RunFolders { pattern, .. } => pattern
                .captures(title)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
        }
    }

    /// エントリの保存先ディレクトリ。ラン単位でラン番号が無ければ `None`
    pub fn entry_dir(&self, output_dir: &Path, title: &str) -> Option<PathBuf> {
        match self {
            Self::Flat => Some(output_dir.to_path_buf()),
            Self::RunFolders { template, .. } => {
                let run = self.run_number(title)?;
                Some(output_dir.join(template.replace("{run}", &run.to_string())))
            }
        }
    }
}

/// 設定ファイルの内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogbookConfig {
    pub output_dir: Option<PathBuf>,
    pub search: BTreeMap<String, String>,
    pub filter: FilterPolicy,
    pub service: ServiceConfig,
    pub layout: LayoutConfig,
}

impl LogbookConfig {
    /// 設定ファイルを読み込む（拡張子 `.json` なら JSON、それ以外は TOML）
    pub fn load(path: &Path) -> Result<Self, LogbookError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LogbookError::Configuration(format!("{} を読み込めません: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// 明示されたパスは必須、未指定ならデフォルトパスがあれば読み込む
    pub fn load_optional(path: Option<&Path>) -> Result<Option<Self>, LogbookError> {
        match path {
            Some(path) => Self::load(path).map(Some),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::load(default_path).map(Some)
                } else {
                    debug!("No config file at {:?}", default_path);
                    Ok(None)
                }
            }
        }
    }
}

/// コマンドラインからの上書き値
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub search: BTreeMap<String, String>,
    pub output_dir: Option<PathBuf>,
    pub strict: bool,
    pub timeout_secs: Option<u64>,
    pub run_folder: Option<String>,
    pub run_pattern: Option<String>,
}

/// 実行時に確定した設定。起動時に一度だけ組み立てる
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub criteria: SearchCriteria,
    pub output_dir: PathBuf,
    pub filter: FilterPolicy,
    pub service: ServiceConfig,
    pub timeout: Duration,
    pub layout: OutputLayout,
}

impl RunConfig {
    pub fn new(criteria: SearchCriteria) -> Self {
        let service = ServiceConfig::default();
        Self {
            criteria,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            filter: FilterPolicy::default(),
            timeout: Duration::from_secs(service.timeout_secs),
            service,
            layout: OutputLayout::Flat,
        }
    }

    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    pub fn with_filter(mut self, filter: FilterPolicy) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.service.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// 一覧表示用の組み込みデフォルト。検索条件そのものは含まない
pub fn builtin_search_defaults() -> BTreeMap<String, String> {
    [
        ("group_by", "SHIFT"),
        ("listing_format", "table"),
        ("entries_per_page", "100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// 3つのマップを左から順に重ねる。同じキーは後の層が勝つ
pub fn merge_layers(
    defaults: &BTreeMap<String, String>,
    file: &BTreeMap<String, String>,
    cli: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();
    for layer in [file, cli] {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// 設定ファイルとCLI上書きから `RunConfig` を確定する
pub fn resolve(
    file: Option<&LogbookConfig>,
    overrides: &CliOverrides,
) -> Result<RunConfig, LogbookError> {
    let empty = BTreeMap::new();
    let file_search = file.map(|f| &f.search).unwrap_or(&empty);

    if file_search.is_empty() && overrides.search.is_empty() {
        return Err(LogbookError::Configuration(
            "検索条件がありません（設定ファイルの [search] または --set/--search-str を指定してください）"
                .into(),
        ));
    }

    let merged = merge_layers(&builtin_search_defaults(), file_search, &overrides.search);
    validate_dates(&merged)?;

    let service = file.map(|f| f.service.clone()).unwrap_or_default();
    let output_dir = overrides
        .output_dir
        .clone()
        .or_else(|| file.and_then(|f| f.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

    let mut filter = file.map(|f| f.filter.clone()).unwrap_or_default();
    if overrides.strict {
        filter.enabled = true;
    }

    let timeout = Duration::from_secs(overrides.timeout_secs.unwrap_or(service.timeout_secs));

    let layout_config = file.map(|f| f.layout.clone()).unwrap_or_default();
    let run_pattern = overrides
        .run_pattern
        .as_deref()
        .unwrap_or(&layout_config.run_pattern);
    let layout = match overrides.run_folder.clone().or(layout_config.run_folder.clone()) {
        Some(template) => OutputLayout::run_folders(template, run_pattern)?,
        None => OutputLayout::Flat,
    };

    Ok(RunConfig {
        criteria: merged.into(),
        output_dir,
        filter,
        service,
        timeout,
        layout,
    })
}

fn validate_dates(criteria: &BTreeMap<String, String>) -> Result<(), LogbookError> {
    let mut parsed = Vec::with_capacity(DATE_FIELDS.len());
    for field in DATE_FIELDS {
        match criteria.get(field) {
            Some(value) => {
                let date = NaiveDateTime::parse_from_str(value, DATE_FORMAT).map_err(|e| {
                    LogbookError::Configuration(format!(
                        "{} の日時形式が不正です（YYYY-MM-DD HH:MM）: {:?}: {}",
                        field, value, e
                    ))
                })?;
                parsed.push(Some(date));
            }
            None => parsed.push(None),
        }
    }

    if let [Some(start), Some(end)] = parsed[..] {
        if start > end {
            return Err(LogbookError::Configuration(format!(
                "start_date ({}) が end_date ({}) より後です",
                start, end
            )));
        }
    }
    Ok(())
}
